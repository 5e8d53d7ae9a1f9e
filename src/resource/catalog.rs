use std::{collections::HashMap, sync::Arc, time::SystemTime};

use crate::{
    prelude::{Error, StrictPath},
    scan::template::split_composite_rule,
};

/// One save-location rule for a catalog title.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogRule {
    pub system: String,
    pub location: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogEntry {
    pub title: String,
    pub rules: Vec<CatalogRule>,
}

impl CatalogEntry {
    pub fn windows_rules(&self) -> Vec<&CatalogRule> {
        self.rules
            .iter()
            .filter(|rule| rule.system.eq_ignore_ascii_case("windows"))
            .collect()
    }
}

/// External catalog of known titles and their save-location rules.
/// The document root is either a bare array of entries or an object with a
/// `games` array. Entries with missing or empty titles are dropped;
/// composite location strings are split into independent rules up front.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn parse(content: &str) -> Result<Self, Error> {
        let document: serde_json::Value = serde_json::from_str(content).map_err(|e| Error::CatalogInvalid {
            why: e.to_string(),
        })?;

        let raw_entries = match &document {
            serde_json::Value::Array(entries) => entries.as_slice(),
            serde_json::Value::Object(fields) => match fields.get("games") {
                Some(serde_json::Value::Array(entries)) => entries.as_slice(),
                _ => {
                    return Err(Error::CatalogInvalid {
                        why: "document object has no `games` array".to_string(),
                    })
                }
            },
            _ => {
                return Err(Error::CatalogInvalid {
                    why: "document root is neither an array nor an object".to_string(),
                })
            }
        };

        let mut entries = vec![];
        for raw in raw_entries {
            if let Some(entry) = Self::parse_entry(raw) {
                entries.push(entry);
            }
        }

        Ok(Self { entries })
    }

    fn parse_entry(raw: &serde_json::Value) -> Option<CatalogEntry> {
        let title = raw.get("title")?.as_str()?.trim();
        if title.is_empty() {
            log::debug!("dropping catalog entry with empty title");
            return None;
        }

        let raw_rules = raw
            .get("save_game_data_locations")
            .or_else(|| raw.get("saveLocations"))
            .and_then(|x| x.as_array());

        let mut rules = vec![];
        if let Some(raw_rules) = raw_rules {
            for raw_rule in raw_rules {
                let system = raw_rule
                    .get("system")
                    .and_then(|x| x.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                let Some(location) = raw_rule.get("location").and_then(|x| x.as_str()) else {
                    continue;
                };
                for segment in split_composite_rule(location.trim()) {
                    rules.push(CatalogRule {
                        system: system.clone(),
                        location: segment,
                    });
                }
            }
        }

        Some(CatalogEntry {
            title: title.to_string(),
            rules,
        })
    }

    pub fn titles(&self) -> Vec<&str> {
        self.entries.iter().map(|x| x.title.as_str()).collect()
    }

    pub fn find(&self, title: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|x| x.title == title)
    }
}

struct CachedCatalog {
    modified: SystemTime,
    catalog: Arc<Catalog>,
}

/// Parsed catalogs keyed by absolute path, reloaded when the file's
/// modification time changes.
#[derive(Default)]
pub struct CatalogCache {
    entries: HashMap<String, CachedCatalog>,
}

impl CatalogCache {
    pub fn load(&mut self, path: &StrictPath) -> Result<Arc<Catalog>, Error> {
        if !path.is_file() {
            return Err(Error::CatalogMissing { path: path.render() });
        }

        let key = path.normalized_key();
        let modified = path.modified();

        if let (Some(modified), Some(cached)) = (modified, self.entries.get(&key)) {
            if cached.modified == modified {
                log::trace!("catalog cache hit: {key}");
                return Ok(cached.catalog.clone());
            }
        }

        log::debug!("loading catalog: {key}");
        let content = path.try_read().map_err(|e| Error::CatalogInvalid {
            why: e.to_string(),
        })?;
        let catalog = Arc::new(Catalog::parse(&content)?);

        if let Some(modified) = modified {
            self.entries.insert(
                key,
                CachedCatalog {
                    modified,
                    catalog: catalog.clone(),
                },
            );
        }

        Ok(catalog)
    }
}
