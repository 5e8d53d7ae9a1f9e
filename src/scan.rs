pub mod metadata;
pub mod registry;
pub mod steam;
pub mod template;
pub mod title;

use std::collections::{BTreeMap, VecDeque};

use itertools::Itertools;

use crate::{
    library::LocationKind,
    prelude::{Error, StrictPath, SAVE_LIKE_EXTENSIONS},
    resource::catalog::CatalogCache,
    scan::{
        metadata::{ExeMetadata, ExeMetadataAdapter},
        registry::{RegistryAdapter, RegistryItem},
        steam::SteamEnv,
        template::TemplateContext,
    },
};

/// External adapters must give up after this long; a timeout is treated as
/// absence of data.
pub const ADAPTER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(4);
pub const ADAPTER_OUTPUT_LIMIT: usize = 8 * 1024 * 1024;

const DEBUG_SAMPLE_CAP: usize = 40;
const DESCENDANT_FILE_DEPTH: u32 = 2;
const DESCENDANT_ENTRY_CAP: usize = 300;

const SCORE_EXISTS: f64 = 0.55;
const SCORE_FILE: f64 = 0.15;
const SCORE_SAVE_EXTENSION: f64 = 0.25;
const SCORE_DIRECTORY: f64 = 0.10;
const SCORE_NON_EMPTY_DIRECTORY: f64 = 0.10;
const SCORE_SAVE_DESCENDANTS: f64 = 0.20;
const SCORE_NAME_HINT: f64 = 0.05;
const SCORE_REGISTRY: f64 = 0.05;

/// Runs `operation` on a worker and abandons it after `limit`.
pub(crate) fn with_timeout<T: Send + 'static>(
    limit: std::time::Duration,
    operation: impl FnOnce() -> T + Send + 'static,
) -> Option<T> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(operation());
    });
    rx.recv_timeout(limit).ok()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionStatus {
    Matched,
    #[default]
    NoMatch,
    NoWindowsLocations,
    NoValidCandidates,
    CatalogMissing,
    CatalogInvalid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    #[default]
    Filesystem,
    Registry,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub path: StrictPath,
    pub score: f64,
    #[serde(rename = "type")]
    pub kind: LocationKind,
    pub source: CandidateSource,
    pub reasons: Vec<String>,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionDebug {
    pub queries: Vec<String>,
    pub checked_paths: Vec<String>,
    pub rule_count: usize,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub status: DetectionStatus,
    pub matched_title: Option<String>,
    pub match_score: Option<f64>,
    pub title_ambiguous: bool,
    pub candidates: Vec<Candidate>,
    pub metadata: ExeMetadata,
    pub warnings: Vec<String>,
    pub debug: DetectionDebug,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionProgress {
    pub percent: f32,
    pub processed: usize,
    pub total: usize,
    pub message: String,
    pub matched_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_samples: Option<Vec<String>>,
}

pub struct DetectionArgs<'a> {
    pub catalog_path: &'a StrictPath,
    pub game_name: &'a str,
    pub exe_path: &'a StrictPath,
    pub install_path: &'a StrictPath,
}

/// Reported percentages are clamped to 0-100 and never decrease. A
/// panicking callback is swallowed so it cannot corrupt detection.
struct ProgressReporter<'a> {
    callback: Option<&'a dyn Fn(DetectionProgress)>,
    last_percent: f32,
    matched_title: Option<String>,
    samples: Vec<String>,
}

impl<'a> ProgressReporter<'a> {
    fn new(callback: Option<&'a dyn Fn(DetectionProgress)>) -> Self {
        Self {
            callback,
            last_percent: 0.0,
            matched_title: None,
            samples: vec![],
        }
    }

    fn add_sample(&mut self, path: String) {
        if self.samples.len() < DEBUG_SAMPLE_CAP {
            self.samples.push(path);
        }
    }

    fn emit(&mut self, percent: f32, processed: usize, total: usize, message: impl Into<String>) {
        let percent = percent.clamp(0.0, 100.0).max(self.last_percent);
        self.last_percent = percent;

        let Some(callback) = self.callback else {
            return;
        };
        let update = DetectionProgress {
            percent,
            processed,
            total,
            message: message.into(),
            matched_title: self.matched_title.clone(),
            debug_samples: (!self.samples.is_empty()).then(|| self.samples.clone()),
        };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(update))).is_err() {
            log::warn!("detection progress callback panicked; continuing");
        }
    }
}

fn looks_like_path(value: &str) -> bool {
    value.contains(":\\")
        || value.contains(":/")
        || value.contains('%')
        || value.contains('\\')
        || value.starts_with('/')
}

fn has_save_like_extension(path: &std::path::Path) -> bool {
    path.extension()
        .map(|x| SAVE_LIKE_EXTENSIONS.contains(&x.to_string_lossy().to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Shallow BFS for files that look like saves, with a bound on how much of
/// the tree gets inspected.
fn has_save_like_descendant(root: &StrictPath) -> bool {
    let mut queue = VecDeque::from([(root.as_std_path_buf(), 0u32)]);
    let mut scanned = 0usize;

    while let Some((dir, depth)) = queue.pop_front() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            scanned += 1;
            if scanned > DESCENDANT_ENTRY_CAP {
                return false;
            }
            let path = entry.path();
            if path.is_dir() {
                if depth + 1 < DESCENDANT_FILE_DEPTH {
                    queue.push_back((path, depth + 1));
                }
            } else if has_save_like_extension(&path) {
                return true;
            }
        }
    }
    false
}

fn is_non_empty_dir(path: &StrictPath) -> bool {
    std::fs::read_dir(path.interpret())
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn score_path(path: StrictPath, from_registry: bool) -> Candidate {
    let mut score = SCORE_EXISTS;
    let mut reasons = vec!["path exists".to_string()];
    let kind;

    if path.is_file() {
        kind = LocationKind::File;
        score += SCORE_FILE;
        reasons.push("file location".to_string());
        if has_save_like_extension(&path.as_std_path_buf()) {
            score += SCORE_SAVE_EXTENSION;
            reasons.push("save-like extension".to_string());
        }
    } else {
        kind = LocationKind::Folder;
        score += SCORE_DIRECTORY;
        reasons.push("directory location".to_string());
        if is_non_empty_dir(&path) {
            score += SCORE_NON_EMPTY_DIRECTORY;
            reasons.push("non-empty directory".to_string());
        }
        if has_save_like_descendant(&path) {
            score += SCORE_SAVE_DESCENDANTS;
            reasons.push("save-like files detected".to_string());
        }
    }

    let key = path.normalized_key();
    if key.contains("save") || key.contains("profile") {
        score += SCORE_NAME_HINT;
        reasons.push("path mentions saves".to_string());
    }

    let source = if from_registry {
        score += SCORE_REGISTRY;
        reasons.push("resolved via registry value".to_string());
        CandidateSource::Registry
    } else {
        CandidateSource::Filesystem
    };

    Candidate {
        path: StrictPath::new(path.render()),
        score: score.min(1.0),
        kind,
        source,
        reasons,
    }
}

fn merge_candidates(found: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: BTreeMap<String, Candidate> = BTreeMap::new();
    for candidate in found {
        let key = candidate.path.normalized_key();
        match merged.get_mut(&key) {
            None => {
                merged.insert(key, candidate);
            }
            Some(existing) => {
                if candidate.score > existing.score {
                    existing.score = candidate.score;
                    existing.kind = candidate.kind;
                    existing.source = candidate.source;
                }
                for reason in candidate.reasons {
                    if !existing.reasons.contains(&reason) {
                        existing.reasons.push(reason);
                    }
                }
            }
        }
    }

    let mut candidates: Vec<Candidate> = merged.into_values().collect();
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.raw().cmp(&b.path.raw()))
    });
    candidates
}

/// Correlates a game's executable metadata and names against the catalog,
/// expands the matched entry's Windows rules, and scores every expanded
/// path that exists on disk.
pub fn detect(
    args: &DetectionArgs,
    catalogs: &mut CatalogCache,
    metadata_adapter: &dyn ExeMetadataAdapter,
    registry_adapter: &dyn RegistryAdapter,
    steam: &SteamEnv,
    progress: Option<&dyn Fn(DetectionProgress)>,
) -> DetectionResult {
    let mut reporter = ProgressReporter::new(progress);
    let mut result = DetectionResult::default();

    reporter.emit(0.0, 0, 0, "Reading executable metadata");
    let exe_metadata = metadata_adapter.read(args.exe_path).unwrap_or_default();
    if exe_metadata.is_empty() {
        result.warnings.push("executable metadata unavailable".to_string());
    }
    result.metadata = exe_metadata.clone();

    let queries: Vec<String> = [
        exe_metadata.product_name.clone(),
        exe_metadata.file_description.clone(),
        Some(args.game_name.trim().to_string()),
        args.install_path.leaf(),
        args.exe_path.file_stem(),
    ]
    .into_iter()
    .flatten()
    .filter(|x| !x.trim().is_empty())
    .unique_by(|x| x.to_lowercase())
    .collect();
    result.debug.queries = queries.clone();

    reporter.emit(5.0, 0, 0, "Matching against the catalog");
    let catalog = match catalogs.load(args.catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            log::warn!("catalog unusable: {e}");
            result.status = match e {
                Error::CatalogMissing { .. } => DetectionStatus::CatalogMissing,
                _ => DetectionStatus::CatalogInvalid,
            };
            result.warnings.push(e.to_string());
            reporter.emit(100.0, 0, 0, "Catalog unavailable");
            return result;
        }
    };

    let scored = title::score_titles(&queries, &catalog.titles());
    let Some(matched) = title::choose(scored) else {
        log::info!("[{}] no catalog title matched", args.game_name);
        result.status = DetectionStatus::NoMatch;
        reporter.emit(100.0, 0, 0, "No catalog match");
        return result;
    };
    log::info!(
        "[{}] matched catalog title {:?} (score {:.2}, ambiguous: {})",
        args.game_name,
        matched.title,
        matched.score,
        matched.ambiguous
    );
    reporter.matched_title = Some(matched.title.clone());
    result.matched_title = Some(matched.title.clone());
    result.match_score = Some(matched.score);
    result.title_ambiguous = matched.ambiguous;

    let entry = catalog.find(&matched.title).cloned().unwrap_or_default();
    let rules: Vec<_> = entry.windows_rules().into_iter().cloned().collect();
    if rules.is_empty() {
        result.status = DetectionStatus::NoWindowsLocations;
        reporter.emit(100.0, 0, 0, "No Windows save locations in the catalog entry");
        return result;
    }

    let context = TemplateContext {
        install_path: (!args.install_path.raw().trim().is_empty()).then(|| args.install_path.clone()),
        install_dir_name: args.install_path.leaf(),
        game_name: args.game_name.trim().to_string(),
        steam_roots: steam.roots.clone(),
        steam_libraries: steam.libraries.clone(),
    };

    let total = rules.len();
    result.debug.rule_count = total;
    let mut raw_candidates: Vec<(StrictPath, bool)> = vec![];

    for (index, rule) in rules.iter().enumerate() {
        reporter.emit(
            10.0 + 85.0 * index as f32 / total as f32,
            index,
            total,
            format!("Resolving {}", rule.location),
        );

        let templates: Vec<(String, bool)> = if RegistryItem::is_registry_path(&rule.location) {
            let item = RegistryItem::new(rule.location.clone());
            let values = registry_adapter.read_string_values(&item);
            if values.is_empty() {
                result
                    .warnings
                    .push(format!("registry rule yielded no values: {}", rule.location));
            }
            values
                .into_iter()
                .filter(|value| looks_like_path(value))
                .map(|value| (value, true))
                .collect()
        } else {
            vec![(rule.location.clone(), false)]
        };

        for (raw_template, from_registry) in templates {
            let mapped = template::map_wiki_tokens(&raw_template);
            for expanded in template::expand_placeholders(&mapped, &context) {
                let with_env = template::expand_env(&expanded);
                for with_user in template::expand_user_id(&with_env) {
                    for concrete in template::expand_wildcards(&with_user) {
                        let cleaned = template::strip_quotes(&concrete);
                        if cleaned.is_empty() {
                            continue;
                        }
                        let path = StrictPath::new(cleaned);
                        reporter.add_sample(path.render());
                        raw_candidates.push((path, from_registry));
                    }
                }
            }
        }
    }

    reporter.emit(95.0, total, total, "Scoring candidates");
    let found: Vec<Candidate> = raw_candidates
        .into_iter()
        .filter(|(path, _)| path.exists())
        .map(|(path, from_registry)| score_path(path, from_registry))
        .collect();
    result.candidates = merge_candidates(found);

    result.status = if result.candidates.is_empty() {
        DetectionStatus::NoValidCandidates
    } else {
        DetectionStatus::Matched
    };
    result.debug.checked_paths = reporter.samples.clone();
    reporter.emit(100.0, total, total, "Detection finished");
    result
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{catalog_file, FakeMetadataAdapter, FakeRegistryAdapter};

    fn args<'a>(
        catalog_path: &'a StrictPath,
        game_name: &'a str,
        exe_path: &'a StrictPath,
        install_path: &'a StrictPath,
    ) -> DetectionArgs<'a> {
        DetectionArgs {
            catalog_path,
            game_name,
            exe_path,
            install_path,
        }
    }

    #[test]
    fn matches_by_exe_metadata_and_scores_the_install_folder() {
        let scratch = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(scratch.path());
        let install = root.joined("Age of Empires III Definitive Edition");
        install.joined("SaveData/slot1.sav").write_with_content("x").unwrap();
        let exe = install.joined("AoE3DE_s.exe");

        let catalog_path = catalog_file(
            &root,
            r#"[{
                "title": "Age of Empires III Definitive Edition",
                "save_game_data_locations": [{"system": "Windows", "location": "<path-to-game>\\SaveData"}]
            }]"#,
        );

        let metadata = FakeMetadataAdapter::new("Age of Empires III Definitive Edition", "");
        let result = detect(
            &args(&catalog_path, "aoe3", &exe, &install),
            &mut CatalogCache::default(),
            &metadata,
            &FakeRegistryAdapter::default(),
            &SteamEnv::default(),
            None,
        );

        assert_eq!(DetectionStatus::Matched, result.status);
        assert_eq!(
            Some("Age of Empires III Definitive Edition".to_string()),
            result.matched_title
        );
        assert!(!result.title_ambiguous);
        assert_eq!(1, result.candidates.len());
        let candidate = &result.candidates[0];
        assert!(candidate.path.equivalent(&install.joined("SaveData")));
        assert_eq!(LocationKind::Folder, candidate.kind);
        assert!(candidate.reasons.contains(&"path exists".to_string()));
        assert!(candidate.reasons.contains(&"save-like files detected".to_string()));
    }

    #[test]
    fn resolves_rules_through_the_registry_adapter() {
        let scratch = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(scratch.path());
        let saves = root.joined("Documents/My Games/Game One");
        saves.joined("slot1.dat").write_with_content("x").unwrap();
        let install = root.joined("GameOne");
        install.create_dirs().unwrap();
        let exe = install.joined("GameOne.exe");

        let rule = "HKEY_CURRENT_USER\\SOFTWARE\\Vendor\\GameOne";
        let catalog_path = catalog_file(
            &root,
            &format!(
                r#"[{{
                    "title": "Game One",
                    "save_game_data_locations": [{{"system": "Windows", "location": "{}"}}]
                }}]"#,
                rule.replace('\\', "\\\\"),
            ),
        );

        let registry = FakeRegistryAdapter::with_value(rule, &saves.render());
        let result = detect(
            &args(&catalog_path, "Game One", &exe, &install),
            &mut CatalogCache::default(),
            &FakeMetadataAdapter::default(),
            &registry,
            &SteamEnv::default(),
            None,
        );

        assert_eq!(DetectionStatus::Matched, result.status);
        assert_eq!(1, result.candidates.len());
        let candidate = &result.candidates[0];
        assert!(candidate.path.equivalent(&saves));
        assert_eq!(CandidateSource::Registry, candidate.source);
        assert!(candidate.reasons.contains(&"resolved via registry value".to_string()));
    }

    #[test]
    fn rejects_weak_matches() {
        let scratch = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(scratch.path());
        let install = root.joined("Some Game");
        install.create_dirs().unwrap();
        let exe = install.joined("game.exe");

        let catalog_path = catalog_file(&root, r#"[{"title": "Entirely Unrelated Title"}]"#);

        let result = detect(
            &args(&catalog_path, "Some Game", &exe, &install),
            &mut CatalogCache::default(),
            &FakeMetadataAdapter::default(),
            &FakeRegistryAdapter::default(),
            &SteamEnv::default(),
            None,
        );
        assert_eq!(DetectionStatus::NoMatch, result.status);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn reports_entries_without_windows_rules() {
        let scratch = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(scratch.path());
        let install = root.joined("Some Game");
        install.create_dirs().unwrap();
        let exe = install.joined("game.exe");

        let catalog_path = catalog_file(
            &root,
            r#"[{"title": "Some Game", "save_game_data_locations": [{"system": "Linux", "location": "~/.saves"}]}]"#,
        );

        let result = detect(
            &args(&catalog_path, "Some Game", &exe, &install),
            &mut CatalogCache::default(),
            &FakeMetadataAdapter::default(),
            &FakeRegistryAdapter::default(),
            &SteamEnv::default(),
            None,
        );
        assert_eq!(DetectionStatus::NoWindowsLocations, result.status);
    }

    #[test]
    fn reports_a_missing_catalog() {
        let scratch = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(scratch.path());
        let catalog_path = root.joined("absent.json");
        let install = root.joined("Some Game");
        let exe = install.joined("game.exe");

        let result = detect(
            &args(&catalog_path, "Some Game", &exe, &install),
            &mut CatalogCache::default(),
            &FakeMetadataAdapter::default(),
            &FakeRegistryAdapter::default(),
            &SteamEnv::default(),
            None,
        );
        assert_eq!(DetectionStatus::CatalogMissing, result.status);
    }

    #[test]
    fn progress_is_monotone_and_bounded() {
        let scratch = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(scratch.path());
        let install = root.joined("Some Game");
        install.joined("saves").create_dirs().unwrap();
        let exe = install.joined("game.exe");

        let catalog_path = catalog_file(
            &root,
            r#"[{
                "title": "Some Game",
                "save_game_data_locations": [
                    {"system": "Windows", "location": "<path-to-game>\\saves"},
                    {"system": "Windows", "location": "<path-to-game>\\other"},
                    {"system": "Windows", "location": "<path-to-game>\\more"}
                ]
            }]"#,
        );

        let percents: RefCell<Vec<f32>> = RefCell::new(vec![]);
        let callback = |update: DetectionProgress| {
            percents.borrow_mut().push(update.percent);
        };
        let result = detect(
            &args(&catalog_path, "Some Game", &exe, &install),
            &mut CatalogCache::default(),
            &FakeMetadataAdapter::default(),
            &FakeRegistryAdapter::default(),
            &SteamEnv::default(),
            Some(&callback),
        );
        assert_eq!(DetectionStatus::Matched, result.status);

        let percents = percents.into_inner();
        assert!(!percents.is_empty());
        assert_eq!(100.0, *percents.last().unwrap());
        for pair in percents.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        for percent in percents {
            assert!((0.0..=100.0).contains(&percent));
        }
    }

    #[test]
    fn a_panicking_callback_does_not_abort_detection() {
        let scratch = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(scratch.path());
        let install = root.joined("Some Game");
        install.joined("saves").create_dirs().unwrap();
        let exe = install.joined("game.exe");

        let catalog_path = catalog_file(
            &root,
            r#"[{"title": "Some Game", "save_game_data_locations": [{"system": "Windows", "location": "<path-to-game>\\saves"}]}]"#,
        );

        let callback = |_: DetectionProgress| panic!("listener bug");
        let result = detect(
            &args(&catalog_path, "Some Game", &exe, &install),
            &mut CatalogCache::default(),
            &FakeMetadataAdapter::default(),
            &FakeRegistryAdapter::default(),
            &SteamEnv::default(),
            Some(&callback),
        );
        assert_eq!(DetectionStatus::Matched, result.status);
    }
}
