pub mod backup;
pub mod recover;
pub mod restore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    library::{LocationKind, SaveLocation, SnapshotFile, SnapshotReason},
    prelude::{sha256, Error, StrictPath, INVALID_FILE_CHARS},
};

pub const MANIFEST_FILE_NAME: &str = "snapshot.manifest.json";
pub const MANIFEST_VERSION: u64 = 2;
pub const SNAPSHOTS_DIR_NAME: &str = "Snapshots";

const SAFE: &str = "_";

pub fn escape_folder_name(name: &str) -> String {
    let mut escaped = String::from(name);

    // Leading dots would hide the folder by default, and Windows Explorer
    // cannot open folders whose name ends with a dot, so both get escaped.
    // That also covers the `.` and `..` cases.
    if escaped.starts_with('.') {
        escaped.replace_range(..1, SAFE);
    }
    if escaped.ends_with('.') {
        escaped.replace_range(escaped.len() - 1.., SAFE);
    }

    let escaped = escaped.replace(INVALID_FILE_CHARS, SAFE);
    if escaped.is_empty() {
        SAFE.to_string()
    } else {
        escaped
    }
}

/// Maps each save location to the sub-folder holding its files inside the
/// snapshot directory. Folder names are sanitized basenames, uniquified
/// within the snapshot.
pub fn assign_storage_folders(locations: &[SaveLocation]) -> BTreeMap<String, String> {
    let mut assigned: BTreeMap<String, String> = BTreeMap::new();
    let mut taken: Vec<String> = vec![];

    for location in locations {
        let base = escape_folder_name(&location.path.leaf().unwrap_or_else(|| "location".to_string()));
        let mut candidate = base.clone();
        let mut counter = 2;
        while taken.iter().any(|x| x.eq_ignore_ascii_case(&candidate)) {
            candidate = format!("{base} ({counter})");
            counter += 1;
        }
        taken.push(candidate.clone());
        assigned.insert(location.id.clone(), candidate);
    }

    assigned
}

/// Snapshot directory name: `YYYY-MM-DD_HH-MM-SS-mmm`, suffixed `_2`, `_3`,
/// ... until unique under the game's Snapshots directory.
pub fn unique_snapshot_dir(snapshots_root: &StrictPath, when: &DateTime<Utc>) -> StrictPath {
    let base = when.format("%Y-%m-%d_%H-%M-%S-%3f").to_string();

    let mut candidate = base.clone();
    let mut counter = 2;
    while snapshots_root.joined(&candidate).exists() {
        candidate = format!("{base}_{counter}");
        counter += 1;
    }
    snapshots_root.joined(&candidate)
}

/// Deterministic hash over the sorted file set: entries
/// `location_id:relative_path:checksum:size` joined by `|`, hashed with
/// SHA-256. Reordering the rows does not change the result.
pub fn aggregate_checksum(files: &[SnapshotFile]) -> String {
    let mut entries: Vec<String> = files
        .iter()
        .map(|file| {
            format!(
                "{}:{}:{}:{}",
                file.location_id, file.relative_path, file.checksum, file.size_bytes
            )
        })
        .collect();
    entries.sort();
    sha256(&entries.join("|"))
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManifestLocation {
    pub path: StrictPath,
    #[serde(rename = "type")]
    pub kind: LocationKind,
    #[serde(default)]
    pub auto_detected: bool,
    #[serde(default = "crate::serialization::default_true")]
    pub enabled: bool,
    pub storage_folder: String,
}

/// The sidecar inside every snapshot directory. Version 2 records the
/// location-to-storage-folder mapping that restore/verify and the disk
/// scanner rely on.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotManifest {
    pub version: u64,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: SnapshotReason,
    #[serde(default)]
    pub locations: BTreeMap<String, ManifestLocation>,
}

impl SnapshotManifest {
    pub fn path_for(snapshot_root: &StrictPath) -> StrictPath {
        snapshot_root.joined(MANIFEST_FILE_NAME)
    }

    pub fn load(snapshot_root: &StrictPath) -> Result<Self, Error> {
        let path = Self::path_for(snapshot_root);
        if !path.is_file() {
            return Err(Error::ManifestInvalid {
                why: format!("manifest file is missing: {}", path.render()),
            });
        }
        let content = path.try_read().map_err(|e| Error::ManifestInvalid {
            why: e.to_string(),
        })?;
        let manifest: Self = serde_json::from_str(&content).map_err(|e| Error::ManifestInvalid {
            why: e.to_string(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn write(&self, snapshot_root: &StrictPath) -> Result<(), Error> {
        let content = serde_json::to_string_pretty(self).map_err(|e| Error::ManifestInvalid {
            why: e.to_string(),
        })?;
        Self::path_for(snapshot_root)
            .write_with_content(&content)
            .map_err(|e| Error::Filesystem {
                why: format!("unable to write manifest: {e}"),
            })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.version != MANIFEST_VERSION {
            return Err(Error::ManifestInvalid {
                why: format!("unsupported version: {}", self.version),
            });
        }
        if self.snapshot_id.trim().is_empty() {
            return Err(Error::ManifestInvalid {
                why: "snapshot id is blank".to_string(),
            });
        }
        for (location_id, location) in &self.locations {
            if location.storage_folder.trim().is_empty() {
                return Err(Error::ManifestInvalid {
                    why: format!("location {location_id} has no storage folder"),
                });
            }
        }
        Ok(())
    }

    /// Every `location_id` referenced by the snapshot's file rows must be
    /// covered by the manifest's location map.
    pub fn validate_covers(&self, files: &[&SnapshotFile]) -> Result<(), Error> {
        for file in files {
            if !self.locations.contains_key(&file.location_id) {
                return Err(Error::ManifestInvalid {
                    why: format!("no storage folder mapping for location {}", file.location_id),
                });
            }
        }
        Ok(())
    }

    pub fn location(&self, location_id: &str) -> Option<&ManifestLocation> {
        self.locations.get(location_id)
    }

    /// Reverse lookup from a storage folder name, with a case-insensitive
    /// fallback for payloads that went through a case-folding filesystem.
    pub fn location_by_storage_folder(&self, storage_folder: &str) -> Option<(&String, &ManifestLocation)> {
        self.locations
            .iter()
            .find(|(_, location)| location.storage_folder == storage_folder)
            .or_else(|| {
                self.locations
                    .iter()
                    .find(|(_, location)| location.storage_folder.eq_ignore_ascii_case(storage_folder))
            })
    }
}
