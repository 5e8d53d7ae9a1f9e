use crate::{
    prelude::{app_dir, default_data_root, AnyError, Error, StrictPath},
    resource::{ResourceFile, SaveableResourceFile},
};

const APP_STATE_DIR: &str = "AppState";
const BACKUPS_DIR: &str = "Backups";

/// Remembers the chosen data root across runs. Lives under the OS
/// application-data area rather than the data root itself, so it can be
/// found before the data root is known.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Bootstrap {
    pub data_root: Option<StrictPath>,
}

impl ResourceFile for Bootstrap {
    const FILE_NAME: &'static str = "bootstrap.json";
}

impl SaveableResourceFile for Bootstrap {}

impl Bootstrap {
    pub fn path() -> StrictPath {
        StrictPath::from_std_path_buf(&app_dir().join(Self::FILE_NAME))
    }

    pub fn load() -> Self {
        Self::load_from(&Self::path()).unwrap_or_else(|e| {
            log::warn!("unable to read bootstrap file, using defaults: {e}");
            Self::default()
        })
    }

    pub fn save(&self) {
        self.save_to(&Self::path());
    }

    pub fn effective_data_root(&self) -> StrictPath {
        self.data_root.clone().unwrap_or_else(default_data_root)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub backup_frequency_minutes: u32,
    pub retention_count: u32,
    pub storage_root: StrictPath,
    pub data_root: StrictPath,
    /// Reserved. Accepted and persisted, but snapshots are never compressed.
    pub compression_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let data_root = default_data_root();
        Self {
            backup_frequency_minutes: 15,
            retention_count: 10,
            storage_root: data_root.joined(BACKUPS_DIR),
            data_root,
            compression_enabled: false,
        }
    }
}

impl ResourceFile for Settings {
    const FILE_NAME: &'static str = "settings.json";
}

impl SaveableResourceFile for Settings {}

impl Settings {
    pub fn path(data_root: &StrictPath) -> StrictPath {
        data_root.joined(APP_STATE_DIR).joined(Self::FILE_NAME)
    }

    pub fn load(data_root: &StrictPath) -> Result<Self, AnyError> {
        let mut settings = Self::load_from(&Self::path(data_root))?;
        settings.data_root = data_root.clone();
        if settings.storage_root.raw().trim().is_empty() {
            settings.storage_root = data_root.joined(BACKUPS_DIR);
        }
        Ok(settings)
    }

    pub fn save(&self) {
        self.save_to(&Self::path(&self.data_root));
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.backup_frequency_minutes < 1 {
            return Err(Error::InvalidInput {
                why: "backupFrequencyMinutes must be at least 1".to_string(),
            });
        }
        if self.retention_count < 1 {
            return Err(Error::InvalidInput {
                why: "retentionCount must be at least 1".to_string(),
            });
        }
        if self.storage_root.raw().trim().is_empty() {
            return Err(Error::InvalidInput {
                why: "storageRoot must not be empty".to_string(),
            });
        }
        if self.data_root.raw().trim().is_empty() {
            return Err(Error::InvalidInput {
                why: "dataRoot must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn copy_tree(source: &StrictPath, target: &StrictPath) -> Result<(), Error> {
    let prefix = format!("{}/", source.render());
    target.create_dirs().map_err(|_| Error::StorageMigrationFailed {
        target: target.render(),
    })?;
    for file in source.walk_files() {
        let rendered = file.render();
        let Some(relative) = rendered.strip_prefix(&prefix) else {
            continue;
        };
        file.copy_to_with_retries(&target.joined(relative))
            .map_err(|_| Error::StorageMigrationFailed {
                target: target.render(),
            })?;
    }
    Ok(())
}

/// Moves the storage root's payload to a new location: rename first, then
/// fall back to a recursive copy + remove. On failure the old location is
/// left intact and the caller must not commit the new setting.
pub fn migrate_storage_root(old: &StrictPath, new: &StrictPath) -> Result<(), Error> {
    if old.equivalent(new) {
        return Ok(());
    }

    if !old.is_dir() {
        log::info!("storage root has no payload to migrate: {:?}", old.raw());
        return new.create_dirs().map_err(|_| Error::StorageMigrationFailed {
            target: new.render(),
        });
    }

    if new.exists() {
        log::error!("storage migration target already exists: {:?}", new.raw());
        return Err(Error::StorageMigrationFailed {
            target: new.render(),
        });
    }

    let _ = new.create_parent_dir();
    if std::fs::rename(old.interpret(), new.interpret()).is_ok() {
        log::info!("storage root renamed: {:?} -> {:?}", old.raw(), new.raw());
        return Ok(());
    }

    log::info!(
        "storage root rename failed, falling back to copy: {:?} -> {:?}",
        old.raw(),
        new.raw()
    );
    if let Err(e) = copy_tree(old, new) {
        let _ = new.remove();
        return Err(e);
    }
    if old.remove().is_err() {
        log::warn!("unable to remove old storage root after copy: {:?}", old.raw());
    }
    Ok(())
}
