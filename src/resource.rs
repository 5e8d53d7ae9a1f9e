pub mod catalog;
pub mod config;

use crate::prelude::{AnyError, StrictPath};

/// Writes the full content to a temp file next to the target, then renames it
/// over the target. A reader never observes a partially written document.
pub fn save_atomically(path: &StrictPath, content: &str) -> Result<(), AnyError> {
    path.create_parent_dir()?;
    let target = path.interpret();
    let temp = format!("{target}.tmp");
    std::fs::write(&temp, content.as_bytes())?;
    std::fs::rename(&temp, &target)?;
    Ok(())
}

pub trait ResourceFile
where
    Self: Default + serde::de::DeserializeOwned,
{
    const FILE_NAME: &'static str;

    /// If the resource file does not exist, use default data and apply these modifications.
    fn initialize(self) -> Self {
        self
    }

    /// Update any legacy settings on load.
    fn migrate(self) -> Self {
        self
    }

    fn load_from(path: &StrictPath) -> Result<Self, AnyError> {
        if !path.exists() {
            return Ok(Self::default().initialize());
        }
        let content = path.try_read()?;
        Self::load_from_string(&content)
    }

    fn load_from_string(content: &str) -> Result<Self, AnyError> {
        Ok(ResourceFile::migrate(serde_json::from_str(content)?))
    }
}

pub trait SaveableResourceFile
where
    Self: ResourceFile + serde::Serialize,
{
    fn save_to(&self, path: &StrictPath) {
        let new_content = match serde_json::to_string_pretty(&self) {
            Ok(x) => x,
            Err(e) => {
                log::error!("unable to serialize {}: {e}", Self::FILE_NAME);
                return;
            }
        };

        if let Ok(old_content) = path.try_read() {
            if old_content == new_content {
                return;
            }
        }

        if let Err(e) = save_atomically(path, &new_content) {
            log::error!("unable to save {}: {e}", Self::FILE_NAME);
        }
    }
}
