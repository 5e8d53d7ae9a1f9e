pub use crate::path::StrictPath;

pub type AnyError = Box<dyn std::error::Error>;

pub const WINDOWS: bool = cfg!(target_os = "windows");
pub const MAC: bool = cfg!(target_os = "macos");
pub const CASE_INSENSITIVE_OS: bool = WINDOWS || MAC;
pub const APP_DIR_NAME: &str = "savekeeper";
pub const INVALID_FILE_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// File extensions that usually indicate save data.
pub const SAVE_LIKE_EXTENSIONS: &[&str] = &["sav", "save", "dat", "profile", "json", "ini", "cfg"];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("No such {kind}: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Invalid input: {why}")]
    InvalidInput { why: String },
    #[error("Snapshot manifest is missing or invalid: {why}")]
    ManifestInvalid { why: String },
    #[error("Snapshot file path resolves outside its allowed root.")]
    PathEscape { context: String },
    #[error("Failed to copy {source_path} to {dest}: {cause}")]
    CopyFailed {
        source_path: String,
        dest: String,
        cause: String,
    },
    #[error("Failed to migrate storage root to {target}.")]
    StorageMigrationFailed { target: String },
    #[error("Catalog file not found: {path}")]
    CatalogMissing { path: String },
    #[error("Catalog file could not be parsed: {why}")]
    CatalogInvalid { why: String },
    #[error("Restore blocked: failed to create safety backup before restore.")]
    SafetyBackupFailed,
    #[error("Data root is unreachable. Configure a valid data root to continue.")]
    RecoveryMode,
    #[error("Filesystem operation failed: {why}")]
    Filesystem { why: String },
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn sha256(content: &str) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Configuration area for the bootstrap file that remembers the data root.
pub fn app_dir() -> std::path::PathBuf {
    let mut path = dirs::config_dir().unwrap();
    path.push(APP_DIR_NAME);
    path
}

pub fn default_data_root() -> StrictPath {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push(APP_DIR_NAME);
    StrictPath::from_std_path_buf(&path)
}

pub fn filter_map_walkdir(e: Result<walkdir::DirEntry, walkdir::Error>) -> Option<walkdir::DirEntry> {
    if let Err(e) = &e {
        log::warn!("failed to walk: {:?} | {e:?}", e.path());
    }
    e.ok()
}
