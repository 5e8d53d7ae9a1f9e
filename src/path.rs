use std::io::Read;

use crate::prelude::{AnyError, Error, CASE_INSENSITIVE_OS};

#[cfg(target_os = "windows")]
const TYPICAL_SEPARATOR: &str = "\\";
#[cfg(target_os = "windows")]
const ATYPICAL_SEPARATOR: &str = "/";

#[cfg(not(target_os = "windows"))]
const TYPICAL_SEPARATOR: &str = "/";
#[cfg(not(target_os = "windows"))]
const ATYPICAL_SEPARATOR: &str = "\\";

const UNC_LOCAL_PREFIX: &str = "\\\\?\\";

const COPY_ATTEMPTS: u32 = 5;
const COPY_RETRY_INITIAL_MS: u64 = 50;
const COPY_RETRY_MAX_MS: u64 = 800;

fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") || path.starts_with("~\\") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_owned()
}

/// Splits an absolute path into its root (`/`, `C:\`, or a `\\?\`-prefixed
/// form of either) and the remainder.
fn split_root(path: &str) -> (String, &str) {
    if let Some(rest) = path.strip_prefix(UNC_LOCAL_PREFIX) {
        let (root, remainder) = split_root(rest);
        return (format!("{UNC_LOCAL_PREFIX}{root}"), remainder);
    }

    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let remainder = path[2..].trim_start_matches(['\\', '/']);
        return (format!("{}{}", &path[..2], TYPICAL_SEPARATOR), remainder);
    }
    match path.strip_prefix(TYPICAL_SEPARATOR) {
        Some(remainder) => (TYPICAL_SEPARATOR.to_string(), remainder),
        None => (String::new(), path),
    }
}

/// Resolves `.` and `..` segments lexically, without touching the
/// filesystem. The input must already be absolute and separator-normalized.
/// Working on raw segments keeps hostile input (like a drive letter in the
/// middle of a manifest-derived path) inert instead of re-rooting the path.
fn resolve_dots(path: &str) -> String {
    let (root, remainder) = split_root(path);
    let mut resolved: Vec<&str> = vec![];
    for segment in remainder.split(TYPICAL_SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    format!("{root}{}", resolved.join(TYPICAL_SEPARATOR))
}

/// Converts the raw path into the form used for actual filesystem calls:
/// home-expanded, absolute, separator-normalized, and canonicalized when
/// the target exists (which yields `\\?\` paths on Windows).
fn interpret(raw: &str, basis: &Option<String>) -> String {
    let normalized = expand_home(raw).replace(ATYPICAL_SEPARATOR, TYPICAL_SEPARATOR);
    let absolute = if std::path::Path::new(&normalized).is_absolute() {
        normalized
    } else {
        let base = match basis {
            Some(basis) => basis.clone(),
            None => render_pathbuf(&std::env::current_dir().unwrap()),
        };
        format!("{base}{TYPICAL_SEPARATOR}{normalized}")
    };
    match std::fs::canonicalize(&absolute) {
        Ok(canonical) => render_pathbuf(&canonical),
        Err(_) => resolve_dots(&absolute.replace(ATYPICAL_SEPARATOR, TYPICAL_SEPARATOR)),
    }
}

/// The form used for display, storage, and comparisons: forward slashes,
/// no `\\?\` prefix left over from canonicalization.
fn render<P: Into<String>>(path: P) -> String {
    path.into().replace(UNC_LOCAL_PREFIX, "").replace('\\', "/")
}

pub fn render_pathbuf(value: &std::path::Path) -> String {
    value.display().to_string()
}

/// A path kept in three deliberate representations: the `raw` string as
/// the user or a manifest wrote it, `interpret()` for filesystem calls,
/// and `render()`/`normalized_key()` for storage and comparisons. All
/// file access in the crate goes through this type.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StrictPath {
    raw: String,
    basis: Option<String>,
}

impl StrictPath {
    pub fn new(raw: String) -> Self {
        Self { raw, basis: None }
    }

    pub fn relative(raw: String, basis: Option<String>) -> Self {
        Self { raw, basis }
    }

    pub fn from_std_path_buf(path_buf: &std::path::Path) -> Self {
        Self::new(render_pathbuf(path_buf))
    }

    pub fn as_std_path_buf(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.interpret())
    }

    pub fn raw(&self) -> String {
        self.raw.to_string()
    }

    pub fn interpret(&self) -> String {
        interpret(&self.raw, &self.basis)
    }

    pub fn render(&self) -> String {
        render(self.interpret())
    }

    /// The canonical form used for all path comparisons and path-keyed maps.
    /// Case-insensitive hosts compare case-insensitively.
    pub fn normalized_key(&self) -> String {
        let rendered = self.render();
        if CASE_INSENSITIVE_OS {
            rendered.to_lowercase()
        } else {
            rendered
        }
    }

    pub fn equivalent(&self, other: &Self) -> bool {
        self.normalized_key() == other.normalized_key()
    }

    pub fn is_file(&self) -> bool {
        std::path::Path::new(&self.interpret()).is_file()
    }

    pub fn is_dir(&self) -> bool {
        std::path::Path::new(&self.interpret()).is_dir()
    }

    pub fn exists(&self) -> bool {
        self.is_file() || self.is_dir()
    }

    pub fn leaf(&self) -> Option<String> {
        self.as_std_path_buf()
            .file_name()
            .map(|x| x.to_string_lossy().to_string())
    }

    pub fn file_stem(&self) -> Option<String> {
        self.as_std_path_buf()
            .file_stem()
            .map(|x| x.to_string_lossy().to_string())
    }

    pub fn extension(&self) -> Option<String> {
        self.as_std_path_buf()
            .extension()
            .map(|x| x.to_string_lossy().to_lowercase())
    }

    pub fn popped(&self) -> Self {
        let mut pb = self.as_std_path_buf();
        pb.pop();
        Self::from_std_path_buf(&pb)
    }

    pub fn joined(&self, other: &str) -> Self {
        Self::new(format!("{}/{}", self.interpret(), other))
    }

    pub fn size(&self) -> u64 {
        std::fs::metadata(self.interpret()).map(|x| x.len()).unwrap_or(0)
    }

    pub fn modified(&self) -> Option<std::time::SystemTime> {
        std::fs::metadata(self.interpret()).and_then(|x| x.modified()).ok()
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.interpret())
    }

    pub fn create_parent_dir(&self) -> std::io::Result<()> {
        let mut pb = self.as_std_path_buf();
        pb.pop();
        std::fs::create_dir_all(&pb)?;
        Ok(())
    }

    /// Best-effort recursive delete. Missing paths are not an error.
    pub fn remove(&self) -> Result<(), AnyError> {
        if self.is_file() {
            std::fs::remove_file(self.interpret())?;
        } else if self.is_dir() {
            std::fs::remove_dir_all(self.interpret())?;
        }
        Ok(())
    }

    pub fn try_read(&self) -> Result<String, AnyError> {
        Ok(std::fs::read_to_string(self.interpret())?)
    }

    pub fn write_with_content(&self, content: &str) -> Result<(), AnyError> {
        self.create_parent_dir()?;
        std::fs::write(self.interpret(), content.as_bytes())?;
        Ok(())
    }

    /// SHA-256 of the file's byte stream, as lowercase hex.
    pub fn sha256(&self) -> Result<String, AnyError> {
        use sha2::Digest;

        let mut file = std::fs::File::open(self.interpret())?;
        let mut hasher = sha2::Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Lazy sequence of absolute file paths under this root.
    /// Symbolic links are not followed, so links cannot escape the root.
    pub fn walk_files(&self) -> impl Iterator<Item = StrictPath> {
        walkdir::WalkDir::new(self.interpret())
            .follow_links(false)
            .into_iter()
            .filter_map(crate::prelude::filter_map_walkdir)
            .filter(|x| x.file_type().is_file())
            .map(|x| StrictPath::from_std_path_buf(x.path()))
    }

    /// Verifies that this path is the given root or lies strictly inside it.
    /// Apply this before any read/write using a path derived from untrusted
    /// manifest input.
    pub fn assert_within(&self, root: &Self, context: &str) -> Result<(), Error> {
        let target = self.normalized_key();
        let root_key = root.normalized_key();
        if target == root_key || target.starts_with(&format!("{root_key}/")) {
            Ok(())
        } else {
            log::error!("[{context}] path escapes its root: {target:?} vs {root_key:?}");
            Err(Error::PathEscape {
                context: context.to_string(),
            })
        }
    }

    /// Copy to `dest`, creating parent directories. Transient failures
    /// (locked file, sharing violation) are retried with exponential
    /// backoff before giving up.
    pub fn copy_to_with_retries(&self, dest: &Self) -> Result<(), Error> {
        let failure = |cause: String| Error::CopyFailed {
            source_path: self.render(),
            dest: dest.render(),
            cause,
        };

        dest.create_parent_dir()
            .map_err(|e| failure(format!("unable to create parent: {e}")))?;

        let mut delay = COPY_RETRY_INITIAL_MS;
        let mut last_error = String::new();
        for attempt in 0..COPY_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(std::time::Duration::from_millis(delay));
                delay = (delay * 2).min(COPY_RETRY_MAX_MS);
            }
            match std::fs::copy(self.interpret(), dest.interpret()) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "copy attempt {} failed: {:?} -> {:?} | {e}",
                        attempt + 1,
                        &self.raw,
                        &dest.raw
                    );
                    last_error = e.to_string();
                }
            }
        }
        Err(failure(last_error))
    }
}

impl From<&std::path::Path> for StrictPath {
    fn from(source: &std::path::Path) -> Self {
        Self::from_std_path_buf(source)
    }
}

// Persisted as the raw string, so round-trips never lose what the user or
// a manifest actually wrote.
impl serde::Serialize for StrictPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> serde::Deserialize<'de> for StrictPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> String {
        env!("CARGO_MANIFEST_DIR").to_owned()
    }

    mod strict_path {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn expands_relative_paths_from_working_dir_by_default() {
            let sp = StrictPath::new("README.md".to_owned());
            if cfg!(target_os = "windows") {
                assert_eq!(format!("\\\\?\\{}\\README.md", repo()), sp.interpret());
            } else {
                assert_eq!(format!("{}/README.md", repo()), sp.interpret());
            }
        }

        #[test]
        fn expands_relative_paths_from_specified_basis_dir() {
            if cfg!(target_os = "windows") {
                let sp = StrictPath::relative("README.md".to_owned(), Some("C:\\tmp".to_string()));
                assert_eq!("C:\\tmp\\README.md", sp.interpret());
            } else {
                let sp = StrictPath::relative("README.md".to_owned(), Some("/tmp".to_string()));
                assert_eq!("/tmp/README.md", sp.interpret());
            }
        }

        #[test]
        fn converts_dot_segments_within_fake_path() {
            assert_eq!(
                format!("{}/fake.md", repo()).replace('\\', "/"),
                StrictPath::new(format!("{}/fake/../fake.md", repo())).render(),
            );
            assert_eq!(
                format!("{}/fake/README.md", repo()).replace('\\', "/"),
                StrictPath::new(format!("{}/fake/./README.md", repo())).render(),
            );
        }

        #[test]
        fn treats_absolute_paths_as_such() {
            if cfg!(target_os = "windows") {
                let sp = StrictPath::new("C:\\tmp\\README.md".to_owned());
                assert_eq!("C:\\tmp\\README.md", sp.interpret());
            } else {
                let sp = StrictPath::new("/tmp/README.md".to_owned());
                assert_eq!("/tmp/README.md", sp.interpret());
            }
        }

        #[test]
        fn can_check_if_it_is_a_file() {
            assert!(StrictPath::new(format!("{}/README.md", repo())).is_file());
            assert!(!StrictPath::new(repo()).is_file());
        }

        #[test]
        fn can_check_if_it_is_a_directory() {
            assert!(StrictPath::new(repo()).is_dir());
            assert!(!StrictPath::new(format!("{}/README.md", repo())).is_dir());
        }

        #[test]
        fn can_check_if_it_exists() {
            assert!(StrictPath::new(repo()).exists());
            assert!(StrictPath::new(format!("{}/README.md", repo())).exists());
            assert!(!StrictPath::new(format!("{}/fake", repo())).exists());
        }

        #[test]
        fn removing_a_missing_path_is_not_an_error() {
            assert!(StrictPath::new(format!("{}/fake", repo())).remove().is_ok());
        }
    }

    mod containment {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn accepts_the_root_itself() {
            let root = StrictPath::new(repo());
            assert!(root.assert_within(&root, "test").is_ok());
        }

        #[test]
        fn accepts_paths_inside_the_root() {
            let root = StrictPath::new(repo());
            let target = StrictPath::new(format!("{}/src/lib.rs", repo()));
            assert!(target.assert_within(&root, "test").is_ok());
        }

        #[test]
        fn rejects_dot_dot_escapes() {
            let root = StrictPath::new(format!("{}/src", repo()));
            let target = root.joined("../README.md");
            assert_eq!(
                Err(Error::PathEscape {
                    context: "test".to_string()
                }),
                target.assert_within(&root, "test"),
            );
        }

        #[test]
        fn rejects_sibling_prefix_confusion() {
            let root = StrictPath::new(format!("{}/src", repo()));
            let target = StrictPath::new(format!("{}/src-other/file", repo()));
            assert!(target.assert_within(&root, "test").is_err());
        }
    }

    mod file_operations {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn can_copy_and_hash_a_file() {
            let scratch = tempfile::tempdir().unwrap();
            let source = StrictPath::from_std_path_buf(&scratch.path().join("a.sav"));
            source.write_with_content("abc").unwrap();

            let dest = StrictPath::from_std_path_buf(&scratch.path().join("deep/nested/b.sav"));
            source.copy_to_with_retries(&dest).unwrap();

            assert_eq!("abc", dest.try_read().unwrap());
            assert_eq!(3, dest.size());
            assert_eq!(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
                dest.sha256().unwrap()
            );
        }

        #[test]
        fn copy_fails_after_retries_when_source_is_missing() {
            let scratch = tempfile::tempdir().unwrap();
            let source = StrictPath::from_std_path_buf(&scratch.path().join("missing.sav"));
            let dest = StrictPath::from_std_path_buf(&scratch.path().join("out.sav"));
            assert!(matches!(
                source.copy_to_with_retries(&dest),
                Err(Error::CopyFailed { .. })
            ));
        }

        #[test]
        fn can_walk_files_under_a_root() {
            let scratch = tempfile::tempdir().unwrap();
            let root = StrictPath::from_std_path_buf(scratch.path());
            root.joined("a.sav").write_with_content("x").unwrap();
            root.joined("sub/b.sav").write_with_content("y").unwrap();

            let mut found: Vec<_> = root.walk_files().map(|x| x.leaf().unwrap()).collect();
            found.sort();
            assert_eq!(vec!["a.sav".to_string(), "b.sav".to_string()], found);
        }

        #[cfg(unix)]
        #[test]
        fn walk_does_not_follow_symlinks() {
            let scratch = tempfile::tempdir().unwrap();
            let root = StrictPath::from_std_path_buf(&scratch.path().join("root"));
            root.joined("a.sav").write_with_content("x").unwrap();

            let outside = StrictPath::from_std_path_buf(&scratch.path().join("outside"));
            outside.joined("secret.sav").write_with_content("z").unwrap();
            std::os::unix::fs::symlink(outside.interpret(), root.joined("link").interpret()).unwrap();

            let found: Vec<_> = root.walk_files().map(|x| x.leaf().unwrap()).collect();
            assert_eq!(vec!["a.sav".to_string()], found);
        }
    }
}
