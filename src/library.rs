use chrono::{DateTime, Utc};

use crate::{
    prelude::{new_id, AnyError, Error, StrictPath, INVALID_FILE_CHARS},
    resource::{save_atomically, ResourceFile, SaveableResourceFile},
};

const APP_STATE_DIR: &str = "AppState";
const METADATA_FILE_NAME: &str = "metadata.json";
const EVENT_LOG_CAP: usize = 1_000;
const RECENT_EVENTS_FOR_ISSUES: usize = 20;
const FOLDER_NAME_MAX_LEN: usize = 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Protected,
    #[default]
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    File,
    #[default]
    Folder,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotReason {
    Auto,
    #[default]
    Manual,
    PreRestore,
}

impl std::fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
            Self::PreRestore => write!(f, "pre-restore"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[default]
    Backup,
    Restore,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    pub name: String,
    pub install_path: StrictPath,
    pub exe_path: StrictPath,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: GameStatus,
    pub folder_name: String,
}

impl Game {
    pub fn metadata_path(storage_root: &StrictPath, folder_name: &str) -> StrictPath {
        storage_root.joined(folder_name).joined(METADATA_FILE_NAME)
    }

    /// The sidecar is the only ground truth the scanner has for recovering
    /// library state, so it is written whenever a game is registered.
    pub fn write_metadata(&self, storage_root: &StrictPath) -> Result<(), AnyError> {
        let content = serde_json::to_string_pretty(self)?;
        save_atomically(&Self::metadata_path(storage_root, &self.folder_name), &content)
    }

    pub fn load_metadata(path: &StrictPath) -> Option<Self> {
        let content = path.try_read().ok()?;
        let parsed: Self = serde_json::from_str(&content).ok()?;
        if parsed.id.trim().is_empty() || parsed.name.trim().is_empty() {
            log::warn!("ignoring metadata sidecar with blank id or name: {:?}", path.raw());
            return None;
        }
        Some(parsed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveLocation {
    pub id: String,
    pub game_id: String,
    pub path: StrictPath,
    #[serde(rename = "type")]
    pub kind: LocationKind,
    pub auto_detected: bool,
    #[serde(default = "crate::serialization::default_true")]
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub game_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
    pub storage_path: StrictPath,
    #[serde(default)]
    pub reason: SnapshotReason,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub id: String,
    pub snapshot_id: String,
    pub location_id: String,
    pub relative_path: String,
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// The authoritative in-memory state: flat collections of rows keyed by id.
/// Cross-row references are logical (plain id strings), which keeps the
/// model cycle-free and lets the scanner rebuild it from disk.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Library {
    pub games: Vec<Game>,
    pub save_locations: Vec<SaveLocation>,
    pub snapshots: Vec<Snapshot>,
    pub snapshot_files: Vec<SnapshotFile>,
    pub event_logs: Vec<EventLog>,
}

impl ResourceFile for Library {
    const FILE_NAME: &'static str = "library.json";
}

impl SaveableResourceFile for Library {}

fn validate_non_empty(value: &str, field: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        Err(Error::InvalidInput {
            why: format!("{field} must not be empty"),
        })
    } else {
        Ok(())
    }
}

fn folder_key(name: &str) -> String {
    name.to_lowercase()
}

impl Library {
    pub fn path(data_root: &StrictPath) -> StrictPath {
        data_root.joined(APP_STATE_DIR).joined(Self::FILE_NAME)
    }

    pub fn save(&self, data_root: &StrictPath) {
        self.save_to(&Self::path(data_root));
    }

    pub fn game(&self, id: &str) -> Option<&Game> {
        self.games.iter().find(|x| x.id == id)
    }

    pub fn game_mut(&mut self, id: &str) -> Option<&mut Game> {
        self.games.iter_mut().find(|x| x.id == id)
    }

    pub fn require_game(&self, id: &str) -> Result<&Game, Error> {
        self.game(id).ok_or_else(|| Error::NotFound {
            kind: "game",
            id: id.to_string(),
        })
    }

    pub fn game_by_folder(&self, folder_name: &str) -> Option<&Game> {
        let key = folder_key(folder_name);
        self.games.iter().find(|x| folder_key(&x.folder_name) == key)
    }

    /// Filesystem-safe derivation of a game name, unique among all games.
    pub fn derive_folder_name(&self, name: &str) -> String {
        let stripped: String = name.chars().filter(|c| !INVALID_FILE_CHARS.contains(c)).collect();
        let mut base: String = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        if base.len() > FOLDER_NAME_MAX_LEN {
            base = base
                .char_indices()
                .take_while(|(i, _)| *i < FOLDER_NAME_MAX_LEN)
                .map(|(_, c)| c)
                .collect::<String>()
                .trim_end()
                .to_string();
        }
        if base.is_empty() {
            base = "Game".to_string();
        }

        let taken: Vec<String> = self.games.iter().map(|x| folder_key(&x.folder_name)).collect();
        if !taken.contains(&folder_key(&base)) {
            return base;
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{base} ({counter})");
            if !taken.contains(&folder_key(&candidate)) {
                return candidate;
            }
            counter += 1;
        }
    }

    pub fn add_game(&mut self, name: &str, exe_path: StrictPath, install_path: StrictPath) -> Result<Game, Error> {
        validate_non_empty(name, "name")?;
        validate_non_empty(&exe_path.raw(), "exePath")?;
        validate_non_empty(&install_path.raw(), "installPath")?;

        let game = Game {
            id: new_id(),
            name: name.trim().to_string(),
            install_path,
            exe_path,
            created_at: Utc::now(),
            last_seen_at: None,
            status: GameStatus::Warning,
            folder_name: self.derive_folder_name(name.trim()),
        };
        log::info!("[{}] adding game as {:?}", &game.name, &game.folder_name);
        self.games.push(game.clone());
        Ok(game)
    }

    /// Removes the game and cascades to its locations, snapshots, snapshot
    /// files, and event logs. Returns the removed row so the caller can
    /// clean up the on-disk game folder.
    pub fn remove_game(&mut self, id: &str) -> Result<Game, Error> {
        let index = self.games.iter().position(|x| x.id == id).ok_or_else(|| Error::NotFound {
            kind: "game",
            id: id.to_string(),
        })?;
        let game = self.games.remove(index);

        self.save_locations.retain(|x| x.game_id != id);
        let snapshot_ids: Vec<String> = self
            .snapshots
            .iter()
            .filter(|x| x.game_id == id)
            .map(|x| x.id.clone())
            .collect();
        self.snapshots.retain(|x| x.game_id != id);
        self.snapshot_files.retain(|x| !snapshot_ids.contains(&x.snapshot_id));
        self.event_logs.retain(|x| x.game_id.as_deref() != Some(id));

        log::info!("[{}] removed game and {} snapshots", &game.name, snapshot_ids.len());
        Ok(game)
    }

    pub fn update_status(&mut self, game_id: &str, status: GameStatus) {
        if let Some(game) = self.game_mut(game_id) {
            game.status = status;
        }
    }

    pub fn locations_for_game(&self, game_id: &str) -> Vec<&SaveLocation> {
        self.save_locations.iter().filter(|x| x.game_id == game_id).collect()
    }

    pub fn location(&self, id: &str) -> Option<&SaveLocation> {
        self.save_locations.iter().find(|x| x.id == id)
    }

    pub fn add_location(
        &mut self,
        game_id: &str,
        path: StrictPath,
        kind: LocationKind,
        auto_detected: bool,
    ) -> Result<SaveLocation, Error> {
        self.require_game(game_id)?;
        validate_non_empty(&path.raw(), "path")?;

        if let Some(existing) = self
            .save_locations
            .iter()
            .find(|x| x.game_id == game_id && x.path.equivalent(&path))
        {
            log::debug!("[{game_id}] save location already known: {:?}", path.raw());
            return Ok(existing.clone());
        }

        let location = SaveLocation {
            id: new_id(),
            game_id: game_id.to_string(),
            path,
            kind,
            auto_detected,
            enabled: true,
        };
        self.save_locations.push(location.clone());
        Ok(location)
    }

    pub fn toggle_location(&mut self, id: &str, enabled: bool) -> Result<(), Error> {
        let location = self
            .save_locations
            .iter_mut()
            .find(|x| x.id == id)
            .ok_or_else(|| Error::NotFound {
                kind: "save location",
                id: id.to_string(),
            })?;
        location.enabled = enabled;
        Ok(())
    }

    /// Detaches the location from the library. Historical snapshot files
    /// keep their `location_id` and are silently skipped by verify/restore.
    pub fn remove_location(&mut self, id: &str) -> Result<(), Error> {
        let index = self
            .save_locations
            .iter()
            .position(|x| x.id == id)
            .ok_or_else(|| Error::NotFound {
                kind: "save location",
                id: id.to_string(),
            })?;
        self.save_locations.remove(index);
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|x| x.id == id)
    }

    pub fn require_snapshot(&self, id: &str) -> Result<&Snapshot, Error> {
        self.snapshot(id).ok_or_else(|| Error::NotFound {
            kind: "snapshot",
            id: id.to_string(),
        })
    }

    /// Snapshots for a game, newest first. Ties on `created_at` fall back
    /// to insertion order, newest insertion first.
    pub fn snapshots_for_game(&self, game_id: &str) -> Vec<&Snapshot> {
        let mut found: Vec<(usize, &Snapshot)> = self
            .snapshots
            .iter()
            .enumerate()
            .filter(|(_, x)| x.game_id == game_id)
            .collect();
        found.sort_by(|(a_index, a), (b_index, b)| {
            b.created_at.cmp(&a.created_at).then_with(|| b_index.cmp(a_index))
        });
        found.into_iter().map(|(_, x)| x).collect()
    }

    pub fn files_for_snapshot(&self, snapshot_id: &str) -> Vec<&SnapshotFile> {
        self.snapshot_files.iter().filter(|x| x.snapshot_id == snapshot_id).collect()
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot, files: Vec<SnapshotFile>) {
        self.snapshots.push(snapshot);
        self.snapshot_files.extend(files);
    }

    /// Removes the snapshot and its file rows. Returns how many file rows
    /// were dropped.
    pub fn remove_snapshot(&mut self, id: &str) -> usize {
        self.snapshots.retain(|x| x.id != id);
        let before = self.snapshot_files.len();
        self.snapshot_files.retain(|x| x.snapshot_id != id);
        before - self.snapshot_files.len()
    }

    pub fn log_event(&mut self, game_id: Option<&str>, kind: EventKind, message: String) {
        log::info!("event ({kind:?}): {message}");
        self.event_logs.push(EventLog {
            id: new_id(),
            game_id: game_id.map(|x| x.to_string()),
            kind,
            message,
            created_at: Utc::now(),
        });
        if self.event_logs.len() > EVENT_LOG_CAP {
            let overflow = self.event_logs.len() - EVENT_LOG_CAP;
            self.event_logs.drain(..overflow);
        }
    }

    /// Error entries among the game's most recent events.
    pub fn issue_count(&self, game_id: &str) -> usize {
        self.event_logs
            .iter()
            .rev()
            .filter(|x| x.game_id.as_deref() == Some(game_id))
            .take(RECENT_EVENTS_FOR_ISSUES)
            .filter(|x| x.kind == EventKind::Error)
            .count()
    }

    pub fn last_backup_at(&self, game_id: &str) -> Option<DateTime<Utc>> {
        self.snapshots
            .iter()
            .filter(|x| x.game_id == game_id)
            .map(|x| x.created_at)
            .max()
    }
}
