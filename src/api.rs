use chrono::{DateTime, Utc};

use crate::{
    library::{EventKind, Game, GameStatus, Library, LocationKind, SaveLocation, Snapshot, SnapshotReason},
    prelude::{Error, StrictPath},
    resource::{
        catalog::CatalogCache,
        config::{self, Bootstrap, Settings},
        ResourceFile,
    },
    scan::{
        self,
        metadata::ExeMetadataAdapter,
        registry::RegistryAdapter,
        steam::SteamEnv,
        DetectionProgress, DetectionResult,
    },
    snapshot::{
        backup::{self, InFlight},
        recover::{self, ScanResult},
        restore::{self, VerifyOutcome},
    },
};

#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub game_id: String,
    pub processed: usize,
    pub total: usize,
}

/// Status/progress stream towards the shell. Implementations must not
/// block; the core calls them inline.
pub trait EventSink {
    fn backup_progress(&self, _progress: &BackupProgress) {}
    fn backup_created(&self, _snapshot: &Snapshot) {}
    fn detection_progress(&self, _progress: &DetectionProgress) {}
}

pub struct NullEventSink;

impl EventSink for NullEventSink {}

/// The session monitor collaborator; only used to enrich game summaries.
pub trait SessionMonitor {
    fn is_running(&self, _game_id: &str) -> bool {
        false
    }
}

pub struct NullSessionMonitor;

impl SessionMonitor for NullSessionMonitor {}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub id: String,
    pub name: String,
    pub status: GameStatus,
    pub folder_name: String,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub issue_count: usize,
    pub running: bool,
    pub snapshot_count: usize,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationView {
    #[serde(flatten)]
    pub location: SaveLocation,
    /// Derived at query time, never persisted.
    pub exists: bool,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub file_count: usize,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDetail {
    #[serde(flatten)]
    pub game: Game,
    pub locations: Vec<LocationView>,
    pub snapshots: Vec<SnapshotView>,
}

fn platform_metadata_adapter() -> Box<dyn ExeMetadataAdapter> {
    #[cfg(target_os = "windows")]
    {
        Box::new(scan::metadata::PowershellExeMetadataAdapter)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(scan::metadata::NoopExeMetadataAdapter)
    }
}

fn platform_registry_adapter() -> Box<dyn RegistryAdapter> {
    #[cfg(target_os = "windows")]
    {
        Box::new(scan::registry::WinRegistryAdapter)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(scan::registry::NoopRegistryAdapter)
    }
}

/// The facade the shell drives. Owns the settings, the library index, the
/// catalog cache, the adapters, and the in-flight backup set; all of them
/// are constructed at startup and passed along explicitly.
pub struct Core {
    settings: Settings,
    library: Library,
    catalogs: CatalogCache,
    in_flight: InFlight,
    steam: SteamEnv,
    metadata_adapter: Box<dyn ExeMetadataAdapter>,
    registry_adapter: Box<dyn RegistryAdapter>,
    session: Box<dyn SessionMonitor>,
    events: Box<dyn EventSink>,
    recovery_mode: bool,
    manage_bootstrap: bool,
}

impl Core {
    /// Loads state from the bootstrapped data root. An unreachable data
    /// root puts the core into recovery mode, where every mutating
    /// operation refuses until the data root is redirected.
    pub fn load() -> Self {
        let data_root = Bootstrap::load().effective_data_root();
        let mut core = Self::load_at(data_root);
        core.manage_bootstrap = true;
        core
    }

    pub fn load_at(data_root: StrictPath) -> Self {
        let reachable = data_root.create_dirs().is_ok() && data_root.is_dir();
        if !reachable {
            log::error!("data root is unreachable, entering recovery mode: {:?}", data_root.raw());
        }

        let settings = if reachable {
            Settings::load(&data_root).unwrap_or_else(|e| {
                log::warn!("unable to load settings, using defaults: {e}");
                let mut fallback = Settings::default();
                fallback.data_root = data_root.clone();
                fallback.storage_root = data_root.joined("Backups");
                fallback
            })
        } else {
            Settings::default()
        };
        let library = if reachable {
            Library::load_from(&Library::path(&data_root)).unwrap_or_else(|e| {
                log::warn!("unable to load library, starting empty: {e}");
                Library::default()
            })
        } else {
            Library::default()
        };

        Self {
            settings,
            library,
            catalogs: CatalogCache::default(),
            in_flight: InFlight::new(),
            steam: SteamEnv::scan(),
            metadata_adapter: platform_metadata_adapter(),
            registry_adapter: platform_registry_adapter(),
            session: Box::new(NullSessionMonitor),
            events: Box::new(NullEventSink),
            recovery_mode: !reachable,
            manage_bootstrap: false,
        }
    }

    /// Assembles a core from explicit parts; adapters and collaborators
    /// can be swapped for platform-specific or test implementations.
    pub fn with_components(
        settings: Settings,
        library: Library,
        steam: SteamEnv,
        metadata_adapter: Box<dyn ExeMetadataAdapter>,
        registry_adapter: Box<dyn RegistryAdapter>,
        session: Box<dyn SessionMonitor>,
        events: Box<dyn EventSink>,
    ) -> Self {
        Self {
            settings,
            library,
            catalogs: CatalogCache::default(),
            in_flight: InFlight::new(),
            steam,
            metadata_adapter,
            registry_adapter,
            session,
            events,
            recovery_mode: false,
            manage_bootstrap: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn in_recovery_mode(&self) -> bool {
        self.recovery_mode
    }

    fn ensure_writable(&self) -> Result<(), Error> {
        if self.recovery_mode {
            Err(Error::RecoveryMode)
        } else {
            Ok(())
        }
    }

    fn persist(&self) {
        if self.recovery_mode {
            return;
        }
        self.settings.save();
        self.library.save(&self.settings.data_root);
    }

    pub fn list_games(&self) -> Vec<GameSummary> {
        self.library
            .games
            .iter()
            .map(|game| GameSummary {
                id: game.id.clone(),
                name: game.name.clone(),
                status: game.status,
                folder_name: game.folder_name.clone(),
                last_backup_at: self.library.last_backup_at(&game.id),
                issue_count: self.library.issue_count(&game.id),
                running: self.session.is_running(&game.id),
                snapshot_count: self.library.snapshots_for_game(&game.id).len(),
            })
            .collect()
    }

    pub fn get_game_detail(&self, game_id: &str) -> Result<GameDetail, Error> {
        let game = self.library.require_game(game_id)?.clone();
        let locations = self
            .library
            .locations_for_game(game_id)
            .into_iter()
            .map(|location| LocationView {
                exists: location.path.exists(),
                location: location.clone(),
            })
            .collect();
        let snapshots = self
            .library
            .snapshots_for_game(game_id)
            .into_iter()
            .map(|snapshot| SnapshotView {
                file_count: self.library.files_for_snapshot(&snapshot.id).len(),
                snapshot: snapshot.clone(),
            })
            .collect();
        Ok(GameDetail {
            game,
            locations,
            snapshots,
        })
    }

    pub fn add_game(&mut self, name: &str, exe_path: StrictPath, install_path: StrictPath) -> Result<Game, Error> {
        self.ensure_writable()?;
        let game = self.library.add_game(name, exe_path, install_path)?;
        if let Err(e) = game.write_metadata(&self.settings.storage_root) {
            log::error!("[{}] unable to write metadata sidecar: {e}", &game.name);
            self.library.log_event(
                Some(&game.id),
                EventKind::Error,
                format!("Unable to write game metadata: {e}"),
            );
        }
        self.persist();
        Ok(game)
    }

    pub fn remove_game(&mut self, game_id: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        let game = self.library.remove_game(game_id)?;
        let game_folder = self.settings.storage_root.joined(&game.folder_name);
        if let Err(e) = game_folder.remove() {
            log::warn!("[{}] unable to remove game folder: {e}", &game.name);
        }
        self.persist();
        Ok(())
    }

    pub fn add_save_location(
        &mut self,
        game_id: &str,
        path: StrictPath,
        kind: LocationKind,
        auto_detected: bool,
    ) -> Result<SaveLocation, Error> {
        self.ensure_writable()?;
        let location = self.library.add_location(game_id, path, kind, auto_detected)?;
        self.persist();
        Ok(location)
    }

    pub fn toggle_save_location(&mut self, location_id: &str, enabled: bool) -> Result<(), Error> {
        self.ensure_writable()?;
        self.library.toggle_location(location_id, enabled)?;
        self.persist();
        Ok(())
    }

    pub fn remove_save_location(&mut self, location_id: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        self.library.remove_location(location_id)?;
        self.persist();
        Ok(())
    }

    pub fn backup(&mut self, game_id: &str, reason: SnapshotReason) -> Result<Option<Snapshot>, Error> {
        self.ensure_writable()?;
        let outcome = backup::backup(
            &mut self.library,
            &self.settings,
            &self.in_flight,
            &*self.events,
            game_id,
            reason,
            false,
        );
        self.persist();
        outcome
    }

    pub fn restore(&mut self, snapshot_id: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        let outcome = restore::restore(
            &mut self.library,
            &self.settings,
            &self.in_flight,
            &*self.events,
            snapshot_id,
        );
        self.persist();
        outcome
    }

    pub fn verify(&self, snapshot_id: &str) -> Result<VerifyOutcome, Error> {
        restore::verify(&self.library, snapshot_id)
    }

    pub fn delete_snapshot(&mut self, snapshot_id: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        let outcome = restore::delete(&mut self.library, snapshot_id);
        self.persist();
        outcome
    }

    pub fn scan(&mut self) -> Result<ScanResult, Error> {
        self.ensure_writable()?;
        let outcome = recover::scan_snapshots_from_disk(&mut self.library, &self.settings);
        self.persist();
        outcome
    }

    pub fn detect_catalog_save_paths(
        &mut self,
        game_id: &str,
        catalog_path: &StrictPath,
    ) -> Result<DetectionResult, Error> {
        let game = self.library.require_game(game_id)?.clone();
        let events = &*self.events;
        let progress = |update: DetectionProgress| events.detection_progress(&update);
        Ok(scan::detect(
            &scan::DetectionArgs {
                catalog_path,
                game_name: &game.name,
                exe_path: &game.exe_path,
                install_path: &game.install_path,
            },
            &mut self.catalogs,
            &*self.metadata_adapter,
            &*self.registry_adapter,
            &self.steam,
            Some(&progress),
        ))
    }

    /// For the trigger layer, e.g. to note a missing executable at launch.
    pub fn record_event(&mut self, game_id: Option<&str>, kind: EventKind, message: String) -> Result<(), Error> {
        self.ensure_writable()?;
        self.library.log_event(game_id, kind, message);
        self.persist();
        Ok(())
    }

    pub fn update_settings(&mut self, new: Settings) -> Result<(), Error> {
        new.validate()?;

        if self.recovery_mode {
            // Only the data-root redirect can unblock recovery mode.
            return self.redirect_data_root(new.data_root);
        }

        if !new.storage_root.equivalent(&self.settings.storage_root) {
            config::migrate_storage_root(&self.settings.storage_root, &new.storage_root)?;
            rebase_snapshot_paths(&mut self.library, &self.settings.storage_root, &new.storage_root);
        }

        let data_root_changed = !new.data_root.equivalent(&self.settings.data_root);
        self.settings = new;
        if data_root_changed && self.manage_bootstrap {
            Bootstrap {
                data_root: Some(self.settings.data_root.clone()),
            }
            .save();
        }
        self.persist();
        Ok(())
    }

    fn redirect_data_root(&mut self, data_root: StrictPath) -> Result<(), Error> {
        if data_root.create_dirs().is_err() || !data_root.is_dir() {
            log::error!("redirected data root is still unreachable: {:?}", data_root.raw());
            return Err(Error::RecoveryMode);
        }
        if self.manage_bootstrap {
            Bootstrap {
                data_root: Some(data_root.clone()),
            }
            .save();
        }

        let refreshed = Self::load_at(data_root);
        self.settings = refreshed.settings;
        self.library = refreshed.library;
        self.recovery_mode = false;
        log::info!("recovery mode cleared; data root redirected");
        self.persist();
        Ok(())
    }
}

/// After a storage migration, snapshot rows must follow their payload.
fn rebase_snapshot_paths(library: &mut Library, old_root: &StrictPath, new_root: &StrictPath) {
    let old_prefix = format!("{}/", old_root.render());
    let new_rendered = new_root.render();
    for snapshot in &mut library.snapshots {
        let rendered = snapshot.storage_path.render();
        if let Some(remainder) = rendered.strip_prefix(&old_prefix) {
            snapshot.storage_path = StrictPath::new(format!("{new_rendered}/{remainder}"));
        }
    }
}
