use std::{cell::Cell, collections::HashMap};

use crate::{
    api::{BackupProgress, Core, EventSink, NullEventSink, NullSessionMonitor},
    library::{Game, Library, LocationKind, SaveLocation, Snapshot, SnapshotReason},
    prelude::StrictPath,
    resource::config::Settings,
    scan::{
        metadata::{ExeMetadata, ExeMetadataAdapter, NoopExeMetadataAdapter},
        registry::{NoopRegistryAdapter, RegistryAdapter, RegistryItem},
        steam::SteamEnv,
    },
    snapshot::backup::{self, InFlight},
};

pub fn catalog_file(root: &StrictPath, content: &str) -> StrictPath {
    let path = root.joined("catalog.json");
    path.write_with_content(content).unwrap();
    path
}

#[derive(Default)]
pub struct FakeMetadataAdapter {
    metadata: ExeMetadata,
}

impl FakeMetadataAdapter {
    pub fn new(product_name: &str, file_description: &str) -> Self {
        Self {
            metadata: ExeMetadata {
                product_name: (!product_name.is_empty()).then(|| product_name.to_string()),
                file_description: (!file_description.is_empty()).then(|| file_description.to_string()),
            },
        }
    }
}

impl ExeMetadataAdapter for FakeMetadataAdapter {
    fn read(&self, _exe: &StrictPath) -> Option<ExeMetadata> {
        (!self.metadata.is_empty()).then(|| self.metadata.clone())
    }
}

#[derive(Default)]
pub struct FakeRegistryAdapter {
    values: HashMap<String, Vec<String>>,
}

impl FakeRegistryAdapter {
    pub fn with_value(rule: &str, value: &str) -> Self {
        Self {
            values: HashMap::from([(rule.to_string(), vec![value.to_string()])]),
        }
    }
}

impl RegistryAdapter for FakeRegistryAdapter {
    fn read_string_values(&self, item: &RegistryItem) -> Vec<String> {
        self.values.get(&item.raw()).cloned().unwrap_or_default()
    }
}

#[derive(Default)]
pub struct CountingSink {
    progress: Cell<usize>,
    created: Cell<usize>,
}

impl CountingSink {
    pub fn progress_updates(&self) -> usize {
        self.progress.get()
    }

    pub fn created_snapshots(&self) -> usize {
        self.created.get()
    }
}

impl EventSink for CountingSink {
    fn backup_progress(&self, _progress: &BackupProgress) {
        self.progress.set(self.progress.get() + 1);
    }

    fn backup_created(&self, _snapshot: &Snapshot) {
        self.created.set(self.created.get() + 1);
    }
}

/// A scratch data root, storage root, and library for exercising the
/// backup subsystems against a real (temporary) filesystem.
pub struct TestEnv {
    pub settings: Settings,
    pub library: Library,
    pub in_flight: InFlight,
    scratch_root: StrictPath,
    _tempdir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let root = StrictPath::from_std_path_buf(tempdir.path());

        let mut settings = Settings::default();
        settings.data_root = root.joined("data");
        settings.storage_root = root.joined("backups");
        settings.storage_root.create_dirs().unwrap();

        Self {
            settings,
            library: Library::default(),
            in_flight: InFlight::new(),
            scratch_root: root.joined("scratch"),
            _tempdir: tempdir,
        }
    }

    /// A path outside the storage and data roots.
    pub fn scratch(&self, name: &str) -> StrictPath {
        self.scratch_root.joined(name)
    }

    pub fn add_game(&mut self, name: &str) -> Game {
        let install = self.scratch(&format!("{name} install"));
        install.create_dirs().unwrap();
        let game = self
            .library
            .add_game(name, install.joined("game.exe"), install.clone())
            .unwrap();
        game.write_metadata(&self.settings.storage_root).unwrap();
        game
    }

    pub fn add_folder_location(&mut self, game_id: &str, path: &StrictPath) -> SaveLocation {
        self.library
            .add_location(game_id, path.clone(), LocationKind::Folder, false)
            .unwrap()
    }

    pub fn add_file_location(&mut self, game_id: &str, path: &StrictPath) -> SaveLocation {
        self.library
            .add_location(game_id, path.clone(), LocationKind::File, false)
            .unwrap()
    }

    pub fn backup(&mut self, game_id: &str) -> Option<Snapshot> {
        backup::backup(
            &mut self.library,
            &self.settings,
            &self.in_flight,
            &CountingSink::default(),
            game_id,
            SnapshotReason::Manual,
            false,
        )
        .unwrap()
    }

    /// A `Core` sharing this environment's on-disk state.
    pub fn core(&self) -> Core {
        Core::with_components(
            self.settings.clone(),
            self.library.clone(),
            SteamEnv::default(),
            Box::new(NoopExeMetadataAdapter),
            Box::new(NoopRegistryAdapter),
            Box::new(NullSessionMonitor),
            Box::new(NullEventSink),
        )
    }
}
