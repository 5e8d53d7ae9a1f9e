use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use chrono::Utc;

use crate::{
    api::{BackupProgress, EventSink},
    library::{EventKind, GameStatus, Library, LocationKind, SaveLocation, Snapshot, SnapshotFile, SnapshotReason},
    prelude::{new_id, Error, StrictPath},
    resource::config::Settings,
    snapshot::{
        aggregate_checksum, assign_storage_folders, unique_snapshot_dir, ManifestLocation, SnapshotManifest,
        MANIFEST_VERSION, SNAPSHOTS_DIR_NAME,
    },
};

/// At most one backup may be in flight per game. A second request for a
/// busy game returns immediately with no work done.
#[derive(Default)]
pub struct InFlight(Mutex<HashSet<String>>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self, game_id: &str) -> Option<InFlightGuard<'_>> {
        let mut busy = self.0.lock().unwrap();
        if !busy.insert(game_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            owner: self,
            game_id: game_id.to_string(),
        })
    }
}

pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
    game_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.0.lock().unwrap().remove(&self.game_id);
    }
}

/// Creates a snapshot of the game's enabled save locations. Returns `None`
/// without error when there is nothing to do: another backup is in flight,
/// no locations are enabled, or the locations hold no files.
pub fn backup(
    library: &mut Library,
    settings: &Settings,
    in_flight: &InFlight,
    events: &dyn EventSink,
    game_id: &str,
    reason: SnapshotReason,
    skip_retention: bool,
) -> Result<Option<Snapshot>, Error> {
    let game = library.require_game(game_id)?.clone();

    let Some(_guard) = in_flight.try_begin(game_id) else {
        log::info!("[{}] backup already in flight; ignoring request", &game.name);
        return Ok(None);
    };

    let locations: Vec<SaveLocation> = library
        .locations_for_game(game_id)
        .into_iter()
        .filter(|x| x.enabled)
        .cloned()
        .collect();
    if locations.is_empty() {
        log::warn!("[{}] backup skipped: no enabled save locations", &game.name);
        library.update_status(game_id, GameStatus::Warning);
        library.log_event(
            Some(game_id),
            EventKind::Backup,
            "Backup skipped: no enabled save locations.".to_string(),
        );
        return Ok(None);
    }

    let snapshots_root = settings.storage_root.joined(&game.folder_name).joined(SNAPSHOTS_DIR_NAME);
    let now = Utc::now();
    let snapshot_root = unique_snapshot_dir(&snapshots_root, &now);
    snapshot_root.create_dirs().map_err(|e| Error::Filesystem {
        why: format!("unable to create snapshot directory: {e}"),
    })?;
    log::info!("[{}] creating {} snapshot: {:?}", &game.name, reason, snapshot_root.raw());

    match execute(
        library,
        settings,
        events,
        &game.name,
        game_id,
        reason,
        skip_retention,
        &locations,
        &snapshot_root,
        &now,
    ) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            log::error!("[{}] backup failed, rolling back snapshot directory: {e}", &game.name);
            let _ = snapshot_root.remove();
            Err(e)
        }
    }
}

fn execute(
    library: &mut Library,
    settings: &Settings,
    events: &dyn EventSink,
    game_name: &str,
    game_id: &str,
    reason: SnapshotReason,
    skip_retention: bool,
    locations: &[SaveLocation],
    snapshot_root: &StrictPath,
    now: &chrono::DateTime<Utc>,
) -> Result<Option<Snapshot>, Error> {
    let storage_folders = assign_storage_folders(locations);

    let mut manifest_locations = BTreeMap::new();
    for location in locations {
        manifest_locations.insert(
            location.id.clone(),
            ManifestLocation {
                path: location.path.clone(),
                kind: location.kind,
                auto_detected: location.auto_detected,
                enabled: location.enabled,
                storage_folder: storage_folders[&location.id].clone(),
            },
        );
    }

    // First pass: enumerate what there is to copy, so progress can report
    // totals and missing locations are flagged up front.
    let mut location_warnings = 0;
    let mut planned: Vec<(&SaveLocation, Vec<(StrictPath, String)>)> = vec![];
    for location in locations {
        if !location.path.exists() {
            log::warn!("[{game_name}] save location missing: {:?}", location.path.raw());
            location_warnings += 1;
            library.log_event(
                Some(game_id),
                EventKind::Error,
                format!("Save location missing: {}", location.path.render()),
            );
            continue;
        }

        let files: Vec<(StrictPath, String)> = match location.kind {
            LocationKind::File => match location.path.leaf() {
                Some(leaf) if location.path.is_file() => vec![(location.path.clone(), leaf)],
                _ => vec![],
            },
            LocationKind::Folder => {
                let prefix = format!("{}/", location.path.render());
                location
                    .path
                    .walk_files()
                    .filter_map(|file| {
                        let relative = file.render().strip_prefix(&prefix)?.to_string();
                        Some((file, relative))
                    })
                    .collect()
            }
        };
        planned.push((location, files));
    }

    let total: usize = planned.iter().map(|(_, files)| files.len()).sum();
    if total == 0 {
        log::warn!("[{game_name}] backup skipped: no files found");
        library.update_status(game_id, GameStatus::Warning);
        library.log_event(
            Some(game_id),
            EventKind::Backup,
            "Backup skipped: no files found in enabled save locations.".to_string(),
        );
        snapshot_root.remove().map_err(|e| Error::Filesystem {
            why: format!("unable to remove empty snapshot directory: {e}"),
        })?;
        return Ok(None);
    }

    let snapshot_id = new_id();
    let mut file_rows: Vec<SnapshotFile> = vec![];
    let mut processed = 0;
    for (location, files) in planned {
        let storage_folder = &storage_folders[&location.id];
        for (source, relative) in files {
            let dest = snapshot_root.joined(storage_folder).joined(&relative);
            source.copy_to_with_retries(&dest)?;
            let checksum = dest.sha256().map_err(|e| Error::Filesystem {
                why: format!("unable to hash {}: {e}", dest.render()),
            })?;
            file_rows.push(SnapshotFile {
                id: new_id(),
                snapshot_id: snapshot_id.clone(),
                location_id: location.id.clone(),
                relative_path: relative,
                size_bytes: dest.size(),
                checksum,
            });
            processed += 1;
            events.backup_progress(&BackupProgress {
                game_id: game_id.to_string(),
                processed,
                total,
            });
        }
    }

    let manifest = SnapshotManifest {
        version: MANIFEST_VERSION,
        snapshot_id: snapshot_id.clone(),
        created_at: *now,
        reason,
        locations: manifest_locations,
    };
    manifest.write(snapshot_root)?;

    let snapshot = Snapshot {
        id: snapshot_id,
        game_id: game_id.to_string(),
        created_at: *now,
        size_bytes: file_rows.iter().map(|x| x.size_bytes).sum(),
        checksum: aggregate_checksum(&file_rows),
        storage_path: snapshot_root.clone(),
        reason,
    };
    log::info!(
        "[{game_name}] snapshot committed: {} files, {} bytes",
        file_rows.len(),
        snapshot.size_bytes
    );
    library.add_snapshot(snapshot.clone(), file_rows);

    if !skip_retention {
        apply_retention(library, settings, game_name, game_id);
    }

    let status = if location_warnings > 0 {
        GameStatus::Warning
    } else {
        GameStatus::Protected
    };
    library.update_status(game_id, status);
    library.log_event(Some(game_id), EventKind::Backup, format!("Snapshot created ({reason})."));
    events.backup_created(&snapshot);

    Ok(Some(snapshot))
}

/// Keeps the most recent `retention_count` snapshots; the rest lose their
/// directories and rows. Runs only after the new snapshot is committed.
fn apply_retention(library: &mut Library, settings: &Settings, game_name: &str, game_id: &str) {
    let excess: Vec<(String, StrictPath)> = library
        .snapshots_for_game(game_id)
        .into_iter()
        .skip(settings.retention_count as usize)
        .map(|x| (x.id.clone(), x.storage_path.clone()))
        .collect();

    for (snapshot_id, storage_path) in excess {
        log::info!("[{game_name}] retention: removing snapshot {snapshot_id}");
        if let Err(e) = storage_path.remove() {
            log::warn!("[{game_name}] retention could not remove {:?}: {e}", storage_path.raw());
            continue;
        }
        library.remove_snapshot(&snapshot_id);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        prelude::sha256,
        testing::{CountingSink, TestEnv},
    };

    #[test]
    fn happy_path_copies_files_and_records_checksums() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.joined("a.sav").write_with_content("abc").unwrap();
        saves.joined("sub/b.sav").write_with_content("xyz").unwrap();
        let location = env.add_folder_location(&game.id, &saves);

        let snapshot = backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &CountingSink::default(),
            &game.id,
            SnapshotReason::Manual,
            false,
        )
        .unwrap()
        .unwrap();

        assert_eq!(2, env.library.files_for_snapshot(&snapshot.id).len());
        assert_eq!(6, snapshot.size_bytes);
        assert_eq!(SnapshotReason::Manual, snapshot.reason);

        let expected = sha256(&format!(
            "{loc}:a.sav:{a}:3|{loc}:sub/b.sav:{b}:3",
            loc = location.id,
            a = sha256("abc"),
            b = sha256("xyz"),
        ));
        assert_eq!(expected, snapshot.checksum);

        assert_eq!(GameStatus::Protected, env.library.game(&game.id).unwrap().status);
        assert_eq!(
            "Snapshot created (manual).",
            env.library.event_logs.last().unwrap().message
        );

        // Payload is under the per-location storage folder.
        let manifest = SnapshotManifest::load(&snapshot.storage_path).unwrap();
        let storage_folder = &manifest.location(&location.id).unwrap().storage_folder;
        assert_eq!(
            "abc",
            snapshot
                .storage_path
                .joined(storage_folder)
                .joined("a.sav")
                .try_read()
                .unwrap()
        );
    }

    #[test]
    fn file_locations_store_the_basename() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");
        let file = env.scratch("cfg").joined("profile.ini");
        file.write_with_content("x=1").unwrap();
        env.add_file_location(&game.id, &file);

        let snapshot = backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &CountingSink::default(),
            &game.id,
            SnapshotReason::Auto,
            false,
        )
        .unwrap()
        .unwrap();

        let rows = env.library.files_for_snapshot(&snapshot.id);
        assert_eq!(1, rows.len());
        assert_eq!("profile.ini", rows[0].relative_path);
    }

    #[test]
    fn no_enabled_locations_skips_with_a_warning() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");

        let outcome = backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &CountingSink::default(),
            &game.id,
            SnapshotReason::Manual,
            false,
        )
        .unwrap();

        assert_eq!(None, outcome);
        assert_eq!(GameStatus::Warning, env.library.game(&game.id).unwrap().status);
        assert_eq!(
            "Backup skipped: no enabled save locations.",
            env.library.event_logs.last().unwrap().message
        );
        assert!(env.library.snapshots.is_empty());
    }

    #[test]
    fn empty_locations_skip_and_remove_the_snapshot_directory() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.create_dirs().unwrap();
        env.add_folder_location(&game.id, &saves);

        let outcome = backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &CountingSink::default(),
            &game.id,
            SnapshotReason::Manual,
            false,
        )
        .unwrap();

        assert_eq!(None, outcome);
        assert_eq!(
            "Backup skipped: no files found in enabled save locations.",
            env.library.event_logs.last().unwrap().message
        );
        // The provisional snapshot directory was cleaned up.
        let snapshots_root = env
            .settings
            .storage_root
            .joined(&env.library.game(&game.id).unwrap().folder_name)
            .joined(SNAPSHOTS_DIR_NAME);
        let leftovers = std::fs::read_dir(snapshots_root.interpret())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(0, leftovers);
    }

    #[test]
    fn missing_locations_are_flagged_but_do_not_abort() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.joined("a.sav").write_with_content("abc").unwrap();
        env.add_folder_location(&game.id, &saves);
        env.add_folder_location(&game.id, &env.scratch("missing"));

        let snapshot = backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &CountingSink::default(),
            &game.id,
            SnapshotReason::Manual,
            false,
        )
        .unwrap()
        .unwrap();

        assert_eq!(1, env.library.files_for_snapshot(&snapshot.id).len());
        assert_eq!(GameStatus::Warning, env.library.game(&game.id).unwrap().status);
        assert!(env
            .library
            .event_logs
            .iter()
            .any(|x| x.kind == EventKind::Error && x.message.starts_with("Save location missing")));
    }

    #[test]
    fn retention_keeps_only_the_most_recent_snapshots() {
        let mut env = TestEnv::new();
        env.settings.retention_count = 1;
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.joined("a.sav").write_with_content("abc").unwrap();
        env.add_folder_location(&game.id, &saves);

        let first = env.backup(&game.id).unwrap();
        let second = env.backup(&game.id).unwrap();

        let remaining = env.library.snapshots_for_game(&game.id);
        assert_eq!(1, remaining.len());
        assert_eq!(second.id, remaining[0].id);
        assert!(!first.storage_path.exists());
        assert!(second.storage_path.exists());
    }

    #[test]
    fn skip_retention_bypasses_pruning() {
        let mut env = TestEnv::new();
        env.settings.retention_count = 1;
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.joined("a.sav").write_with_content("abc").unwrap();
        env.add_folder_location(&game.id, &saves);

        env.backup(&game.id).unwrap();
        backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &CountingSink::default(),
            &game.id,
            SnapshotReason::PreRestore,
            true,
        )
        .unwrap()
        .unwrap();

        assert_eq!(2, env.library.snapshots_for_game(&game.id).len());
    }

    #[test]
    fn a_busy_game_returns_null_and_writes_nothing() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.joined("a.sav").write_with_content("abc").unwrap();
        env.add_folder_location(&game.id, &saves);

        let _guard = env.in_flight.try_begin(&game.id).unwrap();
        let outcome = backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &CountingSink::default(),
            &game.id,
            SnapshotReason::Manual,
            false,
        )
        .unwrap();

        assert_eq!(None, outcome);
        assert!(env.library.snapshots.is_empty());
        assert!(!env
            .settings
            .storage_root
            .joined(&env.library.game(&game.id).unwrap().folder_name)
            .joined(SNAPSHOTS_DIR_NAME)
            .exists());
    }

    #[test]
    fn the_in_flight_slot_is_released_after_a_backup() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.joined("a.sav").write_with_content("abc").unwrap();
        env.add_folder_location(&game.id, &saves);

        env.backup(&game.id).unwrap();
        assert!(env.in_flight.try_begin(&game.id).is_some());
    }

    #[test]
    fn progress_and_creation_events_are_emitted() {
        let mut env = TestEnv::new();
        let game = env.add_game("Game");
        let saves = env.scratch("saves");
        saves.joined("a.sav").write_with_content("abc").unwrap();
        saves.joined("b.sav").write_with_content("xyz").unwrap();
        env.add_folder_location(&game.id, &saves);

        let sink = CountingSink::default();
        backup(
            &mut env.library,
            &env.settings,
            &env.in_flight,
            &sink,
            &game.id,
            SnapshotReason::Manual,
            false,
        )
        .unwrap()
        .unwrap();

        assert_eq!(2, sink.progress_updates());
        assert_eq!(1, sink.created_snapshots());
    }

    #[test]
    fn unknown_games_are_rejected() {
        let mut env = TestEnv::new();
        assert!(matches!(
            backup(
                &mut env.library,
                &env.settings,
                &env.in_flight,
                &CountingSink::default(),
                "ghost",
                SnapshotReason::Manual,
                false,
            ),
            Err(Error::NotFound { .. })
        ));
    }
}
