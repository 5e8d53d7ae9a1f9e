use crate::{
    library::{Game, GameStatus, Library, SaveLocation, Snapshot, SnapshotFile},
    prelude::{new_id, Error, StrictPath},
    resource::config::Settings,
    snapshot::{aggregate_checksum, SnapshotManifest, MANIFEST_FILE_NAME, SNAPSHOTS_DIR_NAME},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub added: usize,
    pub removed: usize,
    pub removed_files: usize,
    pub skipped_unknown_games: usize,
    pub skipped_invalid: usize,
}

fn subdirectories(path: &StrictPath) -> Vec<(String, StrictPath)> {
    let Ok(entries) = std::fs::read_dir(path.interpret()) else {
        return vec![];
    };
    entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            (name.clone(), path.joined(&name))
        })
        .collect()
}

/// Resolves a storage-root subdirectory to a game id, recovering the game
/// from its `metadata.json` sidecar when the index does not know it.
fn resolve_game(library: &mut Library, storage_root: &StrictPath, folder_name: &str) -> Option<String> {
    if let Some(game) = library.game_by_folder(folder_name) {
        return Some(game.id.clone());
    }

    let sidecar = Game::metadata_path(storage_root, folder_name);
    let metadata = Game::load_metadata(&sidecar)?;

    if let Some(existing) = library.game_mut(&metadata.id) {
        log::info!(
            "[{}] re-linking game folder {:?} (was {:?})",
            existing.name,
            folder_name,
            existing.folder_name
        );
        existing.folder_name = folder_name.to_string();
        return Some(metadata.id);
    }

    log::info!("[{}] recovering game from sidecar in {:?}", metadata.name, folder_name);
    let mut recovered = metadata;
    recovered.folder_name = folder_name.to_string();
    recovered.status = GameStatus::Warning;
    let id = recovered.id.clone();
    library.games.push(recovered);
    Some(id)
}

fn recover_snapshot(
    library: &mut Library,
    game_id: &str,
    snapshot_root: &StrictPath,
    manifest: &SnapshotManifest,
) -> Result<(), Error> {
    let prefix = format!("{}/", snapshot_root.render());

    let mut file_rows: Vec<SnapshotFile> = vec![];
    for file in snapshot_root.walk_files() {
        let rendered = file.render();
        let Some(relative_full) = rendered.strip_prefix(&prefix) else {
            continue;
        };
        if relative_full == MANIFEST_FILE_NAME {
            continue;
        }
        let Some((storage_folder, relative_path)) = relative_full.split_once('/') else {
            log::warn!("stray file at snapshot root: {rendered:?}");
            continue;
        };
        let Some((location_id, _)) = manifest.location_by_storage_folder(storage_folder) else {
            log::warn!("no manifest mapping for storage folder {storage_folder:?} in {rendered:?}");
            continue;
        };
        let checksum = match file.sha256() {
            Ok(x) => x,
            Err(e) => {
                log::warn!("unable to hash {rendered:?}: {e}");
                continue;
            }
        };
        file_rows.push(SnapshotFile {
            id: new_id(),
            snapshot_id: String::new(),
            location_id: location_id.clone(),
            relative_path: relative_path.to_string(),
            size_bytes: file.size(),
            checksum,
        });
    }

    // Prefer the manifest's id, unless another row already claimed it.
    let snapshot_id = if library.snapshot(&manifest.snapshot_id).is_some() {
        log::warn!("snapshot id {} already taken; allocating a fresh one", manifest.snapshot_id);
        new_id()
    } else {
        manifest.snapshot_id.clone()
    };
    for row in &mut file_rows {
        row.snapshot_id = snapshot_id.clone();
    }

    let snapshot = Snapshot {
        id: snapshot_id,
        game_id: game_id.to_string(),
        created_at: manifest.created_at,
        size_bytes: file_rows.iter().map(|x| x.size_bytes).sum(),
        checksum: aggregate_checksum(&file_rows),
        storage_path: snapshot_root.clone(),
        reason: manifest.reason,
    };
    log::info!(
        "[{game_id}] recovered snapshot {:?} with {} files",
        snapshot_root.raw(),
        file_rows.len()
    );
    library.add_snapshot(snapshot, file_rows);

    // Seed minimal location rows so verify/restore work even when the
    // index lost them.
    for (location_id, entry) in &manifest.locations {
        if library.location(location_id).is_none() {
            library.save_locations.push(SaveLocation {
                id: location_id.clone(),
                game_id: game_id.to_string(),
                path: entry.path.clone(),
                kind: entry.kind,
                auto_detected: entry.auto_detected,
                enabled: entry.enabled,
            });
        }
    }

    Ok(())
}

/// Walks the storage root and reconciles the index with what is actually
/// on disk: recovers games from sidecars, rebuilds snapshot rows from
/// manifests, and prunes rows whose directories vanished.
pub fn scan_snapshots_from_disk(library: &mut Library, settings: &Settings) -> Result<ScanResult, Error> {
    let mut result = ScanResult::default();
    let storage_root = &settings.storage_root;

    if storage_root.is_dir() {
        for (folder_name, game_dir) in subdirectories(storage_root) {
            let Some(game_id) = resolve_game(library, storage_root, &folder_name) else {
                log::debug!("skipping unknown game folder: {folder_name:?}");
                result.skipped_unknown_games += 1;
                continue;
            };

            for (_, snapshot_root) in subdirectories(&game_dir.joined(SNAPSHOTS_DIR_NAME)) {
                if library.snapshots.iter().any(|x| x.storage_path.equivalent(&snapshot_root)) {
                    continue;
                }
                let manifest = match SnapshotManifest::load(&snapshot_root) {
                    Ok(x) => x,
                    Err(e) => {
                        log::warn!("skipping snapshot with invalid manifest: {e}");
                        result.skipped_invalid += 1;
                        continue;
                    }
                };
                recover_snapshot(library, &game_id, &snapshot_root, &manifest)?;
                result.added += 1;
            }
        }
    }

    // Rows whose payload vanished are dropped, cascading to file rows.
    let stale: Vec<String> = library
        .snapshots
        .iter()
        .filter(|x| !x.storage_path.is_dir())
        .map(|x| x.id.clone())
        .collect();
    for snapshot_id in stale {
        log::info!("pruning snapshot whose directory vanished: {snapshot_id}");
        result.removed_files += library.remove_snapshot(&snapshot_id);
        result.removed += 1;
    }

    log::info!(
        "scan finished: {} added, {} removed, {} unknown games, {} invalid",
        result.added,
        result.removed,
        result.skipped_unknown_games,
        result.skipped_invalid
    );
    Ok(result)
}
