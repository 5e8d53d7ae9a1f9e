use rayon::prelude::*;

use crate::{
    api::EventSink,
    library::{EventKind, Library, LocationKind, SnapshotFile, SnapshotReason},
    prelude::{Error, StrictPath},
    resource::config::Settings,
    snapshot::{aggregate_checksum, backup, backup::InFlight, SnapshotManifest},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub ok: bool,
    pub issues: usize,
}

fn load_validated(
    library: &Library,
    snapshot_id: &str,
) -> Result<(crate::library::Snapshot, Vec<SnapshotFile>, SnapshotManifest), Error> {
    let snapshot = library.require_snapshot(snapshot_id)?.clone();
    let files: Vec<SnapshotFile> = library
        .files_for_snapshot(snapshot_id)
        .into_iter()
        .cloned()
        .collect();
    let manifest = SnapshotManifest::load(&snapshot.storage_path)?;
    manifest.validate_covers(&files.iter().collect::<Vec<_>>())?;
    Ok((snapshot, files, manifest))
}

/// Replays a snapshot's files back to their origin locations. A safety
/// snapshot is taken first; without it the restore refuses to touch any
/// destination. Disabled or deleted locations are silently skipped.
pub fn restore(
    library: &mut Library,
    settings: &Settings,
    in_flight: &InFlight,
    events: &dyn EventSink,
    snapshot_id: &str,
) -> Result<(), Error> {
    let (snapshot, files, manifest) = load_validated(library, snapshot_id)?;
    let game_name = library
        .game(&snapshot.game_id)
        .map(|x| x.name.clone())
        .unwrap_or_else(|| snapshot.game_id.clone());

    log::info!("[{game_name}] restoring snapshot {snapshot_id}");
    let safety = backup::backup(
        library,
        settings,
        in_flight,
        events,
        &snapshot.game_id,
        SnapshotReason::PreRestore,
        true,
    )?;
    if safety.is_none() {
        log::error!("[{game_name}] safety snapshot was not created; blocking restore");
        return Err(Error::SafetyBackupFailed);
    }

    let snapshot_root = &snapshot.storage_path;
    for file in &files {
        // Covered by validate_covers above.
        let Some(entry) = manifest.location(&file.location_id) else {
            continue;
        };
        let source = snapshot_root
            .joined(&entry.storage_folder)
            .joined(&file.relative_path);
        source.assert_within(snapshot_root, "restore source")?;

        let Some(location) = library.location(&file.location_id) else {
            log::info!("[{game_name}] skipping file for deleted location: {}", file.relative_path);
            continue;
        };
        if !location.enabled {
            log::info!("[{game_name}] skipping file for disabled location: {}", file.relative_path);
            continue;
        }

        let dest_root = match location.kind {
            LocationKind::File => location.path.popped(),
            LocationKind::Folder => location.path.clone(),
        };
        let dest = dest_root.joined(&file.relative_path);
        dest.assert_within(&dest_root, "restore destination")?;

        source.copy_to_with_retries(&dest)?;
    }

    library.log_event(
        Some(&snapshot.game_id),
        EventKind::Restore,
        format!(
            "Snapshot restored ({}).",
            snapshot.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ),
    );
    Ok(())
}

/// Recomputes every file's hash under the snapshot root and compares it to
/// the recorded rows. Missing files and drifted aggregate checksums count
/// as issues; path escapes abort.
pub fn verify(library: &Library, snapshot_id: &str) -> Result<VerifyOutcome, Error> {
    let (snapshot, files, manifest) = load_validated(library, snapshot_id)?;
    let snapshot_root = &snapshot.storage_path;

    let mut issues = 0;
    if aggregate_checksum(&files) != snapshot.checksum {
        log::warn!("snapshot {snapshot_id} has a drifted aggregate checksum");
        issues += 1;
    }

    let mut checks: Vec<(StrictPath, String)> = vec![];
    for file in &files {
        let Some(entry) = manifest.location(&file.location_id) else {
            continue;
        };
        let source = snapshot_root
            .joined(&entry.storage_folder)
            .joined(&file.relative_path);
        source.assert_within(snapshot_root, "verify")?;
        checks.push((source, file.checksum.clone()));
    }

    issues += checks
        .par_iter()
        .map(|(path, expected)| {
            if !path.is_file() {
                log::warn!("snapshot {snapshot_id} is missing {:?}", path.raw());
                return 1;
            }
            match path.sha256() {
                Ok(actual) if actual == *expected => 0,
                Ok(_) => {
                    log::warn!("snapshot {snapshot_id} has a drifted file: {:?}", path.raw());
                    1
                }
                Err(e) => {
                    log::warn!("snapshot {snapshot_id} has an unreadable file {:?}: {e}", path.raw());
                    1
                }
            }
        })
        .sum::<usize>();

    Ok(VerifyOutcome {
        ok: issues == 0,
        issues,
    })
}

/// Removes the snapshot directory first; rows are only dropped once the
/// directory is gone, so a failed delete can be retried.
pub fn delete(library: &mut Library, snapshot_id: &str) -> Result<(), Error> {
    let snapshot = library.require_snapshot(snapshot_id)?.clone();

    snapshot.storage_path.remove().map_err(|e| Error::Filesystem {
        why: format!("unable to delete snapshot directory {}: {e}", snapshot.storage_path.render()),
    })?;

    library.remove_snapshot(snapshot_id);
    library.log_event(Some(&snapshot.game_id), EventKind::Backup, "Snapshot deleted.".to_string());
    Ok(())
}
