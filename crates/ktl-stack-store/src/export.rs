use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::store::StateStore;
use crate::StoreError;

/// Export one run as a portable `<runID>.tgz`: `manifest.json`, the run's
/// `plan.json` and the checkpointed `state.sqlite`.
///
/// The tar layout is deterministic: entries sorted by name, `uid=gid=0`,
/// `mtime=0`, mode 0644. Re-exporting an unchanged store yields identical
/// bytes.
pub fn export_run(store: &StateStore, run_id: &str, out_path: &Path) -> Result<(), StoreError> {
    // Fold the WAL into the main file so the copied db stands alone.
    store.checkpoint_portable()?;

    let plan = store.get_run_plan(run_id)?;
    let plan_json = serde_json::to_vec_pretty(&plan)?;
    let run_digest = store.get_run_digest(run_id)?;
    let db_bytes = fs::read(store.db_path()).map_err(|e| StoreError::Io {
        context: format!("failed to read state db {}", store.db_path().display()),
        source: e,
    })?;

    let manifest = serde_json::json!({
        "run_id": run_id,
        "run_digest": run_digest,
        "files": {
            "plan.json": ktl_stack_hash::sha256_hex(&plan_json),
            "state.sqlite": ktl_stack_hash::sha256_hex(&db_bytes),
        },
    });
    let manifest_json = serde_json::to_vec_pretty(&manifest)?;

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::Io {
            context: format!("failed to create export dir {}", parent.display()),
            source: e,
        })?;
    }

    let file = fs::File::create(out_path).map_err(|e| StoreError::Io {
        context: format!("failed to create export {}", out_path.display()),
        source: e,
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    // Sorted member order is part of the format.
    append_member(&mut tar, "manifest.json", &manifest_json)?;
    append_member(&mut tar, "plan.json", &plan_json)?;
    append_member(&mut tar, "state.sqlite", &db_bytes)?;

    let encoder = tar.into_inner().map_err(|e| StoreError::Io {
        context: "failed to finish export tar".to_string(),
        source: e,
    })?;
    encoder
        .finish()
        .and_then(|mut f| f.flush().map(|()| f))
        .map_err(|e| StoreError::Io {
            context: "failed to finish export gzip stream".to_string(),
            source: e,
        })?;
    Ok(())
}

fn append_member<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> Result<(), StoreError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    tar.append_data(&mut header, name, bytes)
        .map_err(|e| StoreError::Io {
            context: format!("failed to append {name} to export tar"),
            source: e,
        })
}
