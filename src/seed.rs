//! Seed loading: run every file of a directory through the target once and
//! feed the resulting traces into the knowledge base.

use std::path::Path;
use std::sync::atomic::AtomicI32;

use crate::channel::{TraceChannel, SHM_NAME_BASE};
use crate::error::Error;
use crate::fuzzer::exec::{exec_once, TracerCommand};
use crate::knowledge::Knowledge;

/// Execute each regular file in `dir` and submit its trace. Crashing or
/// unreadable seeds are logged and skipped; only a missing directory or a
/// failing shared-memory setup aborts. Returns the number of accepted
/// (novel-trace) seeds.
pub(crate) fn load_seed_dir(knowledge: &Knowledge, dir: &Path) -> Result<u32, Error> {
    let region_name = format!("{SHM_NAME_BASE}_seed");
    let channel = TraceChannel::create(&region_name)?;
    let command = TracerCommand::new(&knowledge.settings, &region_name);
    let current_child = AtomicI32::new(0);

    let mut accepted = 0u32;
    let mut skipped = 0u32;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let input = match std::fs::read(&path) {
            Ok(input) => input,
            Err(err) => {
                log::warn!("skipping unreadable seed {}: {err}", path.display());
                skipped += 1;
                continue;
            }
        };
        if input.is_empty() {
            skipped += 1;
            continue;
        }

        match exec_once(&channel, &command, &input, &current_child) {
            Ok((execution, signal)) => {
                if let Some(signal) = signal {
                    log::warn!("seed {} crashed the target with {signal}", path.display());
                }
                if execution.trace.is_empty() {
                    log::debug!("seed {} produced no trace", path.display());
                    skipped += 1;
                } else if knowledge.add_if_different(&execution) {
                    log::info!(
                        "loaded seed {} (trace length {})",
                        path.display(),
                        execution.trace.len()
                    );
                    accepted += 1;
                } else {
                    log::debug!("seed {} duplicates a known trace", path.display());
                    skipped += 1;
                }
            }
            Err(err) => {
                log::warn!("seed {} failed to execute: {err}", path.display());
                skipped += 1;
            }
        }
    }

    log::info!("seed loading complete: {accepted} accepted, {skipped} skipped");
    Ok(accepted)
}
