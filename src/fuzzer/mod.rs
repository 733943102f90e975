//! Coordinator: owns the shared knowledge base, spawns the fuzz threads and
//! handles shutdown.
//!
//! Shutdown is cooperative only: SIGINT/SIGTERM flip one atomic stop flag,
//! the coordinator SIGKILLs whatever child each worker is currently waiting
//! on so `waitpid` unblocks, and then joins the threads. Nothing is ever
//! cancelled forcibly.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::checkpoint;
use crate::graph::GraphParams;
use crate::knowledge::Knowledge;
use crate::settings::Settings;

pub(crate) mod exec;
mod worker;
pub(crate) use worker::Worker;

/// Executions across all threads, counted once per child run. Monotone;
/// the status display reads it without synchronization.
pub(crate) static TOTAL_EXECUTIONS: AtomicU64 = AtomicU64::new(0);
pub(crate) static CRASH_COUNT: AtomicU64 = AtomicU64::new(0);

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_stop_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).expect("failed to install SIGINT handler");
        sigaction(Signal::SIGTERM, &action).expect("failed to install SIGTERM handler");
    }
}

/// Restore a checkpoint if one exists and was produced for the same target;
/// anything else (missing, corrupt, different target) starts fresh.
fn restore_or_new(settings: Settings, params: GraphParams) -> Knowledge {
    let path = settings.checkpoint_path();
    if !path.exists() {
        return Knowledge::new(settings, params);
    }
    match checkpoint::load(&path) {
        Ok(checkpoint) => {
            if checkpoint.settings.target_program == settings.target_program {
                match Knowledge::from_checkpoint(settings.clone(), checkpoint) {
                    Ok(knowledge) => {
                        log::info!(
                            "restored checkpoint from {} ({} history entries, {} nodes)",
                            path.display(),
                            knowledge.valid_count(),
                            knowledge.graph.node_count()
                        );
                        return knowledge;
                    }
                    Err(err) => log::warn!("discarding checkpoint: {err}"),
                }
            } else {
                log::warn!(
                    "checkpoint is for {:?}, fuzzing {:?}; starting fresh",
                    checkpoint.settings.target_program,
                    settings.target_program
                );
            }
        }
        Err(err) => log::warn!("discarding unreadable checkpoint: {err}"),
    }
    Knowledge::new(settings, params)
}

pub(crate) fn fuzz(settings: Settings, graph_params: GraphParams, status_interval: Duration) {
    let knowledge = Arc::new(restore_or_new(settings, graph_params));

    if let Some(seed_path) = knowledge.settings.seed_path.clone() {
        log::info!("loading seeds from {seed_path}");
        match crate::seed::load_seed_dir(&knowledge, std::path::Path::new(&seed_path)) {
            Ok(count) => log::info!("loaded {count} seed inputs into history"),
            Err(err) => log::warn!("seed loading failed: {err}"),
        }
    }

    STOP.store(false, Ordering::SeqCst);
    install_stop_handlers();

    let start = Instant::now();
    let mut handles = Vec::new();
    let mut child_pids = Vec::new();
    for thread_id in 0..knowledge.settings.thread_count {
        let knowledge = knowledge.clone();
        let current_child = Arc::new(AtomicI32::new(0));
        child_pids.push(current_child.clone());
        let handle = std::thread::Builder::new()
            .name(format!("worker-{thread_id}"))
            .spawn(move || {
                let mut worker = match Worker::new(knowledge, thread_id, current_child) {
                    Ok(worker) => worker,
                    Err(err) => {
                        log::error!("worker {thread_id} failed to start: {err}");
                        return;
                    }
                };
                if let Err(err) = worker.run(&STOP) {
                    log::error!("worker {thread_id} terminated: {err}");
                }
            })
            .expect("failed to spawn worker thread");
        handles.push(handle);
    }

    let mut last_status = Instant::now();
    while !STOP.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if last_status.elapsed() >= status_interval {
            last_status = Instant::now();
            let executions = TOTAL_EXECUTIONS.load(Ordering::Relaxed);
            let elapsed = start.elapsed().as_secs_f64().max(0.001);
            log::info!(
                "execs: {executions} ({:.1}/s) | crashes: {} | unique traces: {} | graph nodes: {}",
                executions as f64 / elapsed,
                CRASH_COUNT.load(Ordering::Relaxed),
                knowledge.valid_count(),
                knowledge.graph.node_count()
            );
        }
    }

    log::info!("shutting down, killing in-flight children");
    for current_child in &child_pids {
        exec::kill_current_child(current_child);
    }
    for handle in handles {
        if handle.join().is_err() {
            log::error!("a worker thread panicked");
        }
    }

    log::info!(
        "done after {}: {} executions, {} crashes, {} unique traces",
        humantime::format_duration(Duration::from_secs(start.elapsed().as_secs())),
        TOTAL_EXECUTIONS.load(Ordering::Relaxed),
        CRASH_COUNT.load(Ordering::Relaxed),
        knowledge.valid_count()
    );
}
