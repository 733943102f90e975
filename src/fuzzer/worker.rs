//! Per-thread fuzz loop.
//!
//! Every worker owns its shared-memory region and child process and keeps a
//! per-byte exploration-speed vector: positive entries are that byte's
//! learning rate, non-positive entries freeze the byte. Bytes whose change
//! just produced a new trace get frozen (they were worth something — leave
//! them alone for a while), then thaw gradually through the accelerate step.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::Signal;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::{TraceChannel, SHM_NAME_BASE};
use crate::crash::CrashReport;
use crate::error::Error;
use crate::knowledge::{FuzzExecution, Knowledge};
use crate::{loss, HashSet};

use super::exec::{exec_once, TracerCommand};
use super::{CRASH_COUNT, TOTAL_EXECUTIONS};

const DEFAULT_ETA: f64 = 0.01;
const FROZEN: f64 = -1.0;
const ACCELERATION: f64 = 0.001;

pub(crate) struct Worker {
    knowledge: Arc<Knowledge>,
    thread_id: u32,
    input_size: usize,
    channel: TraceChannel,
    command: TracerCommand,
    exploration_speed: Vec<f64>,
    rng: StdRng,
    current_child: Arc<AtomicI32>,
}

impl Worker {
    pub(crate) fn new(
        knowledge: Arc<Knowledge>,
        thread_id: u32,
        current_child: Arc<AtomicI32>,
    ) -> Result<Self, Error> {
        let region_name = format!("{SHM_NAME_BASE}_{thread_id}");
        let channel = TraceChannel::create(&region_name)?;
        let command = TracerCommand::new(&knowledge.settings, &region_name);
        let input_size = knowledge.settings.input_size_for_thread(thread_id);
        Ok(Self {
            knowledge,
            thread_id,
            input_size,
            channel,
            command,
            exploration_speed: vec![DEFAULT_ETA; input_size],
            rng: StdRng::from_os_rng(),
            current_child,
        })
    }

    fn exec(&mut self, input: &[u8]) -> Result<(FuzzExecution, Option<Signal>), Error> {
        exec_once(&self.channel, &self.command, input, &self.current_child)
    }

    fn random_input(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.random()).collect()
    }

    /// Grow or shrink an input to this thread's size, padding with random
    /// bytes when growing.
    fn resize_input(&mut self, input: &mut Vec<u8>) {
        while input.len() < self.input_size {
            input.push(self.rng.random());
        }
        input.truncate(self.input_size);
    }

    fn reset_exploration_speed(&mut self) {
        self.exploration_speed = vec![DEFAULT_ETA; self.input_size];
    }

    fn record_crash(&self, execution: &FuzzExecution, signal: Signal) {
        CRASH_COUNT.fetch_add(1, Ordering::Relaxed);
        let report = CrashReport {
            little_endian: cfg!(target_endian = "little"),
            signal: signal as i32,
            target_args: self.command.target_args().to_vec(),
            input: execution.input.clone(),
            trace: execution.trace.clone(),
            graph: self.knowledge.graph.snapshot(),
        };
        let dir = std::path::PathBuf::from(&self.knowledge.settings.work_dir);
        match report.save(&dir, self.thread_id) {
            Ok(path) => log::info!(
                "worker {}: target crashed with {signal}, saved {}",
                self.thread_id,
                path.display()
            ),
            Err(err) => log::error!(
                "worker {}: target crashed with {signal} but saving the report failed: {err}",
                self.thread_id
            ),
        }
    }

    /// Bootstrap until the shared history holds at least two valid
    /// executions: a random input first, then a 10-60% byte flip of the
    /// first recorded input.
    fn initialization_run(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        while !stop.load(Ordering::SeqCst) {
            let history = self.knowledge.history_snapshot();
            let valid: Vec<&FuzzExecution> =
                history.iter().filter(|slot| slot.is_valid()).collect();
            if valid.len() >= 2 {
                return Ok(());
            }

            let input = if valid.is_empty() {
                self.reset_exploration_speed();
                self.random_input(self.input_size)
            } else {
                let mut input = valid[0].input.clone();
                self.resize_input(&mut input);
                self.flip_random_bytes(&mut input);
                if self.exploration_speed.len() != input.len() {
                    self.reset_exploration_speed();
                }
                input
            };

            let (execution, signal) = self.exec(&input)?;
            if let Some(signal) = signal {
                self.record_crash(&execution, signal);
            }
            if !execution.trace.is_empty() {
                self.knowledge.add_if_different(&execution);
            }
            TOTAL_EXECUTIONS.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Flip 10% to 60% of the bytes (at least one) to fresh random values.
    fn flip_random_bytes(&mut self, input: &mut [u8]) {
        let fraction = self.rng.random_range(0.10..0.60);
        let count = ((input.len() as f64 * fraction) as usize).max(1);
        let mut flipped = HashSet::default();
        while flipped.len() < count.min(input.len()) {
            let index = self.rng.random_range(0..input.len());
            if flipped.insert(index) {
                input[index] = self.rng.random();
            }
        }
    }

    /// Pick a forbidden execution: scan forward from a random ring position
    /// until a valid slot turns up. Initialization guarantees there is one.
    fn pick_forbidden(&mut self, history: &[FuzzExecution]) -> FuzzExecution {
        let capacity = history.len();
        let start = self.rng.random_range(0..capacity);
        for offset in 0..capacity {
            let slot = &history[(start + offset) % capacity];
            if slot.is_valid() {
                return slot.clone();
            }
        }
        panic!("no valid execution in history");
    }

    pub(crate) fn run(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        self.initialization_run(stop)?;
        if self.exploration_speed.len() != self.input_size {
            self.reset_exploration_speed();
        }

        // Continue from the most recently recorded execution.
        let history = self.knowledge.history_snapshot();
        let capacity = self.knowledge.settings.max_history_count;
        let latest = (self.knowledge.history_index() + capacity - 1) % capacity;
        let mut current = if history[latest as usize].is_valid() {
            history[latest as usize].clone()
        } else {
            self.pick_forbidden(&history)
        };
        self.resize_input(&mut current.input);

        while !stop.load(Ordering::SeqCst) {
            let history = self.knowledge.history_snapshot();
            let mut forbidden = self.pick_forbidden(&history);
            self.resize_input(&mut forbidden.input);
            self.resize_input(&mut current.input);

            let previous_input = current.input.clone();
            let next_input = loss::generate_new_input(
                &self.knowledge.graph,
                &forbidden,
                &current,
                &self.exploration_speed,
            );

            let (execution, signal) = self.exec(&next_input)?;
            if let Some(signal) = signal {
                self.record_crash(&execution, signal);
            }
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let added = !execution.trace.is_empty() && self.knowledge.add_if_different(&execution);
            TOTAL_EXECUTIONS.fetch_add(1, Ordering::Relaxed);

            if added {
                freeze_differing(&mut self.exploration_speed, &previous_input, &execution.input);
            }
            accelerate(&mut self.exploration_speed);

            current = execution;
        }
        Ok(())
    }
}

/// Freeze every byte position where the two inputs differ. Positions past
/// the end of the shorter input compare against 0.
fn freeze_differing(speed: &mut Vec<f64>, old_input: &[u8], new_input: &[u8]) {
    let len = old_input.len().max(new_input.len());
    if speed.len() < len {
        speed.resize(len, DEFAULT_ETA);
    }
    for i in 0..len {
        let old = old_input.get(i).copied().unwrap_or(0);
        let new = new_input.get(i).copied().unwrap_or(0);
        if old != new {
            speed[i] = FROZEN;
        }
    }
}

/// Thaw frozen bytes by the acceleration step; nudge live bytes up by a
/// tenth of it. Everything saturates at 1.0.
fn accelerate(speed: &mut [f64]) {
    for value in speed {
        if *value < 0.0 {
            *value += ACCELERATION;
            if *value > 0.0 {
                *value = value.min(1.0);
            }
        } else if *value > 0.0 {
            *value = (*value + ACCELERATION * 0.1).min(1.0);
        }
    }
}
