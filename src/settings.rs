use std::path::PathBuf;

use speedy::{Readable, Writable};

/// Resolved run configuration. This is what gets persisted into checkpoints
/// so that a restored knowledge base can be matched against the current run.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub(crate) struct Settings {
    // Input size policy: thread t fuzzes inputs of length
    // clamp(min + t * step, min, max).
    pub min_length: u32,
    pub max_length: u32,
    pub step_length: u32,

    pub thread_count: u32,
    pub max_history_count: u32,

    pub target_program: String,
    pub tracer_lib: String,
    pub driver_path: String,
    pub work_dir: String,

    // Where the traced child's stdout/stderr go.
    pub stdout_redirect: String,

    pub seed_path: Option<String>,
}

impl Settings {
    pub(crate) fn input_size_for_thread(&self, thread_id: u32) -> usize {
        let size = self
            .min_length
            .saturating_add(self.step_length.saturating_mul(thread_id));
        size.clamp(self.min_length, self.max_length) as usize
    }

    pub(crate) fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(&self.work_dir).join("knowledge_checkpoint.knowledge")
    }
}
