//! Shared knowledge base: a trace-deduplicating ring of interesting
//! executions plus the explored graph, everything the fuzz threads learn
//! from and contribute to.
//!
//! One mutex guards the history ring; the graph carries its own lock and is
//! always acquired second. `add_if_different` holds the history lock for the
//! whole operation so the dedup scan, the ring write and the graph update
//! advance atomically with respect to other threads.

use std::path::PathBuf;
use std::sync::Mutex;

use speedy::{Readable, Writable};

use crate::checkpoint::{self, Checkpoint};
use crate::graph::{ExploredGraph, GraphParams};
use crate::settings::Settings;

/// One observed behavior of the target: an input and the basic-block trace
/// it produced. A default instance (both vectors empty) marks an empty
/// history slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Readable, Writable)]
pub(crate) struct FuzzExecution {
    pub trace: Vec<u32>,
    pub input: Vec<u8>,
}

impl FuzzExecution {
    pub(crate) fn is_valid(&self) -> bool {
        !self.trace.is_empty() && !self.input.is_empty()
    }
}

struct HistoryRing {
    slots: Vec<FuzzExecution>,
    index: u32,
}

pub(crate) struct Knowledge {
    history: Mutex<HistoryRing>,
    pub(crate) graph: ExploredGraph,
    pub(crate) settings: Settings,
    checkpoint_path: Option<PathBuf>,
}

impl Knowledge {
    pub(crate) fn new(settings: Settings, params: GraphParams) -> Self {
        assert!(settings.max_history_count >= 2);
        let checkpoint_path = Some(settings.checkpoint_path());
        Self {
            history: Mutex::new(HistoryRing {
                slots: vec![FuzzExecution::default(); settings.max_history_count as usize],
                index: 0,
            }),
            graph: ExploredGraph::new(params),
            settings,
            checkpoint_path,
        }
    }

    /// Build a knowledge base from a restored checkpoint. The ring is
    /// re-sized to the current history capacity; the current settings win
    /// over the persisted ones.
    pub(crate) fn from_checkpoint(settings: Settings, checkpoint: Checkpoint) -> Result<Self, crate::error::Error> {
        let graph = ExploredGraph::from_snapshot(checkpoint.graph)?;
        let capacity = settings.max_history_count as usize;
        let mut slots = checkpoint.history;
        let index = if slots.len() == capacity {
            checkpoint.history_index % settings.max_history_count
        } else {
            // Capacity changed: repack the valid entries from the start.
            slots.retain(FuzzExecution::is_valid);
            slots.truncate(capacity);
            let index = (slots.len() % capacity) as u32;
            slots.resize(capacity, FuzzExecution::default());
            index
        };
        let checkpoint_path = Some(settings.checkpoint_path());
        Ok(Self {
            history: Mutex::new(HistoryRing { slots, index }),
            graph,
            settings,
            checkpoint_path,
        })
    }

    /// Used by tests to keep scratch knowledge bases from writing
    /// checkpoints.
    #[cfg(test)]
    pub(crate) fn without_checkpointing(settings: Settings, params: GraphParams) -> Self {
        let mut knowledge = Self::new(settings, params);
        knowledge.checkpoint_path = None;
        knowledge
    }

    /// Record an execution unless a byte-identical trace is already present.
    /// On acceptance the graph absorbs the trace, embeddings are retrained
    /// and a checkpoint is attempted (best effort). Returns whether the
    /// execution was added.
    pub(crate) fn add_if_different(&self, execution: &FuzzExecution) -> bool {
        assert!(
            !execution.trace.is_empty(),
            "add_if_different: empty trace"
        );
        assert!(
            !execution.input.is_empty(),
            "add_if_different: empty input"
        );

        let ring = &mut *self.history.lock().unwrap();
        if ring
            .slots
            .iter()
            .any(|existing| existing.trace == execution.trace)
        {
            return false;
        }

        let index = ring.index as usize;
        ring.slots[index] = execution.clone();
        ring.index = (ring.index + 1) % self.settings.max_history_count;

        self.graph.update_from_trace(&execution.trace);
        self.graph.update_embeddings();

        if let Some(path) = &self.checkpoint_path {
            let checkpoint = Checkpoint {
                settings: self.settings.clone(),
                history: ring.slots.clone(),
                history_index: ring.index,
                graph: self.graph.snapshot(),
            };
            if let Err(err) = checkpoint::save(path, &checkpoint) {
                log::warn!("checkpoint write to {} failed: {err}", path.display());
            }
        }

        true
    }

    pub(crate) fn history_snapshot(&self) -> Vec<FuzzExecution> {
        self.history.lock().unwrap().slots.clone()
    }

    pub(crate) fn history_index(&self) -> u32 {
        self.history.lock().unwrap().index
    }

    /// Number of occupied history slots.
    pub(crate) fn valid_count(&self) -> usize {
        self.history
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|slot| slot.is_valid())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn knowledge_with_capacity(capacity: u32) -> Knowledge {
        let mut settings = crate::settings::tests::dummy();
        settings.max_history_count = capacity;
        Knowledge::without_checkpointing(settings, GraphParams::default())
    }

    fn execution(trace: Vec<u32>, input: Vec<u8>) -> FuzzExecution {
        FuzzExecution { trace, input }
    }

    #[test]
    fn duplicate_traces_are_rejected() {
        let knowledge = knowledge_with_capacity(4);
        let first = execution(vec![1, 2, 3], vec![b'a']);
        assert!(knowledge.add_if_different(&first));
        assert!(!knowledge.add_if_different(&first));

        // graph and history untouched by the rejected call
        assert_eq!(knowledge.valid_count(), 1);
        assert_eq!(knowledge.history_index(), 1);
        assert_eq!(knowledge.graph.node_count(), 3);
    }

    #[test]
    fn dedup_compares_length_and_contents() {
        let knowledge = knowledge_with_capacity(4);
        assert!(knowledge.add_if_different(&execution(vec![1, 2, 3], vec![1])));
        assert!(!knowledge.add_if_different(&execution(vec![1, 2, 3], vec![2])));
        assert!(knowledge.add_if_different(&execution(vec![1, 2], vec![3])));
        assert!(knowledge.add_if_different(&execution(vec![1, 2, 3, 4], vec![4])));

        assert_eq!(knowledge.valid_count(), 3);
        // index advanced once per accepted execution
        assert_eq!(knowledge.history_index(), 3);
    }

    #[test]
    fn ring_overwrites_in_fifo_order_once_full() {
        let knowledge = knowledge_with_capacity(2);
        assert!(knowledge.add_if_different(&execution(vec![1], vec![1])));
        assert!(knowledge.add_if_different(&execution(vec![2], vec![2])));
        assert!(knowledge.add_if_different(&execution(vec![3], vec![3])));

        let history = knowledge.history_snapshot();
        assert_eq!(history[0].trace, vec![3]);
        assert_eq!(history[1].trace, vec![2]);
        assert_eq!(knowledge.history_index(), 1);
        // the evicted trace may be re-added now
        assert!(knowledge.add_if_different(&execution(vec![1], vec![1])));
    }

    #[test]
    #[should_panic(expected = "empty trace")]
    fn empty_trace_is_a_logic_error() {
        let knowledge = knowledge_with_capacity(4);
        knowledge.add_if_different(&execution(vec![], vec![1]));
    }

    #[test]
    fn concurrent_adds_of_same_trace_accept_exactly_one() {
        let knowledge = Arc::new(knowledge_with_capacity(8));
        let mut handles = Vec::new();
        for worker in 0..2 {
            let knowledge = knowledge.clone();
            handles.push(std::thread::spawn(move || {
                knowledge.add_if_different(&execution(vec![10, 20, 30], vec![worker]))
            }));
        }
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|&&added| added).count(), 1);
        assert_eq!(knowledge.valid_count(), 1);
    }
}
