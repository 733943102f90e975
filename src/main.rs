//! topfuzz — a directional, gradient-guided coverage fuzzer.
//!
//! The target runs under a dynamic-binary-instrumentation tracer that hands
//! basic-block traces back over shared memory. Traces feed an online graph
//! embedding (Node2Vec + Skip-gram with negative sampling); new inputs are
//! generated by gradient descent in that embedding space, away from
//! executions we've already seen.

mod channel;
mod checkpoint;
mod cli;
mod crash;
mod error;
mod fuzzer;
mod graph;
mod knowledge;
mod loss;
mod seed;
mod settings;

pub(crate) use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};


fn main() {
    cli::main();
}
