//! Error types for everything that can fail at runtime. Broken invariants
//! (empty traces where non-empty is required, mismatched vector lengths) are
//! bugs and assert instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("short write to child stdin ({written}/{expected} bytes)")]
    ShortPipeWrite { written: usize, expected: usize },

    #[error("serialization failed: {0}")]
    Encode(#[from] speedy::Error),

    #[error("corrupt data: {0}")]
    Corrupt(String),
}
