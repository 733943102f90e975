//! Binary checkpoint format for the knowledge base.
//!
//! Layout: 4-byte magic, format version byte, endianness byte, then the
//! speedy-encoded body in native byte order. Readers fail deterministically
//! on a foreign magic, an unknown version, a mismatched endianness or a
//! mismatched embedding dimension; the coordinator treats all of those as
//! "start fresh".

use std::path::Path;

use speedy::{Endianness, Readable, Writable};

use crate::error::Error;
use crate::graph::GraphSnapshot;
use crate::knowledge::FuzzExecution;
use crate::settings::Settings;

const MAGIC: [u8; 4] = *b"TPFZ";
const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub(crate) struct Checkpoint {
    pub settings: Settings,
    pub history: Vec<FuzzExecution>,
    pub history_index: u32,
    pub graph: GraphSnapshot,
}

fn host_endianness_byte() -> u8 {
    u8::from(cfg!(target_endian = "little"))
}

pub(crate) fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), Error> {
    let mut bytes = Vec::with_capacity(4096);
    bytes.extend_from_slice(&MAGIC);
    bytes.push(VERSION);
    bytes.push(host_endianness_byte());
    bytes.extend_from_slice(&checkpoint.write_to_vec_with_ctx(Endianness::NATIVE)?);

    // Write-then-rename so a crash mid-write can't clobber the last good
    // checkpoint.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn load(path: &Path) -> Result<Checkpoint, Error> {
    let bytes = std::fs::read(path)?;
    let body = parse_header(&bytes)?;
    let checkpoint = Checkpoint::read_from_buffer_with_ctx(Endianness::NATIVE, body)?;
    validate(&checkpoint)?;
    Ok(checkpoint)
}

fn parse_header(bytes: &[u8]) -> Result<&[u8], Error> {
    if bytes.len() < 6 {
        return Err(Error::Corrupt("checkpoint file is truncated".to_owned()));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::Corrupt("not a knowledge checkpoint".to_owned()));
    }
    let version = bytes[4];
    if version != VERSION {
        return Err(Error::Corrupt(format!(
            "unsupported checkpoint version {version}"
        )));
    }
    let endianness = bytes[5];
    if endianness != host_endianness_byte() {
        return Err(Error::Corrupt(
            "checkpoint was written on a host with different endianness".to_owned(),
        ));
    }
    Ok(&bytes[6..])
}

fn validate(checkpoint: &Checkpoint) -> Result<(), Error> {
    let dim = checkpoint.graph.params.dim as usize;
    if checkpoint.graph.zero_embedding.len() != dim {
        return Err(Error::Corrupt(format!(
            "zero embedding has {} components, expected {dim}",
            checkpoint.graph.zero_embedding.len()
        )));
    }
    for (node, embedding) in &checkpoint.graph.embeddings {
        if embedding.len() != dim {
            return Err(Error::Corrupt(format!(
                "embedding for node {node:#x} has {} components, expected {dim}",
                embedding.len()
            )));
        }
    }
    for slot in &checkpoint.history {
        let empty_slot = slot.trace.is_empty() && slot.input.is_empty();
        if !empty_slot && !slot.is_valid() {
            return Err(Error::Corrupt(
                "history slot with trace but no input (or vice versa)".to_owned(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExploredGraph, GraphParams};
    use crate::knowledge::Knowledge;

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "topfuzz-checkpoint-{tag}-{}.knowledge",
            std::process::id()
        ))
    }

    fn sample_checkpoint() -> Checkpoint {
        let graph = ExploredGraph::new(GraphParams::default());
        graph.update_from_trace(&[1, 2, 3, 1]);
        graph.update_embeddings();
        Checkpoint {
            settings: crate::settings::tests::dummy(),
            history: vec![
                FuzzExecution {
                    trace: vec![1, 2, 3, 1],
                    input: vec![9, 9],
                },
                FuzzExecution::default(),
            ],
            history_index: 1,
            graph: graph.snapshot(),
        }
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let path = scratch_path("roundtrip");
        let checkpoint = sample_checkpoint();
        save(&path, &checkpoint).unwrap();
        let restored = load(&path).unwrap();
        assert_eq!(restored, checkpoint);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn restored_knowledge_deduplicates_like_the_original() {
        let path = scratch_path("dedup");
        let checkpoint = sample_checkpoint();
        save(&path, &checkpoint).unwrap();

        let restored = load(&path).unwrap();
        let mut settings = restored.settings.clone();
        // keep the restored knowledge's own checkpoint writes in a scratch dir
        let work_dir = std::env::temp_dir().join(format!("topfuzz-kn-{}", std::process::id()));
        std::fs::create_dir_all(&work_dir).unwrap();
        settings.work_dir = work_dir.to_str().unwrap().to_owned();
        let knowledge = Knowledge::from_checkpoint(settings, restored).unwrap();
        // the persisted trace is still known
        assert!(!knowledge.add_if_different(&FuzzExecution {
            trace: vec![1, 2, 3, 1],
            input: vec![1],
        }));
        // and new traces are still accepted
        assert!(knowledge.add_if_different(&FuzzExecution {
            trace: vec![7, 8],
            input: vec![1],
        }));
        std::fs::remove_file(&path).unwrap();
        std::fs::remove_dir_all(&work_dir).unwrap();
    }

    #[test]
    fn bad_magic_version_and_endianness_are_rejected() {
        let path = scratch_path("header");
        let checkpoint = sample_checkpoint();
        save(&path, &checkpoint).unwrap();
        let good = std::fs::read(&path).unwrap();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        std::fs::write(&path, &bad_magic).unwrap();
        assert!(matches!(load(&path), Err(Error::Corrupt(_))));

        let mut bad_version = good.clone();
        bad_version[4] = 0xff;
        std::fs::write(&path, &bad_version).unwrap();
        assert!(matches!(load(&path), Err(Error::Corrupt(_))));

        let mut bad_endianness = good.clone();
        bad_endianness[5] ^= 1;
        std::fs::write(&path, &bad_endianness).unwrap();
        assert!(matches!(load(&path), Err(Error::Corrupt(_))));

        std::fs::write(&path, b"TP").unwrap();
        assert!(matches!(load(&path), Err(Error::Corrupt(_))));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let path = scratch_path("dim");
        let mut checkpoint = sample_checkpoint();
        checkpoint.graph.embeddings[0].1.push(1.0);
        save(&path, &checkpoint).unwrap();
        assert!(matches!(load(&path), Err(Error::Corrupt(_))));
        std::fs::remove_file(&path).unwrap();
    }
}
