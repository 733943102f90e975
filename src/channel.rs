//! Shared-trace channel between the fuzzer and the instrumented child.
//!
//! Each fuzz thread owns one POSIX shared memory region named
//! `/topfuzz_trace_<tid>`. The tracer client running inside the child parses
//! `-shm <name>` from its own argument list, attaches, and publishes the
//! trace on process exit. Fixed layout, native endianness, 4-byte aligned:
//!
//! ```text
//! offset 0           trace_count   u32
//! offset 4           addresses     u32 x TRACE_CAP
//! offset 4 + 4*CAP   input_hash    u32   (djb2 of the bytes the target read)
//! ```
//!
//! The writer fills `addresses` and `input_hash` first and stores
//! `trace_count` last; the reader reads `trace_count` first. With exactly one
//! writer and one reader, and the reader only looking after `waitpid`
//! returns, no further synchronization is needed.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;

use crate::error::Error;

/// Capacity of the address array: 16 MiB worth of u32 offsets.
pub(crate) const TRACE_CAP: usize = (16 * 1024 * 1024) / 4;

const REGION_SIZE: usize = 4 + TRACE_CAP * 4 + 4;

pub(crate) const SHM_NAME_BASE: &str = "/topfuzz_trace";

pub(crate) struct TraceChannel {
    ptr: NonNull<libc::c_void>,
    name: String,
    owner: bool,
}

// The raw mapping is only ever touched through &self methods from the owning
// thread; the pointer itself is safe to move across threads.
unsafe impl Send for TraceChannel {}

impl TraceChannel {
    /// Create a fresh region, unlinking any leftover one of the same name,
    /// and map it read-write.
    pub(crate) fn create(name: &str) -> Result<Self, Error> {
        let _ = shm_unlink(name);
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o666),
        )?;
        nix::unistd::ftruncate(&fd, REGION_SIZE as libc::off_t)?;
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(REGION_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        Ok(Self {
            ptr,
            name: name.to_owned(),
            owner: true,
        })
    }

    /// Map an existing region read-write. This is the attach path the tracer
    /// side uses; the fuzzer itself only attaches in tests.
    #[cfg(test)]
    pub(crate) fn attach(name: &str) -> Result<Self, Error> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(REGION_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        Ok(Self {
            ptr,
            name: name.to_owned(),
            owner: false,
        })
    }

    fn base(&self) -> *mut u32 {
        self.ptr.as_ptr() as *mut u32
    }

    /// Reset `trace_count` so a stale trace can't be mistaken for a new one.
    pub(crate) fn clear(&self) {
        unsafe { self.base().write_volatile(0) };
    }

    pub(crate) fn trace_count(&self) -> u32 {
        unsafe { self.base().read_volatile() }
    }

    /// Read the published trace: `trace_count` first, clamped to capacity,
    /// then that many address words.
    pub(crate) fn read_trace(&self) -> Vec<u32> {
        let count = (self.trace_count() as usize).min(TRACE_CAP);
        if count == 0 {
            return Vec::new();
        }
        let addresses = unsafe { std::slice::from_raw_parts(self.base().add(1), count) };
        addresses.to_vec()
    }

    pub(crate) fn input_hash(&self) -> u32 {
        unsafe { self.base().add(1 + TRACE_CAP).read_volatile() }
    }

    /// Writer-side protocol, as performed by the tracer on process exit:
    /// addresses and input hash first, `trace_count` last. Tests use this to
    /// stand in for the tracer.
    #[cfg(test)]
    pub(crate) fn publish(&self, addresses: &[u32], input_hash: u32) {
        let count = addresses.len().min(TRACE_CAP);
        unsafe {
            std::ptr::copy_nonoverlapping(addresses.as_ptr(), self.base().add(1), count);
            self.base().add(1 + TRACE_CAP).write_volatile(input_hash);
            self.base().write_volatile(count as u32);
        }
    }
}

impl Drop for TraceChannel {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, REGION_SIZE);
        }
        if self.owner {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

/// The input hash the tracer stores alongside the trace.
pub(crate) fn djb2(bytes: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("{SHM_NAME_BASE}_test_{tag}_{}", std::process::id())
    }

    #[test]
    fn djb2_matches_reference_values() {
        assert_eq!(djb2(b""), 5381);
        // h = 5381 * 33 + 'a'
        assert_eq!(djb2(b"a"), 5381 * 33 + 97);
        assert_eq!(djb2(b"ab"), (5381u32 * 33 + 97).wrapping_mul(33) + 98);
    }

    #[test]
    fn publish_and_read_through_separate_mappings() {
        let name = unique_name("roundtrip");
        let reader = TraceChannel::create(&name).unwrap();
        let writer = TraceChannel::attach(&name).unwrap();

        reader.clear();
        assert_eq!(reader.trace_count(), 0);
        assert!(reader.read_trace().is_empty());

        writer.publish(&[0x1000, 0x1040, 0x1000, 0x2000], djb2(b"input"));
        assert_eq!(reader.trace_count(), 4);
        assert_eq!(reader.read_trace(), vec![0x1000, 0x1040, 0x1000, 0x2000]);
        assert_eq!(reader.input_hash(), djb2(b"input"));

        reader.clear();
        assert!(reader.read_trace().is_empty());
    }

    #[test]
    fn oversized_count_is_clamped_to_capacity() {
        let name = unique_name("clamp");
        let channel = TraceChannel::create(&name).unwrap();
        channel.publish(&[1, 2, 3], 0);
        // Fake a corrupted writer that claims more entries than fit.
        unsafe { channel.base().write_volatile(u32::MAX) };
        assert_eq!(channel.read_trace().len(), TRACE_CAP);
    }

    #[test]
    fn create_replaces_existing_region() {
        let name = unique_name("replace");
        let first = TraceChannel::create(&name).unwrap();
        first.publish(&[7, 8, 9], 0);
        drop(first);
        let second = TraceChannel::create(&name).unwrap();
        // A fresh region is observable and writable.
        second.clear();
        assert_eq!(second.trace_count(), 0);
    }
}
