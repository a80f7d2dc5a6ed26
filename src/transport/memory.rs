// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An in-process [`Transport`] backed by plain memory, standing in for
//! the remote fabric in tests, examples and simulations.

use super::{ReadRegion, Transport, WriteRegion};
use crate::{layout::ROOT_OFFSET, remote::RemotePtr};
use byteorder::{ByteOrder, LittleEndian};
use std::{
    io::{Error, ErrorKind},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Offset of the first allocatable byte; everything below is reserved
/// for the root pointer array.
const ALLOC_BASE: u64 = ROOT_OFFSET + 64 * 1024;

/// An in-process memory pool implementing [`Transport`].
///
/// Stands in for the remote fabric in tests and examples: one memory
/// node, zero-initialized, every operation individually atomic. Also
/// counts operations, which tests use to assert round-trip budgets.
pub struct MemoryPool {
    mem: Mutex<Vec<u8>>,
    bump: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    atomics: AtomicU64,
}

impl MemoryPool {
    /// Creates a pool of `capacity` zeroed bytes.
    ///
    /// # Panics
    ///
    /// Panics if the capacity cannot hold the reserved root region.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity as u64 > ALLOC_BASE, "pool too small");
        Self {
            mem: Mutex::new(vec![0u8; capacity]),
            bump: AtomicU64::new(ALLOC_BASE),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            atomics: AtomicU64::new(0),
        }
    }

    /// Number of read operations issued so far (batches count once per
    /// region).
    #[must_use]
    pub fn read_ops(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write operations issued so far.
    #[must_use]
    pub fn write_ops(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of compare-and-swap operations issued so far.
    #[must_use]
    pub fn atomic_ops(&self) -> u64 {
        self.atomics.load(Ordering::Relaxed)
    }

    fn check_range(&self, remote: RemotePtr, len: usize, mem_len: usize) -> std::io::Result<usize> {
        if remote.node_id() != 0 {
            return Err(Error::new(ErrorKind::AddrNotAvailable, "unknown memory node"));
        }
        let offset = remote.offset() as usize;
        if offset + len > mem_len {
            return Err(Error::new(ErrorKind::UnexpectedEof, "read past end of pool"));
        }
        Ok(offset)
    }
}

impl Transport for MemoryPool {
    fn read(&self, local: &mut [u8], remote: RemotePtr) -> std::io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mem = self.mem.lock().expect("pool lock poisoned");
        let offset = self.check_range(remote, local.len(), mem.len())?;
        local.copy_from_slice(&mem[offset..offset + local.len()]);
        Ok(())
    }

    fn write(&self, local: &[u8], remote: RemotePtr) -> std::io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut mem = self.mem.lock().expect("pool lock poisoned");
        let offset = self.check_range(remote, local.len(), mem.len())?;
        mem[offset..offset + local.len()].copy_from_slice(local);
        Ok(())
    }

    fn cas(&self, remote: RemotePtr, expected: u64, desired: u64) -> std::io::Result<u64> {
        self.cas_mask(remote, expected, desired, u64::MAX)
    }

    fn cas_mask(
        &self,
        remote: RemotePtr,
        expected: u64,
        desired: u64,
        mask: u64,
    ) -> std::io::Result<u64> {
        self.atomics.fetch_add(1, Ordering::Relaxed);
        let mut mem = self.mem.lock().expect("pool lock poisoned");
        let offset = self.check_range(remote, 8, mem.len())?;
        let old = LittleEndian::read_u64(&mem[offset..offset + 8]);
        if old & mask == expected & mask {
            LittleEndian::write_u64(&mut mem[offset..offset + 8], desired);
        }
        Ok(old)
    }

    fn read_batch(&self, regions: &mut [ReadRegion<'_>]) -> std::io::Result<()> {
        let mem = self.mem.lock().expect("pool lock poisoned");
        for region in regions {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let offset = self.check_range(region.remote, region.local.len(), mem.len())?;
            region
                .local
                .copy_from_slice(&mem[offset..offset + region.local.len()]);
        }
        Ok(())
    }

    fn write_batch(&self, regions: &[WriteRegion<'_>]) -> std::io::Result<()> {
        let mut mem = self.mem.lock().expect("pool lock poisoned");
        for region in regions {
            self.writes.fetch_add(1, Ordering::Relaxed);
            let offset = self.check_range(region.remote, region.local.len(), mem.len())?;
            mem[offset..offset + region.local.len()].copy_from_slice(region.local);
        }
        Ok(())
    }

    fn alloc(&self, len: usize, align_bits: u32) -> std::io::Result<RemotePtr> {
        let align = 1u64 << align_bits;
        let mem_len = self.mem.lock().expect("pool lock poisoned").len() as u64;

        let mut current = self.bump.load(Ordering::Relaxed);
        loop {
            let aligned = (current + align - 1) & !(align - 1);
            let next = aligned + len as u64;
            if next > mem_len {
                return Err(Error::new(ErrorKind::OutOfMemory, "pool exhausted"));
            }
            match self.bump.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(RemotePtr::new(0, aligned)),
                Err(observed) => current = observed,
            }
        }
    }
}
