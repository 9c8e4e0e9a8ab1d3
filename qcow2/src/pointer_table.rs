// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! L1/L2 cluster pointer tables, with a write-back cached variant and a
//! direct file I/O variant selected at image open.

use std::collections::HashSet;
use std::io;

use thiserror::Error;

use super::header::QcowHeader;
use super::raw_file::QcowRawFile;
use super::vec_cache::{CacheMap, Cacheable, VecCache};
use super::{CLUSTER_USED_FLAG, COMPRESSED_FLAG, L1_TABLE_OFFSET_MASK, L2_TABLE_OFFSET_MASK};

/// A refcount adjustment the caller must apply on behalf of the pointer table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefcountToSet {
    pub address: u64,
    pub value: u16,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to allocate a cluster for an L2 table: {0}")]
    AllocatingCluster(#[source] io::Error),
    #[error("compressed clusters are not supported")]
    CompressedClustersNotSupported,
    #[error("failed to write an evicted L2 table: {0}")]
    EvictingCache(#[source] io::Error),
    #[error("virtual address is outside the L1 table")]
    InvalidIndex,
    /// The L2 table moved to a new cluster; the caller must apply the carried
    /// refcount updates and may reuse the vacated cluster after the next sync.
    #[error("L2 table copy-on-write requires refcount updates")]
    NeedFreeClusters {
        cluster_to_remove: u64,
        refcounts: Vec<RefcountToSet>,
    },
    /// No L2 cluster is allocated for this address; the caller must allocate
    /// one and hand it over through `add_new_pointer_cluster`.
    #[error("a pointer cluster must be allocated for this address")]
    NeedPointerCluster,
    #[error("failed to read an L2 table: {0}")]
    ReadingPointers(#[source] io::Error),
    #[error("failed to write a pointer table: {0}")]
    WritingPointers(#[source] io::Error),
    #[error("dirty L2 table recorded at a zero disk address")]
    ZeroL2Address,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Capability set of the two-level cluster pointer table.
pub trait PointerTable: Send {
    /// Resolves `virtual_address` to the data cluster address recorded in the
    /// L2 table, zero meaning "not allocated". `NeedPointerCluster` is raised
    /// when the whole L2 cluster is missing.
    fn read_cluster_address(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
    ) -> Result<u64>;

    /// Points the L1 entry for `virtual_address` at `new_cluster_address`, a
    /// cluster the caller already allocated, and installs an empty L2 table
    /// for it.
    fn add_new_pointer_cluster(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
        new_cluster_address: u64,
    ) -> Result<()>;

    /// Records `new_cluster_address` as the data cluster for
    /// `virtual_address`. A clean cached L2 table is first relocated to a
    /// fresh cluster obtained from `alloc` so the on-disk L1 keeps pointing at
    /// consistent data until the next sync; the relocation is reported through
    /// `NeedFreeClusters`.
    fn update_cluster_address(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
        new_cluster_address: u64,
        alloc: &mut dyn FnMut(&mut QcowRawFile) -> io::Result<u64>,
    ) -> Result<()>;

    /// Writes all dirty L2 tables back to their clusters.
    fn sync(&mut self, raw_file: &mut QcowRawFile) -> Result<()>;

    /// Writes the L1 table if dirty, reporting whether a write occurred.
    fn sync_l1(&mut self, raw_file: &mut QcowRawFile) -> Result<bool>;
}

// Reads an L2 cluster from the disk, returning an error if the file can't be
// read or if any entry is compressed.
fn read_l2_cluster(raw_file: &mut QcowRawFile, cluster_addr: u64) -> Result<Vec<u64>> {
    let file_values = raw_file
        .read_pointer_cluster(cluster_addr, None)
        .map_err(Error::ReadingPointers)?;
    if file_values.iter().any(|entry| entry & COMPRESSED_FLAG != 0) {
        return Err(Error::CompressedClustersNotSupported);
    }
    Ok(file_values
        .iter()
        .map(|entry| *entry & L2_TABLE_OFFSET_MASK)
        .collect())
}

/// Write-back cached pointer table: the whole L1 table in memory plus a
/// bounded LRU cache of L2 clusters keyed by their disk address.
#[derive(Debug)]
pub struct PointerTableCache {
    l1_table: VecCache<u64>,
    l1_table_offset: u64,
    cluster_size: u64,
    l2_entries: u64,
    l2_cache: CacheMap<VecCache<u64>>,
    // Disk addresses of L2 clusters evicted and written back while the L1
    // table itself was still unsynced. Relocating such a cluster again before
    // the L1 sync would leak the earlier copy, so in-place updates are used
    // until the next L1 sync.
    evicted_before_l1_sync: HashSet<u64>,
}

impl PointerTableCache {
    pub fn new(
        header: &QcowHeader,
        raw_file: &mut QcowRawFile,
        cache_size: usize,
    ) -> io::Result<PointerTableCache> {
        let l1_table = VecCache::from_vec(raw_file.read_pointer_table(
            header.l1_table_offset,
            u64::from(header.num_l2_clusters()),
            Some(L1_TABLE_OFFSET_MASK),
        )?);
        Ok(PointerTableCache {
            l1_table,
            l1_table_offset: header.l1_table_offset,
            cluster_size: header.cluster_size(),
            l2_entries: u64::from(header.l2_size()),
            l2_cache: CacheMap::new(cache_size),
            evicted_before_l1_sync: HashSet::new(),
        })
    }

    fn l1_index(&self, virtual_address: u64) -> usize {
        ((virtual_address / self.cluster_size) / self.l2_entries) as usize
    }

    fn l2_index(&self, virtual_address: u64) -> usize {
        ((virtual_address / self.cluster_size) % self.l2_entries) as usize
    }

    // Ensures the L2 cluster at `l2_addr` is cached, reading it from disk if
    // necessary.
    fn cache_l2_cluster(&mut self, raw_file: &mut QcowRawFile, l2_addr: u64) -> Result<()> {
        if self.l2_cache.contains_key(l2_addr) {
            return Ok(());
        }
        let table = VecCache::from_vec(read_l2_cluster(raw_file, l2_addr)?);
        let evicted_set = &mut self.evicted_before_l1_sync;
        let read_only = raw_file.is_read_only();
        self.l2_cache
            .insert(l2_addr, table, |addr, evicted| {
                if read_only {
                    return Ok(());
                }
                evicted_set.insert(addr);
                raw_file.write_pointer_table(addr, evicted.get_values(), CLUSTER_USED_FLAG)
            })
            .map_err(Error::EvictingCache)
    }
}

impl PointerTable for PointerTableCache {
    fn read_cluster_address(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
    ) -> Result<u64> {
        let l1_index = self.l1_index(virtual_address);
        let l2_addr = *self.l1_table.get(l1_index).ok_or(Error::InvalidIndex)?;
        if l2_addr == 0 {
            return Err(Error::NeedPointerCluster);
        }
        self.cache_l2_cluster(raw_file, l2_addr)?;
        let l2_index = self.l2_index(virtual_address);
        // The entry must exist as it was just inserted if it wasn't already.
        Ok(self.l2_cache.get(l2_addr).unwrap()[l2_index])
    }

    fn add_new_pointer_cluster(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
        new_cluster_address: u64,
    ) -> Result<()> {
        let l1_index = self.l1_index(virtual_address);
        self.l1_table[l1_index] = new_cluster_address;
        let table = VecCache::new(self.l2_entries as usize);
        let evicted_set = &mut self.evicted_before_l1_sync;
        self.l2_cache
            .insert(new_cluster_address, table, |addr, evicted| {
                evicted_set.insert(addr);
                raw_file.write_pointer_table(addr, evicted.get_values(), CLUSTER_USED_FLAG)
            })
            .map_err(Error::EvictingCache)
    }

    fn update_cluster_address(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
        new_cluster_address: u64,
        alloc: &mut dyn FnMut(&mut QcowRawFile) -> io::Result<u64>,
    ) -> Result<()> {
        let l1_index = self.l1_index(virtual_address);
        let l2_index = self.l2_index(virtual_address);
        let l2_addr = *self.l1_table.get(l1_index).ok_or(Error::InvalidIndex)?;
        self.cache_l2_cluster(raw_file, l2_addr)?;

        // The entry must exist as it was just inserted if it wasn't already.
        let clean = !self.l2_cache.get(l2_addr).unwrap().dirty();
        if clean && !self.evicted_before_l1_sync.contains(&l2_addr) {
            // The table is also on disk and the on-disk L1 points at it.
            // Relocate the update to a fresh cluster so the L1 table can be
            // committed after all L2 tables and never points at a torn write.
            let new_l2_addr = alloc(raw_file).map_err(Error::AllocatingCluster)?;
            self.l1_table[l1_index] = new_l2_addr;
            let mut table = self.l2_cache.remove(l2_addr).unwrap();
            table[l2_index] = new_cluster_address;
            self.l2_cache.set(new_l2_addr, table);
            return Err(Error::NeedFreeClusters {
                cluster_to_remove: l2_addr,
                refcounts: vec![
                    RefcountToSet {
                        address: l2_addr,
                        value: 0,
                    },
                    RefcountToSet {
                        address: new_l2_addr,
                        value: 1,
                    },
                ],
            });
        }

        self.l2_cache.get_mut(l2_addr).unwrap()[l2_index] = new_cluster_address;
        Ok(())
    }

    fn sync(&mut self, raw_file: &mut QcowRawFile) -> Result<()> {
        for (addr, table) in self.l2_cache.iter_mut().filter(|(_, v)| v.dirty()) {
            if addr == 0 {
                return Err(Error::ZeroL2Address);
            }
            raw_file
                .write_pointer_table(addr, table.get_values(), CLUSTER_USED_FLAG)
                .map_err(Error::WritingPointers)?;
            table.mark_clean();
        }
        Ok(())
    }

    fn sync_l1(&mut self, raw_file: &mut QcowRawFile) -> Result<bool> {
        if self.l1_table.dirty() {
            raw_file
                .write_pointer_table(self.l1_table_offset, self.l1_table.get_values(), 0)
                .map_err(Error::WritingPointers)?;
            self.l1_table.mark_clean();
            self.evicted_before_l1_sync.clear();
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Pointer table variant doing direct file I/O per operation. Updates happen
/// in place, so `NeedFreeClusters` is never raised.
#[derive(Debug)]
pub struct PointerTableDirect {
    l1_table_offset: u64,
    cluster_size: u64,
    l2_entries: u64,
}

impl PointerTableDirect {
    pub fn new(header: &QcowHeader) -> PointerTableDirect {
        PointerTableDirect {
            l1_table_offset: header.l1_table_offset,
            cluster_size: header.cluster_size(),
            l2_entries: u64::from(header.l2_size()),
        }
    }

    fn l1_entry_offset(&self, virtual_address: u64) -> u64 {
        let l1_index = (virtual_address / self.cluster_size) / self.l2_entries;
        self.l1_table_offset + l1_index * size_of::<u64>() as u64
    }

    fn l2_entry_offset(&self, l2_addr: u64, virtual_address: u64) -> u64 {
        let l2_index = (virtual_address / self.cluster_size) % self.l2_entries;
        l2_addr + l2_index * size_of::<u64>() as u64
    }

    fn l2_cluster_address(
        &self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
    ) -> Result<u64> {
        let entry = raw_file
            .read_u64_at(self.l1_entry_offset(virtual_address))
            .map_err(Error::ReadingPointers)?;
        Ok(entry & L1_TABLE_OFFSET_MASK)
    }
}

impl PointerTable for PointerTableDirect {
    fn read_cluster_address(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
    ) -> Result<u64> {
        let l2_addr = self.l2_cluster_address(raw_file, virtual_address)?;
        if l2_addr == 0 {
            return Err(Error::NeedPointerCluster);
        }
        let entry = raw_file
            .read_u64_at(self.l2_entry_offset(l2_addr, virtual_address))
            .map_err(Error::ReadingPointers)?;
        if entry & COMPRESSED_FLAG != 0 {
            return Err(Error::CompressedClustersNotSupported);
        }
        Ok(entry & L2_TABLE_OFFSET_MASK)
    }

    fn add_new_pointer_cluster(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
        new_cluster_address: u64,
    ) -> Result<()> {
        raw_file
            .write_u64_at(new_cluster_address, self.l1_entry_offset(virtual_address))
            .map_err(Error::WritingPointers)
    }

    fn update_cluster_address(
        &mut self,
        raw_file: &mut QcowRawFile,
        virtual_address: u64,
        new_cluster_address: u64,
        _alloc: &mut dyn FnMut(&mut QcowRawFile) -> io::Result<u64>,
    ) -> Result<()> {
        let l2_addr = self.l2_cluster_address(raw_file, virtual_address)?;
        raw_file
            .write_u64_at(
                new_cluster_address,
                self.l2_entry_offset(l2_addr, virtual_address),
            )
            .map_err(Error::WritingPointers)
    }

    fn sync(&mut self, _raw_file: &mut QcowRawFile) -> Result<()> {
        Ok(())
    }

    fn sync_l1(&mut self, _raw_file: &mut QcowRawFile) -> Result<bool> {
        Ok(false)
    }
}
