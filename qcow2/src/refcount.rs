// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Two-level reference count table, with a write-back cached variant and a
//! direct file I/O variant selected at image open.

use std::collections::HashSet;
use std::io;

use thiserror::Error;

use super::raw_file::QcowRawFile;
use super::vec_cache::{CacheMap, Cacheable, VecCache};

#[derive(Error, Debug)]
pub enum Error {
    /// Failed to write a refcount block from the cache to disk.
    #[error("failed to write a refblock from the cache to disk: {0}")]
    EvictingRefCounts(#[source] io::Error),
    /// Address requested isn't within the range of the disk.
    #[error("address requested is not within the range of the disk")]
    InvalidIndex,
    /// Handle by reading the cluster at the given address and calling the
    /// function again with it.
    #[error("cluster with addr={0} needs to be read")]
    NeedReadCluster(u64),
    /// Handle by allocating a cluster and calling the function again with it.
    #[error("new cluster needs to be allocated for refcounts")]
    NeedNewCluster,
    /// Failed to read the file into the refcount cache.
    #[error("failed to read the file into the refcount cache: {0}")]
    ReadingRefCounts(#[source] io::Error),
    /// Failed to write a refcount entry or block.
    #[error("failed to write refcounts: {0}")]
    WritingRefCounts(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Capability set of the refcount subsystem. The allocation protocol is
/// carried in the error type: callers loop, satisfying `NeedNewCluster` and
/// `NeedReadCluster` requests until the refcount is set.
pub trait RefcountStore: Send {
    /// Returns `NeedNewCluster` if a new cluster needs to be allocated for refcounts. If an
    /// existing cluster needs to be read, `NeedReadCluster(addr)` is returned. The caller should
    /// allocate a cluster or read the required one and call this function again with the cluster.
    /// On success, an optional address of a dropped cluster is returned. The dropped cluster can
    /// be reused for other purposes.
    fn set_cluster_refcount(
        &mut self,
        raw_file: &mut QcowRawFile,
        cluster_address: u64,
        refcount: u16,
        new_cluster: Option<(u64, VecCache<u16>)>,
    ) -> Result<Option<u64>>;

    /// Gets the refcount for the cluster at the given address.
    fn get_cluster_refcount(&mut self, raw_file: &mut QcowRawFile, address: u64) -> Result<u16>;

    /// Flush the dirty refcount blocks. This must be done before flushing the
    /// table that points to the blocks.
    fn flush_blocks(&mut self, raw_file: &mut QcowRawFile) -> io::Result<()>;

    /// Flush the refcount table that keeps the addresses of the refcount blocks.
    /// Returns true if the table changed since the previous `flush_table()` call.
    fn flush_table(&mut self, raw_file: &mut QcowRawFile) -> io::Result<bool>;

    /// Largest file offset the refcount table can describe.
    fn max_valid_cluster_offset(&self) -> u64;

    /// Returns the number of refcounts per block.
    fn refcounts_per_block(&self) -> u64;
}

fn refcount_index(address: u64, cluster_size: u64, block_entries: u64) -> (u64, u64) {
    let block_index = (address / cluster_size) % block_entries;
    let table_index = (address / cluster_size) / block_entries;
    (table_index, block_index)
}

/// Write-back cached refcount table.
#[derive(Debug)]
pub struct RefcountCache {
    ref_table: VecCache<u64>,
    refcount_table_offset: u64,
    refblock_cache: CacheMap<VecCache<u16>>,
    refcount_block_entries: u64,
    cluster_size: u64,
    max_valid_cluster_offset: u64,
    // Disk addresses of refcount blocks that were evicted from the cache and
    // written back before the refcount table itself was synced. Copying such a
    // block on write again would leak the copy, so in-place updates are used
    // until the next table sync.
    evicted_before_table_sync: HashSet<u64>,
}

impl RefcountCache {
    /// Creates a `RefcountCache` from `file`, reading the refcount table from
    /// `refcount_table_offset`. `refcount_table_entries` specifies the number
    /// of refcount blocks used by this image, `refcount_block_entries` the
    /// number of refcounts in each block.
    pub fn new(
        raw_file: &mut QcowRawFile,
        refcount_table_offset: u64,
        refcount_table_entries: u64,
        refcount_block_entries: u64,
        cluster_size: u64,
        cache_size: usize,
    ) -> io::Result<RefcountCache> {
        let ref_table = VecCache::from_vec(raw_file.read_pointer_table(
            refcount_table_offset,
            refcount_table_entries,
            None,
        )?);
        let max_valid_cluster_index = (ref_table.len() as u64) * refcount_block_entries - 1;
        let max_valid_cluster_offset = max_valid_cluster_index * cluster_size;
        Ok(RefcountCache {
            ref_table,
            refcount_table_offset,
            refblock_cache: CacheMap::new(cache_size),
            refcount_block_entries,
            cluster_size,
            max_valid_cluster_offset,
            evicted_before_table_sync: HashSet::new(),
        })
    }

    fn refcount_index(&self, address: u64) -> (u64, u64) {
        refcount_index(address, self.cluster_size, self.refcount_block_entries)
    }
}

impl RefcountStore for RefcountCache {
    fn set_cluster_refcount(
        &mut self,
        raw_file: &mut QcowRawFile,
        cluster_address: u64,
        refcount: u16,
        mut new_cluster: Option<(u64, VecCache<u16>)>,
    ) -> Result<Option<u64>> {
        let (table_index, block_index) = self.refcount_index(cluster_address);

        let block_addr_disk = *self
            .ref_table
            .get(table_index as usize)
            .ok_or(Error::InvalidIndex)?;

        // Fill the cache if this block isn't yet there.
        if !self.refblock_cache.contains_key(table_index) {
            if let Some((addr, table)) = new_cluster.take() {
                self.ref_table[table_index as usize] = addr;
                let ref_table = &self.ref_table;
                let evicted_set = &mut self.evicted_before_table_sync;
                self.refblock_cache
                    .insert(table_index, table, |index, evicted| {
                        evicted_set.insert(ref_table[index as usize]);
                        raw_file
                            .write_refcount_block(ref_table[index as usize], evicted.get_values())
                    })
                    .map_err(Error::EvictingRefCounts)?;
            } else {
                if block_addr_disk == 0 {
                    return Err(Error::NeedNewCluster);
                }
                return Err(Error::NeedReadCluster(block_addr_disk));
            }
        }

        // Unwrap is safe here as the entry was filled directly above.
        let block_clean = !self.refblock_cache.get(table_index).unwrap().dirty();
        let recently_evicted = self.evicted_before_table_sync.contains(&block_addr_disk);
        let dropped_cluster = if block_clean && !recently_evicted {
            // Free the previously used block and use a new one. Writing modified counts to new
            // blocks keeps the on-disk state consistent even if it's out of date.
            if let Some((addr, _)) = new_cluster.take() {
                self.ref_table[table_index as usize] = addr;
                Some(block_addr_disk)
            } else {
                return Err(Error::NeedNewCluster);
            }
        } else {
            None
        };

        self.refblock_cache.get_mut(table_index).unwrap()[block_index as usize] = refcount;
        Ok(dropped_cluster)
    }

    fn get_cluster_refcount(&mut self, raw_file: &mut QcowRawFile, address: u64) -> Result<u16> {
        let (table_index, block_index) = self.refcount_index(address);
        let block_addr_disk = *self
            .ref_table
            .get(table_index as usize)
            .ok_or(Error::InvalidIndex)?;
        if block_addr_disk == 0 {
            return Ok(0);
        }
        if !self.refblock_cache.contains_key(table_index) {
            let table = VecCache::from_vec(
                raw_file
                    .read_refcount_block(block_addr_disk)
                    .map_err(Error::ReadingRefCounts)?,
            );
            let ref_table = &self.ref_table;
            let evicted_set = &mut self.evicted_before_table_sync;
            let read_only = raw_file.is_read_only();
            self.refblock_cache
                .insert(table_index, table, |index, evicted| {
                    if read_only {
                        return Ok(());
                    }
                    evicted_set.insert(ref_table[index as usize]);
                    raw_file.write_refcount_block(ref_table[index as usize], evicted.get_values())
                })
                .map_err(Error::EvictingRefCounts)?;
        }
        Ok(self.refblock_cache.get(table_index).unwrap()[block_index as usize])
    }

    fn flush_blocks(&mut self, raw_file: &mut QcowRawFile) -> io::Result<()> {
        for (table_index, block) in self.refblock_cache.iter_mut().filter(|(_, v)| v.dirty()) {
            let addr = self.ref_table[table_index as usize];
            if addr != 0 {
                raw_file.write_refcount_block(addr, block.get_values())?;
            } else {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            block.mark_clean();
        }
        Ok(())
    }

    fn flush_table(&mut self, raw_file: &mut QcowRawFile) -> io::Result<bool> {
        if self.ref_table.dirty() {
            raw_file.write_pointer_table(
                self.refcount_table_offset,
                self.ref_table.get_values(),
                0,
            )?;
            self.ref_table.mark_clean();
            self.evicted_before_table_sync.clear();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn max_valid_cluster_offset(&self) -> u64 {
        self.max_valid_cluster_offset
    }

    fn refcounts_per_block(&self) -> u64 {
        self.refcount_block_entries
    }
}

/// Refcount table variant that reads and writes entries in place, with no
/// caching. Copy-on-write never happens so no dropped clusters are reported.
#[derive(Debug)]
pub struct RefcountDirect {
    refcount_table_offset: u64,
    refcount_block_entries: u64,
    cluster_size: u64,
    max_valid_cluster_offset: u64,
}

impl RefcountDirect {
    pub fn new(
        refcount_table_offset: u64,
        refcount_table_entries: u64,
        refcount_block_entries: u64,
        cluster_size: u64,
    ) -> RefcountDirect {
        let max_valid_cluster_index = refcount_table_entries * refcount_block_entries - 1;
        RefcountDirect {
            refcount_table_offset,
            refcount_block_entries,
            cluster_size,
            max_valid_cluster_offset: max_valid_cluster_index * cluster_size,
        }
    }

    fn table_entry_offset(&self, table_index: u64) -> u64 {
        self.refcount_table_offset + table_index * size_of::<u64>() as u64
    }
}

impl RefcountStore for RefcountDirect {
    fn set_cluster_refcount(
        &mut self,
        raw_file: &mut QcowRawFile,
        cluster_address: u64,
        refcount: u16,
        new_cluster: Option<(u64, VecCache<u16>)>,
    ) -> Result<Option<u64>> {
        let (table_index, block_index) =
            refcount_index(cluster_address, self.cluster_size, self.refcount_block_entries);
        let mut block_addr_disk = raw_file
            .read_u64_at(self.table_entry_offset(table_index))
            .map_err(Error::ReadingRefCounts)?;
        if let Some((addr, table)) = new_cluster {
            raw_file
                .write_refcount_block(addr, table.get_values())
                .map_err(Error::WritingRefCounts)?;
            raw_file
                .write_u64_at(addr, self.table_entry_offset(table_index))
                .map_err(Error::WritingRefCounts)?;
            block_addr_disk = addr;
        } else if block_addr_disk == 0 {
            return Err(Error::NeedNewCluster);
        }
        raw_file
            .write_u16_at(
                refcount,
                block_addr_disk + block_index * size_of::<u16>() as u64,
            )
            .map_err(Error::WritingRefCounts)?;
        Ok(None)
    }

    fn get_cluster_refcount(&mut self, raw_file: &mut QcowRawFile, address: u64) -> Result<u16> {
        let (table_index, block_index) =
            refcount_index(address, self.cluster_size, self.refcount_block_entries);
        let block_addr_disk = raw_file
            .read_u64_at(self.table_entry_offset(table_index))
            .map_err(Error::ReadingRefCounts)?;
        if block_addr_disk == 0 {
            return Ok(0);
        }
        raw_file
            .read_u16_at(block_addr_disk + block_index * size_of::<u16>() as u64)
            .map_err(Error::ReadingRefCounts)
    }

    fn flush_blocks(&mut self, _raw_file: &mut QcowRawFile) -> io::Result<()> {
        Ok(())
    }

    fn flush_table(&mut self, _raw_file: &mut QcowRawFile) -> io::Result<bool> {
        Ok(false)
    }

    fn max_valid_cluster_offset(&self) -> u64 {
        self.max_valid_cluster_offset
    }

    fn refcounts_per_block(&self) -> u64 {
        self.refcount_block_entries
    }
}
