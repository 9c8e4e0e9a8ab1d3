// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Reference count reconstruction for images opened with broken or lazy
//! refcounts.

use super::header::{QcowHeader, CLUSTER_ADDRESS_SIZE, L1_TABLE_MAX_SIZE};
use super::raw_file::QcowRawFile;
use super::{
    div_round_up_u64, Error, Result, L1_TABLE_OFFSET_MASK, L2_TABLE_OFFSET_MASK,
};

// The rebuild array is held in memory, one 16-bit count per cluster; cap it at
// the same 32 MiB of 8-byte addresses the in-RAM tables are held to.
const MAX_IN_MEMORY_REFCOUNTS: u64 = (L1_TABLE_MAX_SIZE / CLUSTER_ADDRESS_SIZE) as u64;

fn add_ref(refcounts: &mut [u16], cluster_size: u64, cluster_address: u64) -> Result<()> {
    let idx = (cluster_address / cluster_size) as usize;
    if idx >= refcounts.len() {
        return Err(Error::InvalidClusterIndex);
    }
    refcounts[idx] += 1;
    Ok(())
}

// Add a reference to the first cluster (header plus extensions).
fn set_header_refcount(refcounts: &mut [u16], cluster_size: u64) -> Result<()> {
    add_ref(refcounts, cluster_size, 0)
}

// Add references to the L1 table clusters.
fn set_l1_refcounts(refcounts: &mut [u16], header: &QcowHeader, cluster_size: u64) -> Result<()> {
    for i in 0..u64::from(header.l1_clusters()) {
        add_ref(
            refcounts,
            cluster_size,
            header.l1_table_offset + i * cluster_size,
        )?;
    }
    Ok(())
}

// Traverse the L1 and L2 tables to find all reachable clusters.
fn set_data_refcounts(
    refcounts: &mut [u16],
    header: &QcowHeader,
    cluster_size: u64,
    raw_file: &mut QcowRawFile,
) -> Result<()> {
    let l1_table = raw_file
        .read_pointer_table(
            header.l1_table_offset,
            u64::from(header.l1_size),
            Some(L1_TABLE_OFFSET_MASK),
        )
        .map_err(Error::ReadingPointers)?;
    for l1_index in 0..header.l1_size as usize {
        let l2_addr_disk = *l1_table.get(l1_index).ok_or(Error::InvalidClusterIndex)?;
        if l2_addr_disk != 0 {
            // The L2 cluster itself.
            add_ref(refcounts, cluster_size, l2_addr_disk)?;

            let l2_table = raw_file
                .read_pointer_table(
                    l2_addr_disk,
                    cluster_size / size_of::<u64>() as u64,
                    Some(L2_TABLE_OFFSET_MASK),
                )
                .map_err(Error::ReadingPointers)?;
            for data_cluster_addr in l2_table {
                if data_cluster_addr != 0 {
                    add_ref(refcounts, cluster_size, data_cluster_addr)?;
                }
            }
        }
    }
    Ok(())
}

// Add references to the top-level refcount table clusters.
fn set_refcount_table_refcounts(
    refcounts: &mut [u16],
    header: &QcowHeader,
    cluster_size: u64,
) -> Result<()> {
    for i in 0..u64::from(header.refcount_table_clusters) {
        add_ref(
            refcounts,
            cluster_size,
            header.refcount_table_offset + i * cluster_size,
        )?;
    }
    Ok(())
}

// Allocate clusters for refblocks by first-fit over zero entries. This needs
// to be done last so that all other clusters already hold their counts.
fn alloc_refblocks(
    refcounts: &mut [u16],
    cluster_size: u64,
    refblock_clusters: u64,
    pointers_per_cluster: u64,
) -> Result<Vec<u64>> {
    let refcount_table_entries = div_round_up_u64(refblock_clusters, pointers_per_cluster);
    let mut ref_table = vec![0u64; refcount_table_entries as usize];
    let mut first_free_cluster: u64 = 0;
    for refblock_addr in &mut ref_table {
        loop {
            if first_free_cluster >= refcounts.len() as u64 {
                return Err(Error::NotEnoughSpaceForRefcounts);
            }
            if refcounts[first_free_cluster as usize] == 0 {
                break;
            }
            first_free_cluster += 1;
        }

        *refblock_addr = first_free_cluster * cluster_size;
        add_ref(refcounts, cluster_size, *refblock_addr)?;
        first_free_cluster += 1;
    }
    Ok(ref_table)
}

// Write the new refcount blocks and the table pointing at them, bracketing
// the write-out with the lazy-refcounts bit so a crash mid-rebuild leaves the
// image marked for another rebuild.
fn write_refblocks(
    refcounts: &[u16],
    header: &QcowHeader,
    ref_table: &[u64],
    raw_file: &mut QcowRawFile,
    refcount_block_entries: u64,
) -> Result<()> {
    let mut header = header.clone();
    header.set_lazy_refcounts(raw_file.file_mut(), true)?;

    for (i, refblock_addr) in ref_table.iter().enumerate() {
        let refblock_start = i * refcount_block_entries as usize;
        let refblock_end = refcounts
            .len()
            .min(refblock_start + refcount_block_entries as usize);
        let refblock = &refcounts[refblock_start..refblock_end];
        raw_file
            .write_refcount_block(*refblock_addr, refblock)
            .map_err(Error::RebuildingRefCounts)?;

        // Pad the last partial cluster out to a full refblock.
        if refblock.len() < refcount_block_entries as usize {
            let padding = vec![0u16; refcount_block_entries as usize - refblock.len()];
            raw_file
                .write_refcount_block(
                    *refblock_addr + refblock.len() as u64 * size_of::<u16>() as u64,
                    &padding,
                )
                .map_err(Error::RebuildingRefCounts)?;
        }
    }

    raw_file
        .write_pointer_table(header.refcount_table_offset, ref_table, 0)
        .map_err(Error::RebuildingRefCounts)?;

    header.set_lazy_refcounts(raw_file.file_mut(), false)?;
    Ok(())
}

/// Rebuild the reference count tables from the header, the pointer tables,
/// and the data clusters they reach.
pub(crate) fn rebuild_refcounts(raw_file: &mut QcowRawFile, header: &QcowHeader) -> Result<()> {
    let cluster_size = raw_file.cluster_size();
    let refcount_bits = 1u64 << header.refcount_order;
    let refcount_bytes = div_round_up_u64(refcount_bits, 8);
    let refcount_block_entries = cluster_size / refcount_bytes;
    let pointers_per_cluster = cluster_size / size_of::<u64>() as u64;

    // One count per data cluster, L2 cluster, L1 cluster, and the header
    // cluster, plus the refblocks and table clusters needed to describe them
    // and then to describe themselves.
    let max_clusters = u64::from(header.l1_clusters())
        + u64::from(header.num_l2_clusters())
        + u64::from(header.num_clusters())
        + 1;
    let refblock_clusters = div_round_up_u64(max_clusters, refcount_block_entries);
    let reftable_clusters = div_round_up_u64(refblock_clusters, pointers_per_cluster);
    let refblocks_for_refs = div_round_up_u64(
        refblock_clusters + reftable_clusters,
        refcount_block_entries,
    );
    let reftable_clusters_for_refs = div_round_up_u64(refblocks_for_refs, refcount_block_entries);
    let max_valid_cluster_index = max_clusters
        + refblock_clusters
        + reftable_clusters
        + refblocks_for_refs
        + reftable_clusters_for_refs;

    if max_valid_cluster_index > MAX_IN_MEMORY_REFCOUNTS {
        return Err(Error::InvalidRefcountTableSize(max_valid_cluster_index));
    }

    let max_valid_cluster_offset = max_valid_cluster_index * cluster_size;
    let file_size = raw_file.len().map_err(Error::GettingFileSize)?;
    if max_valid_cluster_offset < file_size.saturating_sub(cluster_size) {
        return Err(Error::InvalidRefcountTableSize(max_valid_cluster_offset));
    }

    let mut refcounts = vec![0u16; max_valid_cluster_index as usize];

    set_header_refcount(&mut refcounts, cluster_size)?;
    set_l1_refcounts(&mut refcounts, header, cluster_size)?;
    set_data_refcounts(&mut refcounts, header, cluster_size, raw_file)?;
    set_refcount_table_refcounts(&mut refcounts, header, cluster_size)?;

    let ref_table = alloc_refblocks(
        &mut refcounts,
        cluster_size,
        refblock_clusters,
        pointers_per_cluster,
    )?;
    write_refblocks(
        &refcounts,
        header,
        &ref_table,
        raw_file,
        refcount_block_entries,
    )
}
