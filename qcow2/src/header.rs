// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QCOW2 v3 header parsing, validation, and creation.

use std::io::{Read, Seek, SeekFrom, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{div_round_up_u32, div_round_up_u64, Error, Result};

// QCOW magic constant that starts the header.
pub(crate) const QCOW_MAGIC: u32 = 0x5146_49fb;
// Default to a cluster size of 2^DEFAULT_CLUSTER_BITS.
pub(crate) const DEFAULT_CLUSTER_BITS: u32 = 16;
// Limit clusters to reasonable sizes. The lower bound is dictated by the
// format, the upper one matches qemu's refusal of absurd cluster sizes.
pub(crate) const MIN_CLUSTER_BITS: u32 = 9;
pub(crate) const MAX_CLUSTER_BITS: u32 = 30;
// The L1 table and the refcount table are kept in RAM, limited to 32 MiB each.
pub(crate) const L1_TABLE_MAX_SIZE: u32 = 32 * 1024 * 1024;
// Table entries are 8-byte file offsets.
pub(crate) const CLUSTER_ADDRESS_SIZE: u32 = 8;
// 16-bit refcounts are the only supported width.
pub(crate) const DEFAULT_REFCOUNT_ORDER: u32 = 4;

pub(crate) const V3_BARE_HEADER_SIZE: u32 = 104;
// The format supports a "header extension area"; an empty one is written out.
pub(crate) const EMPTY_HEADER_EXTENSION_SIZE: u32 = 8;
// Defined by the specification.
const MAX_BACKING_FILE_NAME_SIZE: u32 = 1023;

const INCOMPATIBLE_FEATURES_OFFSET: u64 = 72;
const COMPATIBLE_FEATURES_OFFSET: u64 = 80;

pub(crate) const COMPATIBLE_FEATURES_LAZY_REFCOUNTS: u64 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
        const DATA_FILE = 1 << 2;
        const COMPRESSION = 1 << 3;
        const EXTENDED_L2 = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AutoclearFeatures: u64 {
        const BITMAPS = 1 << 0;
        const RAW_EXTERNAL_DATA = 1 << 1;
    }
}

/// Contains the information from the header of a qcow file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QcowHeader {
    pub magic: u32,
    pub version: u32,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_size: u32,
    pub compression_type: u8,

    pub backing_file_path: Option<String>,

    // Derived geometry, recomputed on parse and create.
    cluster_size: u64,
    num_clusters: u32,
    l2_size: u32,
    num_l2_clusters: u32,
    l1_clusters: u32,
    refcount_clusters_needed: u32,
}

impl QcowHeader {
    /// Creates a QcowHeader from a reference to a file.
    pub fn from_file<F: Read + Seek>(f: &mut F) -> Result<QcowHeader> {
        f.seek(SeekFrom::Start(0)).map_err(Error::ReadingHeader)?;
        let magic = f.read_u32::<BigEndian>().map_err(Error::ReadingHeader)?;
        if magic != QCOW_MAGIC {
            return Err(Error::InvalidMagic);
        }

        // Reads the next u32 from the file.
        fn read_u32_from_file<F: Read>(f: &mut F) -> Result<u32> {
            f.read_u32::<BigEndian>().map_err(Error::ReadingHeader)
        }

        // Reads the next u64 from the file.
        fn read_u64_from_file<F: Read>(f: &mut F) -> Result<u64> {
            f.read_u64::<BigEndian>().map_err(Error::ReadingHeader)
        }

        let mut header = QcowHeader {
            magic,
            version: read_u32_from_file(f)?,
            backing_file_offset: read_u64_from_file(f)?,
            backing_file_size: read_u32_from_file(f)?,
            cluster_bits: read_u32_from_file(f)?,
            size: read_u64_from_file(f)?,
            crypt_method: read_u32_from_file(f)?,
            l1_size: read_u32_from_file(f)?,
            l1_table_offset: read_u64_from_file(f)?,
            refcount_table_offset: read_u64_from_file(f)?,
            refcount_table_clusters: read_u32_from_file(f)?,
            nb_snapshots: read_u32_from_file(f)?,
            snapshots_offset: read_u64_from_file(f)?,
            incompatible_features: read_u64_from_file(f)?,
            compatible_features: read_u64_from_file(f)?,
            autoclear_features: read_u64_from_file(f)?,
            refcount_order: read_u32_from_file(f)?,
            header_size: read_u32_from_file(f)?,
            compression_type: 0,
            backing_file_path: None,
            cluster_size: 0,
            num_clusters: 0,
            l2_size: 0,
            num_l2_clusters: 0,
            l1_clusters: 0,
            refcount_clusters_needed: 0,
        };

        if header.version != 3 {
            return Err(Error::UnsupportedVersion(header.version));
        }
        if header.header_size > V3_BARE_HEADER_SIZE {
            header.compression_type = f.read_u8().map_err(Error::ReadingHeader)?;
        }

        if header.backing_file_offset != 0 && header.backing_file_size != 0 {
            if header.backing_file_size > MAX_BACKING_FILE_NAME_SIZE {
                return Err(Error::BackingFileTooLong(header.backing_file_size as usize));
            }
            f.seek(SeekFrom::Start(header.backing_file_offset))
                .map_err(Error::ReadingHeader)?;
            let mut name_bytes = vec![0u8; header.backing_file_size as usize];
            f.read_exact(&mut name_bytes).map_err(Error::ReadingHeader)?;
            let path = String::from_utf8(name_bytes)
                .map_err(|e| Error::InvalidBackingFileName(e.utf8_error()))?;
            header.backing_file_path = Some(path);
        }

        header.precompute_table_sizes();
        header.validate()?;
        Ok(header)
    }

    /// Create a header for an image of `size` bytes, optionally referencing a
    /// backing file path stored after the empty header extension area.
    pub fn create_for_size_and_path(size: u64, backing_file: Option<&str>) -> Result<QcowHeader> {
        let cluster_bits = DEFAULT_CLUSTER_BITS;
        let cluster_size = 1u64 << cluster_bits;
        // L2 blocks are always one cluster long. They contain cluster_size/8 addresses.
        let l2_size = (cluster_size / u64::from(CLUSTER_ADDRESS_SIZE)) as u32;
        let num_clusters = div_round_up_u64(size, cluster_size) as u32;
        let num_l2_clusters = div_round_up_u32(num_clusters, l2_size);
        let l1_clusters = div_round_up_u32(num_l2_clusters, cluster_size as u32);

        let max_backing_len = cluster_size as u32 - V3_BARE_HEADER_SIZE - EMPTY_HEADER_EXTENSION_SIZE;
        if let Some(path) = backing_file {
            if path.len() as u32 > max_backing_len {
                return Err(Error::BackingFileTooLong(path.len()));
            }
        }

        let mut header = QcowHeader {
            magic: QCOW_MAGIC,
            version: 3,
            backing_file_offset: backing_file
                .map_or(0, |_| u64::from(V3_BARE_HEADER_SIZE + EMPTY_HEADER_EXTENSION_SIZE)),
            backing_file_size: backing_file.map_or(0, |p| p.len() as u32),
            cluster_bits,
            size,
            crypt_method: 0,
            l1_size: num_l2_clusters,
            l1_table_offset: cluster_size,
            // The refcount table is after l1 + header.
            refcount_table_offset: cluster_size * u64::from(l1_clusters + 1),
            // Pre-allocate enough clusters for the entire refcount table as it
            // must be contiguous in the file.
            refcount_table_clusters: refcount_table_clusters_needed(
                num_clusters,
                num_l2_clusters,
                l1_clusters,
                cluster_size as u32,
            ),
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: DEFAULT_REFCOUNT_ORDER,
            header_size: V3_BARE_HEADER_SIZE,
            compression_type: 0,
            backing_file_path: backing_file.map(String::from),
            cluster_size: 0,
            num_clusters: 0,
            l2_size: 0,
            num_l2_clusters: 0,
            l1_clusters: 0,
            refcount_clusters_needed: 0,
        };
        header.precompute_table_sizes();
        if size > header.disk_size_limit() {
            return Err(Error::FileTooBig(size));
        }
        Ok(header)
    }

    /// Write the header to `file`, followed by the empty header extension area
    /// and the backing file path, then extend the file through the refcount
    /// table region.
    pub fn write_to<F: Write + Seek>(&self, file: &mut F) -> Result<()> {
        // Writes the next u32 to the file.
        fn write_u32_to_file<F: Write>(f: &mut F, value: u32) -> Result<()> {
            f.write_u32::<BigEndian>(value).map_err(Error::WritingHeader)
        }

        // Writes the next u64 to the file.
        fn write_u64_to_file<F: Write>(f: &mut F, value: u64) -> Result<()> {
            f.write_u64::<BigEndian>(value).map_err(Error::WritingHeader)
        }

        file.seek(SeekFrom::Start(0)).map_err(Error::WritingHeader)?;
        write_u32_to_file(file, self.magic)?;
        write_u32_to_file(file, self.version)?;
        write_u64_to_file(file, self.backing_file_offset)?;
        write_u32_to_file(file, self.backing_file_size)?;
        write_u32_to_file(file, self.cluster_bits)?;
        write_u64_to_file(file, self.size)?;
        write_u32_to_file(file, self.crypt_method)?;
        write_u32_to_file(file, self.l1_size)?;
        write_u64_to_file(file, self.l1_table_offset)?;
        write_u64_to_file(file, self.refcount_table_offset)?;
        write_u32_to_file(file, self.refcount_table_clusters)?;
        write_u32_to_file(file, self.nb_snapshots)?;
        write_u64_to_file(file, self.snapshots_offset)?;
        write_u64_to_file(file, self.incompatible_features)?;
        write_u64_to_file(file, self.compatible_features)?;
        write_u64_to_file(file, self.autoclear_features)?;
        write_u32_to_file(file, self.refcount_order)?;
        write_u32_to_file(file, self.header_size)?;
        if self.header_size > V3_BARE_HEADER_SIZE {
            let padded = [self.compression_type, 0, 0, 0, 0, 0, 0, 0];
            file.write_all(&padded).map_err(Error::WritingHeader)?;
        }

        // Empty header extension area: end-of-extensions type and zero length.
        write_u32_to_file(file, 0)?;
        write_u32_to_file(file, 0)?;

        if let Some(path) = &self.backing_file_path {
            if self.backing_file_offset > 0 {
                file.seek(SeekFrom::Start(self.backing_file_offset))
                    .map_err(Error::WritingHeader)?;
            }
            file.write_all(path.as_bytes()).map_err(Error::WritingHeader)?;
        }

        // Set the file length by seeking and writing a zero to the last byte.
        // Zeros out the l1 and refcount table clusters.
        let refcount_blocks_size = u64::from(self.refcount_table_clusters) * self.cluster_size;
        file.seek(SeekFrom::Start(
            self.refcount_table_offset + refcount_blocks_size - 2,
        ))
        .map_err(Error::WritingHeader)?;
        file.write_all(&[0u8]).map_err(Error::WritingHeader)?;

        Ok(())
    }

    /// Set or clear the refcount-dirty bit in place.
    pub fn set_dirty_bit<F: Write + Seek>(&mut self, file: &mut F, dirty: bool) -> Result<()> {
        if dirty {
            self.incompatible_features |= IncompatFeatures::DIRTY.bits();
        } else {
            self.incompatible_features &= !IncompatFeatures::DIRTY.bits();
        }
        file.seek(SeekFrom::Start(INCOMPATIBLE_FEATURES_OFFSET))
            .map_err(Error::WritingHeader)?;
        file.write_u64::<BigEndian>(self.incompatible_features)
            .map_err(Error::WritingHeader)
    }

    /// Set or clear the lazy-refcounts bit in place.
    pub fn set_lazy_refcounts<F: Write + Seek>(&mut self, file: &mut F, lazy: bool) -> Result<()> {
        if lazy {
            self.compatible_features |= COMPATIBLE_FEATURES_LAZY_REFCOUNTS;
        } else {
            self.compatible_features &= !COMPATIBLE_FEATURES_LAZY_REFCOUNTS;
        }
        file.seek(SeekFrom::Start(COMPATIBLE_FEATURES_OFFSET))
            .map_err(Error::WritingHeader)?;
        file.write_u64::<BigEndian>(self.compatible_features)
            .map_err(Error::WritingHeader)
    }

    pub fn is_dirty(&self) -> bool {
        IncompatFeatures::from_bits_truncate(self.incompatible_features)
            .contains(IncompatFeatures::DIRTY)
    }

    pub fn is_corrupt(&self) -> bool {
        IncompatFeatures::from_bits_truncate(self.incompatible_features)
            .contains(IncompatFeatures::CORRUPT)
    }

    pub fn lazy_refcounts(&self) -> bool {
        self.compatible_features & COMPATIBLE_FEATURES_LAZY_REFCOUNTS != 0
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn num_clusters(&self) -> u32 {
        self.num_clusters
    }

    /// Number of 8-byte entries in one L2 cluster.
    pub fn l2_size(&self) -> u32 {
        self.l2_size
    }

    pub fn num_l2_clusters(&self) -> u32 {
        self.num_l2_clusters
    }

    pub fn l1_clusters(&self) -> u32 {
        self.l1_clusters
    }

    fn precompute_table_sizes(&mut self) {
        self.cluster_size = 1u64 << self.cluster_bits;
        self.num_clusters = div_round_up_u64(self.size, self.cluster_size) as u32;
        self.l2_size = (self.cluster_size / u64::from(CLUSTER_ADDRESS_SIZE)) as u32;
        self.num_l2_clusters = div_round_up_u32(self.num_clusters, self.l2_size);
        self.l1_clusters = div_round_up_u32(self.num_l2_clusters, self.cluster_size as u32);
        self.refcount_clusters_needed = refcount_table_clusters_needed(
            self.num_clusters,
            self.num_l2_clusters,
            self.l1_clusters,
            self.cluster_size as u32,
        );
    }

    // The L1 table holds at most 32 MiB of 8-byte pointers, each addressing a
    // full L2 cluster of data pointers.
    fn disk_size_limit(&self) -> u64 {
        u64::from(L1_TABLE_MAX_SIZE) * self.cluster_size * self.cluster_size
            / u64::from(CLUSTER_ADDRESS_SIZE)
            / u64::from(CLUSTER_ADDRESS_SIZE)
    }

    fn validate(&self) -> Result<()> {
        if self.backing_file_offset == 0 && self.backing_file_size > 0 {
            return Err(Error::InvalidBackingFileOffset);
        }
        if self.backing_file_size == 0 && self.backing_file_offset > 0 {
            return Err(Error::InvalidBackingFileOffset);
        }
        if self.backing_file_size > MAX_BACKING_FILE_NAME_SIZE {
            return Err(Error::BackingFileTooLong(self.backing_file_size as usize));
        }
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Error::InvalidClusterSize);
        }
        if self.size > self.disk_size_limit() {
            return Err(Error::FileTooBig(self.size));
        }
        if self.crypt_method != 0 {
            return Err(Error::UnsupportedCryptMethod(self.crypt_method));
        }
        if self.l1_size > L1_TABLE_MAX_SIZE {
            return Err(Error::InvalidL1TableSize(self.l1_size));
        }
        if self.refcount_table_clusters == 0 {
            return Err(Error::NoRefcountClusters);
        }
        if self.nb_snapshots != 0 {
            return Err(Error::SnapshotsNotSupported(self.nb_snapshots));
        }

        let incompatible = IncompatFeatures::from_bits_truncate(self.incompatible_features);
        if incompatible.contains(IncompatFeatures::COMPRESSION) {
            return Err(Error::CompressedBlocksNotSupported);
        }
        if incompatible.contains(IncompatFeatures::DATA_FILE) {
            return Err(Error::ExternalDataFileNotSupported);
        }
        if incompatible.contains(IncompatFeatures::EXTENDED_L2) {
            return Err(Error::ExtendedL2EntriesNotSupported);
        }
        let autoclear = AutoclearFeatures::from_bits_truncate(self.autoclear_features);
        if autoclear.contains(AutoclearFeatures::BITMAPS) {
            return Err(Error::BitmapExtensionsNotSupported);
        }
        if autoclear.contains(AutoclearFeatures::RAW_EXTERNAL_DATA) {
            return Err(Error::RawExternalDataNotSupported);
        }

        if self.refcount_order != DEFAULT_REFCOUNT_ORDER {
            return Err(Error::UnsupportedRefcountOrder(self.refcount_order));
        }
        if self.header_size < V3_BARE_HEADER_SIZE {
            return Err(Error::InvalidHeaderLength(self.header_size));
        }

        offset_is_cluster_boundary(self.l1_table_offset, self.cluster_bits)?;
        offset_is_cluster_boundary(self.snapshots_offset, self.cluster_bits)?;
        offset_is_cluster_boundary(self.refcount_table_offset, self.cluster_bits)?;

        if self.num_l2_clusters > L1_TABLE_MAX_SIZE {
            return Err(Error::TooManyL1Entries(u64::from(self.num_l2_clusters)));
        }
        // Reject a suspiciously sized refcount table.
        if self.refcount_table_clusters > 2 * self.refcount_clusters_needed {
            return Err(Error::RefcountTableTooLarge);
        }
        if self.l1_clusters + self.refcount_clusters_needed > L1_TABLE_MAX_SIZE {
            return Err(Error::TooManyRefcounts(u64::from(
                self.refcount_clusters_needed,
            )));
        }

        Ok(())
    }
}

/// The number of clusters needed to hold the refcount blocks that cover
/// `num_clusters` data clusters, all metadata clusters, and the refcount
/// blocks themselves.
pub(crate) fn max_refcount_clusters(
    num_clusters: u32,
    num_l2_clusters: u32,
    l1_clusters: u32,
    cluster_size: u32,
) -> u32 {
    let refcount_bytes = (1u64 << DEFAULT_REFCOUNT_ORDER) / 8;
    let header_clusters = 1u64;
    let clusters = u64::from(num_clusters)
        + u64::from(num_l2_clusters)
        + u64::from(l1_clusters)
        + header_clusters;
    let for_data = div_round_up_u64(clusters * refcount_bytes, u64::from(cluster_size));
    let for_refcounts = div_round_up_u64(for_data * refcount_bytes, u64::from(cluster_size));
    (for_data + for_refcounts) as u32
}

/// Clusters of 8-byte entries needed for a refcount table addressing
/// `max_refcount_clusters` refcount blocks.
pub(crate) fn refcount_table_clusters_needed(
    num_clusters: u32,
    num_l2_clusters: u32,
    l1_clusters: u32,
    cluster_size: u32,
) -> u32 {
    let blocks = max_refcount_clusters(num_clusters, num_l2_clusters, l1_clusters, cluster_size);
    div_round_up_u32(blocks * CLUSTER_ADDRESS_SIZE, cluster_size)
}

// Returns an Error if the given offset doesn't align to a cluster boundary.
pub(crate) fn offset_is_cluster_boundary(offset: u64, cluster_bits: u32) -> Result<()> {
    if offset & ((1 << cluster_bits) - 1) != 0 {
        return Err(Error::InvalidOffset(offset));
    }
    Ok(())
}
