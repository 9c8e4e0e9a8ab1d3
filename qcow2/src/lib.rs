// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! A user-space implementation of the QCOW2 v3 disk image format: two-level
//! cluster pointer tables, two-level refcounts, on-demand allocation,
//! copy-on-write against backing files, and write-back metadata caching with
//! crash-recoverable flushing.

#[macro_use]
extern crate log;

mod header;
mod pointer_table;
mod raw_file;
mod rebuild;
mod refcount;
mod vec_cache;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::Utf8Error;

use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::header::QcowHeader;
use crate::pointer_table::{PointerTable, PointerTableCache, PointerTableDirect, RefcountToSet};
use crate::raw_file::QcowRawFile;
use crate::refcount::{RefcountCache, RefcountDirect, RefcountStore};
use crate::vec_cache::VecCache;

// bits 0-8 and 56-63 of a table entry are reserved.
pub(crate) const L1_TABLE_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub(crate) const L2_TABLE_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
// Flags
pub(crate) const COMPRESSED_FLAG: u64 = 1 << 62;
pub(crate) const CLUSTER_USED_FLAG: u64 = 1 << 63;

const BACKING_FILE_MAX_NESTING_DEPTH: u32 = 10;

const DEFAULT_POINTER_CACHE_SIZE: usize = 100;
const DEFAULT_REFCOUNT_CACHE_SIZE: usize = 50;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to access the pointer table: {0}")]
    AccessingPointerTable(#[source] pointer_table::Error),
    #[error("failed to allocate a cluster: {0}")]
    AllocatingCluster(#[source] io::Error),
    #[error("backing file chain deeper than {0} levels")]
    BackingChainTooDeep(u32),
    #[error("backing file does not exist: {0}")]
    BackingFileMissing(String),
    #[error("backing file name is too long: {0} bytes")]
    BackingFileTooLong(usize),
    #[error("bitmap extensions are not supported")]
    BitmapExtensionsNotSupported,
    #[error("cannot open an image with broken reference counts read-only")]
    BrokenRefcountsReadOnly,
    #[error("compressed blocks are not supported")]
    CompressedBlocksNotSupported,
    #[error("extended L2 entries are not supported")]
    ExtendedL2EntriesNotSupported,
    #[error("external data files are not supported")]
    ExternalDataFileNotSupported,
    #[error("virtual size exceeds the addressable limit: {0}")]
    FileTooBig(u64),
    #[error("failed to get file size: {0}")]
    GettingFileSize(#[source] io::Error),
    #[error("failed to get refcount: {0}")]
    GettingRefcount(#[source] refcount::Error),
    #[error("image directory does not exist: {0}")]
    ImageDirectoryMissing(String),
    #[error("image path already exists: {0}")]
    ImageExists(String),
    #[error("backing file name is not valid UTF-8: {0}")]
    InvalidBackingFileName(#[source] Utf8Error),
    #[error("inconsistent backing file offset and size")]
    InvalidBackingFileOffset,
    #[error("invalid cluster index")]
    InvalidClusterIndex,
    #[error("invalid cluster size")]
    InvalidClusterSize,
    #[error("invalid header length: {0}")]
    InvalidHeaderLength(u32),
    #[error("invalid L1 table offset")]
    InvalidL1TableOffset,
    #[error("invalid L1 table size: {0}")]
    InvalidL1TableSize(u32),
    #[error("invalid magic")]
    InvalidMagic,
    #[error("offset is not cluster aligned: {0}")]
    InvalidOffset(u64),
    #[error("invalid refcount table offset")]
    InvalidRefcountTableOffset,
    #[error("invalid refcount table size: {0}")]
    InvalidRefcountTableSize(u64),
    #[error("image path is not absolute: {0}")]
    NonAbsolutePath(String),
    #[error("the header specifies no refcount table clusters")]
    NoRefcountClusters,
    #[error("not enough space for refcounts")]
    NotEnoughSpaceForRefcounts,
    #[error("failed to open file: {0}")]
    OpeningFile(#[source] io::Error),
    #[error("raw external data is not supported")]
    RawExternalDataNotSupported,
    #[error("failed to read data: {0}")]
    ReadingData(#[source] io::Error),
    #[error("failed to read header: {0}")]
    ReadingHeader(#[source] io::Error),
    #[error("failed to read pointer table: {0}")]
    ReadingPointers(#[source] io::Error),
    #[error("failed to read refcounts: {0}")]
    ReadingRefCounts(#[source] io::Error),
    #[error("failed to rebuild refcounts: {0}")]
    RebuildingRefCounts(#[source] io::Error),
    #[error("too many clusters specified for the refcount table")]
    RefcountTableTooLarge,
    #[error("failed to set refcount: {0}")]
    SettingRefcount(#[source] refcount::Error),
    #[error("snapshots are not supported, image has {0}")]
    SnapshotsNotSupported(u32),
    #[error("failed to sync file: {0}")]
    SyncingFile(#[source] io::Error),
    #[error("l1 entry table too large: {0}")]
    TooManyL1Entries(u64),
    #[error("refcount table too large: {0}")]
    TooManyRefcounts(u64),
    #[error("unsupported crypt method: {0}")]
    UnsupportedCryptMethod(u32),
    #[error("unsupported refcount order: {0}")]
    UnsupportedRefcountOrder(u32),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("write access to a read-only image")]
    WriteToReadOnly,
    #[error("failed to write data: {0}")]
    WritingData(#[source] io::Error),
    #[error("failed to write header: {0}")]
    WritingHeader(#[source] io::Error),
    #[error("failed to write refcounts: {0}")]
    WritingRefCounts(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// Ceiling of the division of `dividend`/`divisor`.
pub(crate) fn div_round_up_u64(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + u64::from(dividend % divisor != 0)
}

// Ceiling of the division of `dividend`/`divisor`.
pub(crate) fn div_round_up_u32(dividend: u32, divisor: u32) -> u32 {
    dividend / divisor + u32::from(dividend % divisor != 0)
}

// Allocates a cluster, preferring the free list over extending the file.
// Clusters handed back from the free list are zeroed unless initial data is
// supplied; file-end clusters are fresh from truncation.
fn alloc_cluster(
    raw_file: &mut QcowRawFile,
    avail_clusters: &mut Vec<u64>,
    max_valid_cluster_offset: u64,
    initial_data: Option<&[u8]>,
) -> io::Result<u64> {
    if let Some(free_cluster) = avail_clusters.pop() {
        match initial_data {
            Some(data) => raw_file.write_cluster(free_cluster, data)?,
            None => raw_file.zero_cluster(free_cluster)?,
        }
        return Ok(free_cluster);
    }
    if let Some(new_cluster) = raw_file.allocate_cluster_at_file_end(max_valid_cluster_offset)? {
        if let Some(data) = initial_data {
            raw_file.write_cluster(new_cluster, data)?;
        }
        Ok(new_cluster)
    } else {
        error!("the refcount table cannot describe any further clusters");
        Err(io::Error::from_raw_os_error(libc::ENOSPC))
    }
}

/// Chooses how images are opened: with write-back metadata caches or with
/// direct per-operation file I/O.
#[derive(Clone, Copy, Debug)]
pub struct ImageFactory {
    use_cache: bool,
    pointer_cache_size: usize,
    refcount_cache_size: usize,
}

impl ImageFactory {
    pub fn cached() -> ImageFactory {
        ImageFactory {
            use_cache: true,
            pointer_cache_size: DEFAULT_POINTER_CACHE_SIZE,
            refcount_cache_size: DEFAULT_REFCOUNT_CACHE_SIZE,
        }
    }

    pub fn direct() -> ImageFactory {
        ImageFactory {
            use_cache: false,
            pointer_cache_size: 0,
            refcount_cache_size: 0,
        }
    }

    pub fn new(use_cache: bool) -> ImageFactory {
        if use_cache {
            Self::cached()
        } else {
            Self::direct()
        }
    }

    /// Creates a new image of `virtual_size` bytes at `path`.
    pub fn create_image(&self, path: &Path, virtual_size: u64) -> Result<ImageFile> {
        let path = resolve_image_path(path)?;
        if path.exists() {
            return Err(Error::ImageExists(path.display().to_string()));
        }
        let header = QcowHeader::create_for_size_and_path(virtual_size, None)?;
        self.create_image_from_header(path, header, 1)
    }

    /// Creates a new image at `path` backed by `backing_file`, inheriting the
    /// backing image's virtual size.
    pub fn create_image_with_backing(&self, path: &Path, backing_file: &str) -> Result<ImageFile> {
        let path = resolve_image_path(path)?;
        if path.exists() {
            return Err(Error::ImageExists(path.display().to_string()));
        }
        let backing = self.open_backing(backing_file, &path, BACKING_FILE_MAX_NESTING_DEPTH - 1)?;
        let virtual_size = backing.virtual_size();
        drop(backing);
        let header = QcowHeader::create_for_size_and_path(virtual_size, Some(backing_file))?;
        self.create_image_from_header(path, header, BACKING_FILE_MAX_NESTING_DEPTH)
    }

    /// Opens the image at `path`. Read-only opens are rejected when the image
    /// needs its reference counts rebuilt.
    pub fn open_image(&self, path: &Path, read_only: bool) -> Result<ImageFile> {
        let path = resolve_image_path(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(Error::OpeningFile)?;
        self.image_from_file(path, file, BACKING_FILE_MAX_NESTING_DEPTH, read_only)
    }

    fn open_backing(
        &self,
        backing_path: &str,
        child_path: &Path,
        remaining_depth: u32,
    ) -> Result<ImageFile> {
        if remaining_depth == 0 {
            return Err(Error::BackingChainTooDeep(BACKING_FILE_MAX_NESTING_DEPTH));
        }
        let resolved = resolve_backing_file_path(backing_path, child_path);
        if !resolved.exists() {
            return Err(Error::BackingFileMissing(resolved.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .open(&resolved)
            .map_err(Error::OpeningFile)?;
        self.image_from_file(resolved, file, remaining_depth, true)
    }

    fn create_image_from_header(
        &self,
        path: PathBuf,
        header: QcowHeader,
        depth: u32,
    ) -> Result<ImageFile> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(Error::OpeningFile)?;
        header.write_to(&mut file)?;
        let mut image = self.image_from_file(path, file, depth, false)?;

        // Reference every cluster from the header through the end of the
        // refcount table region so the metadata area is never handed out as a
        // data cluster.
        let cluster_size = image.raw_file.cluster_size();
        let end_cluster_addr = header.refcount_table_offset
            + u64::from(header.refcount_table_clusters) * cluster_size;
        let mut cluster_addr = 0;
        while cluster_addr < end_cluster_addr {
            let mut unref = image.set_cluster_refcount(cluster_addr, 1)?;
            image.unref_clusters.append(&mut unref);
            cluster_addr += cluster_size;
        }
        Ok(image)
    }

    fn image_from_file(
        &self,
        path: PathBuf,
        mut file: File,
        remaining_depth: u32,
        read_only: bool,
    ) -> Result<ImageFile> {
        let mut header = QcowHeader::from_file(&mut file)?;
        let cluster_size = header.cluster_size();
        let mut raw_file =
            QcowRawFile::from(file, cluster_size, read_only).ok_or(Error::InvalidClusterSize)?;

        let backing_file = match header.backing_file_path.clone() {
            Some(backing_path) => Some(Box::new(self.open_backing(
                &backing_path,
                &path,
                remaining_depth - 1,
            )?)),
            None => None,
        };

        // The first cluster always has a non-zero refcount in a consistent
        // image, so a missing or zero count means the refcounts are stale.
        let mut rebuild_required = true;
        let first_refblock_addr = raw_file
            .read_u64_at(header.refcount_table_offset)
            .map_err(Error::ReadingRefCounts)?;
        if first_refblock_addr != 0 {
            let first_cluster_refcount = raw_file
                .read_u16_at(first_refblock_addr)
                .map_err(Error::ReadingRefCounts)?;
            if first_cluster_refcount != 0 {
                rebuild_required = false;
            }
        }
        if header.lazy_refcounts() || header.is_dirty() || header.is_corrupt() {
            rebuild_required = true;
        }
        if rebuild_required {
            if read_only {
                return Err(Error::BrokenRefcountsReadOnly);
            }
            rebuild::rebuild_refcounts(&mut raw_file, &header)?;
            header.compatible_features &= !header::COMPATIBLE_FEATURES_LAZY_REFCOUNTS;
        }

        let refcount_bytes = div_round_up_u64(1u64 << header.refcount_order, 8);
        let refcount_block_entries = cluster_size / refcount_bytes;
        let refcount_table_entries = u64::from(header::max_refcount_clusters(
            header.num_clusters(),
            header.num_l2_clusters(),
            header.l1_clusters(),
            cluster_size as u32,
        ));

        let refcounts: Box<dyn RefcountStore> = if self.use_cache {
            Box::new(
                RefcountCache::new(
                    &mut raw_file,
                    header.refcount_table_offset,
                    refcount_table_entries,
                    refcount_block_entries,
                    cluster_size,
                    self.refcount_cache_size,
                )
                .map_err(Error::ReadingRefCounts)?,
            )
        } else {
            Box::new(RefcountDirect::new(
                header.refcount_table_offset,
                refcount_table_entries,
                refcount_block_entries,
                cluster_size,
            ))
        };
        let pointer_table: Box<dyn PointerTable> = if self.use_cache {
            Box::new(
                PointerTableCache::new(&header, &mut raw_file, self.pointer_cache_size)
                    .map_err(Error::ReadingPointers)?,
            )
        } else {
            Box::new(PointerTableDirect::new(&header))
        };

        let mut image = ImageFile {
            path,
            raw_file,
            header,
            pointer_table,
            refcounts,
            unref_clusters: Vec::new(),
            avail_clusters: Vec::new(),
            backing_file,
            read_only,
            closed: false,
        };

        // The tables must fit in a 64 bit address space.
        image
            .header
            .l1_table_offset
            .checked_add(image.l1_address_offset(image.virtual_size()))
            .ok_or(Error::InvalidL1TableOffset)?;
        image
            .header
            .refcount_table_offset
            .checked_add(u64::from(image.header.refcount_table_clusters) * cluster_size)
            .ok_or(Error::InvalidRefcountTableOffset)?;

        image.find_avail_clusters()?;

        if !read_only {
            image
                .header
                .set_dirty_bit(image.raw_file.file_mut(), true)?;
            image.raw_file.sync_data().map_err(Error::SyncingFile)?;
        }

        Ok(image)
    }
}

fn resolve_image_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(Error::NonAbsolutePath(path.display().to_string()));
    }
    match path.parent() {
        Some(dir) if dir.exists() => Ok(path.to_path_buf()),
        Some(dir) => Err(Error::ImageDirectoryMissing(dir.display().to_string())),
        None => Err(Error::ImageDirectoryMissing(path.display().to_string())),
    }
}

// Relative backing file paths resolve against the child image's directory.
fn resolve_backing_file_path(backing_path: &str, child_path: &Path) -> PathBuf {
    let backing = Path::new(backing_path);
    if backing.is_absolute() {
        backing.to_path_buf()
    } else {
        child_path
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .join(backing)
    }
}

/// An open QCOW2 image: reads and writes against the virtual disk are
/// translated through the pointer tables into cluster I/O on the raw file,
/// with clusters allocated on demand and refcounts kept in step.
pub struct ImageFile {
    path: PathBuf,
    raw_file: QcowRawFile,
    header: QcowHeader,
    pointer_table: Box<dyn PointerTable>,
    refcounts: Box<dyn RefcountStore>,
    // Freshly unreferenced clusters. They become allocatable once the removal
    // of the references to them has been synced to disk.
    unref_clusters: Vec<u64>,
    avail_clusters: Vec<u64>,
    backing_file: Option<Box<ImageFile>>,
    read_only: bool,
    closed: bool,
}

impl ImageFile {
    /// Returns the virtual size of this image in bytes.
    pub fn virtual_size(&self) -> u64 {
        self.header.size
    }

    /// Returns the path this image was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the `QcowHeader` for this image.
    pub fn header(&self) -> &QcowHeader {
        &self.header
    }

    /// Reads up to `buf.len()` bytes of the virtual disk starting at
    /// `address`, returning how many bytes were read. Ranges beyond the
    /// virtual size are truncated; unallocated ranges read from the backing
    /// image or as zeros.
    pub fn read_at(&mut self, address: u64, buf: &mut [u8]) -> Result<usize> {
        let read_count = self.limit_range_file(address, buf.len());
        let mut nread: usize = 0;
        while nread < read_count {
            let curr_addr = address + nread as u64;
            let count = self
                .raw_file
                .limit_range_cluster(curr_addr, (read_count - nread) as u64)
                as usize;
            let file_offset = self.file_offset_read(curr_addr)?;
            let chunk = &mut buf[nread..(nread + count)];

            match file_offset {
                Some(offset) => {
                    self.raw_file
                        .read_at(chunk, offset)
                        .map_err(Error::ReadingData)?;
                }
                None => {
                    if let Some(backing) = self.backing_file.as_mut() {
                        let n = backing.read_at(curr_addr, chunk)?;
                        chunk[n..].fill(0);
                    } else {
                        chunk.fill(0);
                    }
                }
            }
            nread += count;
        }
        Ok(read_count)
    }

    /// Writes `data` to the virtual disk at `address`, returning how many
    /// bytes were written. Ranges beyond the virtual size are truncated and
    /// never extend it.
    pub fn write_at(&mut self, address: u64, data: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(Error::WriteToReadOnly);
        }
        let write_count = self.limit_range_file(address, data.len());
        let mut nwritten: usize = 0;
        while nwritten < write_count {
            let curr_addr = address + nwritten as u64;
            let offset = self.file_offset_write(curr_addr)?;
            let count = self
                .raw_file
                .limit_range_cluster(curr_addr, (write_count - nwritten) as u64)
                as usize;
            self.raw_file
                .write_at(&data[nwritten..(nwritten + count)], offset)
                .map_err(Error::WritingData)?;
            nwritten += count;
        }
        Ok(write_count)
    }

    /// Commits all dirty metadata and data, then recycles clusters freed
    /// before this flush.
    pub fn flush(&mut self) -> Result<()> {
        self.sync_caches()?;
        self.avail_clusters.append(&mut self.unref_clusters);
        Ok(())
    }

    /// Flushes, lowers the dirty bit, and closes the backing chain. Further
    /// use of the image is not possible.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut result = Ok(());
        if !self.read_only {
            result = self.sync_caches();
            if result.is_ok() {
                result = self
                    .header
                    .set_dirty_bit(self.raw_file.file_mut(), false)
                    .and_then(|()| self.raw_file.sync_data().map_err(Error::SyncingFile));
            }
        }
        if let Some(backing) = self.backing_file.as_mut() {
            backing.close()?;
        }
        self.closed = true;
        result
    }

    /// Returns the refcount of the cluster holding `address`. Only useful for
    /// debugging.
    pub fn cluster_refcount(&mut self, address: u64) -> Result<u16> {
        self.refcounts
            .get_cluster_refcount(&mut self.raw_file, address)
            .map_err(Error::GettingRefcount)
    }

    // Limits the range so that it doesn't exceed the virtual size of the file.
    fn limit_range_file(&self, address: u64, count: usize) -> usize {
        if address.checked_add(count as u64).is_none() || address > self.virtual_size() {
            return 0;
        }
        (count as u64).min(self.virtual_size() - address) as usize
    }

    // Gets the offset of `address` in the L1 table.
    fn l1_address_offset(&self, address: u64) -> u64 {
        let cluster_size = self.header.cluster_size();
        let l1_index = (address / cluster_size) / u64::from(self.header.l2_size());
        l1_index * size_of::<u64>() as u64
    }

    fn find_avail_clusters(&mut self) -> Result<()> {
        let file_size = self.raw_file.len().map_err(Error::GettingFileSize)?;
        let cluster_size = self.raw_file.cluster_size();
        let mut cluster_addr = 0;
        while cluster_addr < file_size {
            let refcount = self
                .refcounts
                .get_cluster_refcount(&mut self.raw_file, cluster_addr)
                .map_err(Error::GettingRefcount)?;
            if refcount == 0 {
                self.avail_clusters.push(cluster_addr);
            }
            cluster_addr += cluster_size;
        }
        Ok(())
    }

    // Gets the offset of the given guest address in the host file, or None if
    // the L1, L2, or data cluster has yet to be allocated.
    fn file_offset_read(&mut self, address: u64) -> Result<Option<u64>> {
        if address >= self.virtual_size() {
            return Err(Error::InvalidOffset(address));
        }
        match self
            .pointer_table
            .read_cluster_address(&mut self.raw_file, address)
        {
            Ok(0) => Ok(None),
            Ok(cluster_addr) => Ok(Some(cluster_addr + self.raw_file.cluster_offset(address))),
            Err(pointer_table::Error::NeedPointerCluster) => Ok(None),
            Err(e) => Err(Error::AccessingPointerTable(e)),
        }
    }

    // Gets the offset of the given guest address in the host file, allocating
    // the L1, L2, and data clusters along the way as needed.
    fn file_offset_write(&mut self, address: u64) -> Result<u64> {
        if address >= self.virtual_size() {
            return Err(Error::InvalidOffset(address));
        }

        let mut refcounts_to_set: Vec<RefcountToSet> = Vec::new();
        let mut cluster_addr = match self
            .pointer_table
            .read_cluster_address(&mut self.raw_file, address)
        {
            Ok(addr) => addr,
            Err(pointer_table::Error::NeedPointerCluster) => {
                let new_l2_addr = self.get_new_cluster(None)?;
                refcounts_to_set.push(RefcountToSet {
                    address: new_l2_addr,
                    value: 1,
                });
                self.pointer_table
                    .add_new_pointer_cluster(&mut self.raw_file, address, new_l2_addr)
                    .map_err(Error::AccessingPointerTable)?;
                0
            }
            Err(e) => return Err(Error::AccessingPointerTable(e)),
        };

        if cluster_addr == 0 {
            // A partial write into a fresh cluster must not lose the backing
            // image's bytes, so the new cluster starts as a copy of the whole
            // enclosing backing cluster.
            let initial_data = if self.backing_file.is_some() {
                let cluster_begin = self.raw_file.cluster_address(address);
                let mut data = vec![0u8; self.raw_file.cluster_size() as usize];
                // The option was just checked.
                let backing = self.backing_file.as_mut().unwrap();
                backing.read_at(cluster_begin, &mut data)?;
                Some(data)
            } else {
                None
            };
            cluster_addr = self.append_data_cluster(initial_data.as_deref())?;
            self.update_cluster_address(address, cluster_addr, &mut refcounts_to_set)?;
        }

        for refcount_to_set in refcounts_to_set {
            let mut unref =
                self.set_cluster_refcount(refcount_to_set.address, refcount_to_set.value)?;
            self.unref_clusters.append(&mut unref);
        }

        Ok(cluster_addr + self.raw_file.cluster_offset(address))
    }

    // Allocates a new cluster and returns its offset within the raw file.
    fn get_new_cluster(&mut self, initial_data: Option<&[u8]>) -> Result<u64> {
        let max_valid_cluster_offset = self.refcounts.max_valid_cluster_offset();
        alloc_cluster(
            &mut self.raw_file,
            &mut self.avail_clusters,
            max_valid_cluster_offset,
            initial_data,
        )
        .map_err(Error::AllocatingCluster)
    }

    // Allocates a new data cluster and sets its refcount to 1.
    fn append_data_cluster(&mut self, initial_data: Option<&[u8]>) -> Result<u64> {
        let new_addr = self.get_new_cluster(initial_data)?;
        let mut newly_unref = self.set_cluster_refcount(new_addr, 1)?;
        self.unref_clusters.append(&mut newly_unref);
        Ok(new_addr)
    }

    // Points the L2 entry for `virtual_address` at `cluster_addr`, collecting
    // any refcount updates the pointer table's copy-on-write emits.
    fn update_cluster_address(
        &mut self,
        virtual_address: u64,
        cluster_addr: u64,
        refcounts_to_set: &mut Vec<RefcountToSet>,
    ) -> Result<()> {
        let max_valid_cluster_offset = self.refcounts.max_valid_cluster_offset();
        let avail_clusters = &mut self.avail_clusters;
        let mut alloc = |raw_file: &mut QcowRawFile| {
            alloc_cluster(raw_file, avail_clusters, max_valid_cluster_offset, None)
        };
        match self.pointer_table.update_cluster_address(
            &mut self.raw_file,
            virtual_address,
            cluster_addr,
            &mut alloc,
        ) {
            Ok(()) => Ok(()),
            Err(pointer_table::Error::NeedFreeClusters {
                cluster_to_remove,
                refcounts,
            }) => {
                refcounts_to_set.extend(refcounts);
                self.unref_clusters.push(cluster_to_remove);
                Ok(())
            }
            Err(e) => Err(Error::AccessingPointerTable(e)),
        }
    }

    // Sets the refcount of the cluster at `address`, iterating through the
    // refcount store's allocation protocol. Every intermediate cluster
    // allocated for refcount blocks is itself refcounted. Returns clusters
    // that became unreferenced along the way.
    fn set_cluster_refcount(&mut self, address: u64, refcount: u16) -> Result<Vec<u64>> {
        let mut added_clusters = Vec::new();
        let mut unref_clusters = Vec::new();
        let mut refcount_set = false;
        let mut new_cluster = None;

        while !refcount_set {
            match self.refcounts.set_cluster_refcount(
                &mut self.raw_file,
                address,
                refcount,
                new_cluster.take(),
            ) {
                Ok(None) => {
                    refcount_set = true;
                }
                Ok(Some(freed_cluster)) => {
                    unref_clusters.push(freed_cluster);
                    refcount_set = true;
                }
                Err(refcount::Error::NeedReadCluster(addr)) => {
                    // Read the block and call set_cluster_refcount again.
                    new_cluster = Some((
                        addr,
                        VecCache::from_vec(
                            self.raw_file
                                .read_refcount_block(addr)
                                .map_err(Error::ReadingRefCounts)?,
                        ),
                    ));
                }
                Err(refcount::Error::NeedNewCluster) => {
                    // Allocate a cluster and call set_cluster_refcount again.
                    let addr = self.get_new_cluster(None)?;
                    added_clusters.push(addr);
                    new_cluster = Some((
                        addr,
                        VecCache::new(self.refcounts.refcounts_per_block() as usize),
                    ));
                }
                Err(e) => return Err(Error::SettingRefcount(e)),
            }
        }

        for addr in added_clusters {
            self.set_cluster_refcount(addr, 1)?;
        }
        Ok(unref_clusters)
    }

    // Flushes dirty metadata so that a crash at any point leaves a
    // recoverable image: L2 tables and refcount blocks land before the L1 and
    // refcount tables that point at them.
    fn sync_caches(&mut self) -> Result<()> {
        self.pointer_table
            .sync(&mut self.raw_file)
            .map_err(Error::AccessingPointerTable)?;
        self.refcounts
            .flush_blocks(&mut self.raw_file)
            .map_err(Error::WritingRefCounts)?;
        self.raw_file.sync_all().map_err(Error::SyncingFile)?;

        let mut sync_required = self
            .refcounts
            .flush_table(&mut self.raw_file)
            .map_err(Error::WritingRefCounts)?;
        sync_required |= self
            .pointer_table
            .sync_l1(&mut self.raw_file)
            .map_err(Error::AccessingPointerTable)?;
        if sync_required {
            self.raw_file.sync_data().map_err(Error::SyncingFile)?;
        }
        Ok(())
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn serialize_header(header: &QcowHeader) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        header.write_to(&mut cursor).unwrap();
        cursor.into_inner()
    }

    fn parse_header(bytes: Vec<u8>) -> Result<QcowHeader> {
        QcowHeader::from_file(&mut Cursor::new(bytes))
    }

    fn image_path(dir: &TempDir, name: &str) -> PathBuf {
        dir.as_path().join(name)
    }

    #[test]
    fn header_round_trip() {
        let header = QcowHeader::create_for_size_and_path(10 * MIB, None).unwrap();
        assert_eq!(header.cluster_size(), 65536);
        assert_eq!(header.num_clusters(), 160);
        let parsed = parse_header(serialize_header(&header)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_round_trip_with_backing() {
        let header =
            QcowHeader::create_for_size_and_path(10 * MIB, Some("/var/lib/disks/base.qcow2"))
                .unwrap();
        let parsed = parse_header(serialize_header(&header)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(
            parsed.backing_file_path.as_deref(),
            Some("/var/lib/disks/base.qcow2")
        );
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[3] = 0xfc;
        assert!(matches!(parse_header(bytes), Err(Error::InvalidMagic)));
    }

    #[test]
    fn header_rejects_version_2() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[7] = 2;
        assert!(matches!(
            parse_header(bytes),
            Err(Error::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn header_rejects_bad_refcount_order() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[99] = 2;
        assert!(matches!(
            parse_header(bytes),
            Err(Error::UnsupportedRefcountOrder(2))
        ));
    }

    #[test]
    fn header_rejects_bad_cluster_bits() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[23] = 3;
        assert!(matches!(parse_header(bytes), Err(Error::InvalidClusterSize)));
    }

    #[test]
    fn header_rejects_compression_feature() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[79] |= 0x08;
        assert!(matches!(
            parse_header(bytes),
            Err(Error::CompressedBlocksNotSupported)
        ));
    }

    #[test]
    fn header_rejects_external_data_file_feature() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[79] |= 0x04;
        assert!(matches!(
            parse_header(bytes),
            Err(Error::ExternalDataFileNotSupported)
        ));
    }

    #[test]
    fn header_rejects_bitmap_autoclear_feature() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[95] |= 0x01;
        assert!(matches!(
            parse_header(bytes),
            Err(Error::BitmapExtensionsNotSupported)
        ));
    }

    #[test]
    fn header_rejects_snapshots() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[59] = 1;
        assert!(matches!(
            parse_header(bytes),
            Err(Error::SnapshotsNotSupported(1))
        ));
    }

    #[test]
    fn header_rejects_crypt_method() {
        let mut bytes = serialize_header(&QcowHeader::create_for_size_and_path(MIB, None).unwrap());
        bytes[35] = 1;
        assert!(matches!(
            parse_header(bytes),
            Err(Error::UnsupportedCryptMethod(1))
        ));
    }

    #[test]
    fn create_requires_absolute_path() {
        let factory = ImageFactory::cached();
        assert!(matches!(
            factory.create_image(Path::new("disk.qcow2"), MIB),
            Err(Error::NonAbsolutePath(_))
        ));
    }

    fn write_read_patterns(factory: ImageFactory) {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let size = 10 * MIB;
        let mut image = factory.create_image(&path, size).unwrap();
        assert_eq!(image.virtual_size(), size);

        for &step in &[1usize, 3, 512, 4096, 65536, 65537] {
            for i in 0..4u64 {
                let offset = (i * step as u64 * 7) % size;
                let len = (step as u64).min(size - offset) as usize;
                let data = vec![0xaa; len];
                assert_eq!(image.write_at(offset, &data).unwrap(), len);
                let mut readback = vec![0u8; len];
                assert_eq!(image.read_at(offset, &mut readback).unwrap(), len);
                assert_eq!(readback, data);
            }
        }
    }

    #[test]
    fn create_write_read_cached() {
        write_read_patterns(ImageFactory::cached());
    }

    #[test]
    fn create_write_read_direct() {
        write_read_patterns(ImageFactory::direct());
    }

    #[test]
    fn unaligned_write_spans_clusters() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, 10 * MIB).unwrap();
        let cluster_size = image.header().cluster_size();

        // Straddle the first cluster boundary with a distinctive run.
        let offset = cluster_size - 100;
        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        assert_eq!(image.write_at(offset, &data).unwrap(), 300);

        let mut readback = vec![0u8; 300];
        image.read_at(offset, &mut readback).unwrap();
        assert_eq!(readback, data);

        // Bytes on either side of the run are still zero.
        let mut edge = [0u8; 16];
        image.read_at(offset - 16, &mut edge).unwrap();
        assert_eq!(edge, [0u8; 16]);
        image.read_at(offset + 300, &mut edge).unwrap();
        assert_eq!(edge, [0u8; 16]);
    }

    #[test]
    fn untouched_ranges_read_zero() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, 10 * MIB).unwrap();
        image.write_at(4096, &[0x55; 512]).unwrap();
        let mut buf = vec![0xffu8; 1024];
        image.read_at(5 * MIB, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn writes_never_extend_virtual_size() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let size = 2 * MIB;
        let mut image = ImageFactory::cached().create_image(&path, size).unwrap();

        // A write crossing the end is truncated at the boundary.
        assert_eq!(image.write_at(size - 4, &[0x11; 8]).unwrap(), 4);
        // A write past the end does nothing.
        assert_eq!(image.write_at(size + 10, &[0x11; 8]).unwrap(), 0);
        assert_eq!(image.virtual_size(), size);

        let mut buf = [0u8; 8];
        assert_eq!(image.read_at(size - 4, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0x11; 4]);
    }

    #[test]
    fn flush_then_reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, 10 * MIB).unwrap();
        image.write_at(0, &[0x42; 1024]).unwrap();
        image.write_at(3 * MIB + 17, &[0x43; 100]).unwrap();
        image.flush().unwrap();
        // Abandon the handle without a clean close, as a crash would.
        std::mem::forget(image);

        let mut reopened = ImageFactory::cached().open_image(&path, false).unwrap();
        let mut buf = vec![0u8; 1024];
        reopened.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, vec![0x42; 1024]);
        let mut buf = vec![0u8; 100];
        reopened.read_at(3 * MIB + 17, &mut buf).unwrap();
        assert_eq!(buf, vec![0x43; 100]);
    }

    #[test]
    fn clean_close_clears_dirty_bit() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, MIB).unwrap();
        image.write_at(0, &[1u8; 512]).unwrap();
        image.close().unwrap();

        let mut file = std::fs::File::open(&path).unwrap();
        let header = QcowHeader::from_file(&mut file).unwrap();
        assert!(!header.is_dirty());
    }

    #[test]
    fn read_only_open_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, MIB).unwrap();
        image.write_at(512, &[9u8; 512]).unwrap();
        image.close().unwrap();

        let mut ro = ImageFactory::cached().open_image(&path, true).unwrap();
        assert!(matches!(
            ro.write_at(0, &[1u8; 16]),
            Err(Error::WriteToReadOnly)
        ));
        let mut buf = [0u8; 512];
        ro.read_at(512, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 512]);
    }

    fn corrupt_first_reftable_entry(path: &Path) {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        let header = QcowHeader::from_file(&mut file).unwrap();
        file.seek(SeekFrom::Start(header.refcount_table_offset))
            .unwrap();
        file.write_all(&[0u8; 8]).unwrap();
    }

    #[test]
    fn broken_refcounts_rejected_read_only() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, MIB).unwrap();
        image.write_at(0, &[7u8; 4096]).unwrap();
        image.close().unwrap();
        corrupt_first_reftable_entry(&path);

        assert!(matches!(
            ImageFactory::cached().open_image(&path, true),
            Err(Error::BrokenRefcountsReadOnly)
        ));
    }

    #[test]
    fn broken_refcounts_rebuilt_on_writable_open() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, MIB).unwrap();
        image.write_at(0, &[7u8; 4096]).unwrap();
        image.write_at(512 * 1024, &[8u8; 512]).unwrap();
        image.close().unwrap();
        corrupt_first_reftable_entry(&path);

        let mut rebuilt = ImageFactory::cached().open_image(&path, false).unwrap();
        let mut buf = vec![0u8; 4096];
        rebuilt.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, vec![7u8; 4096]);
        let mut buf = vec![0u8; 512];
        rebuilt.read_at(512 * 1024, &mut buf).unwrap();
        assert_eq!(buf, vec![8u8; 512]);
        // Writes keep working against the rebuilt tables.
        rebuilt.write_at(64, &[1u8; 64]).unwrap();
        let mut buf = [0u8; 64];
        rebuilt.read_at(64, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 64]);
    }

    #[test]
    fn refcounts_consistent_after_rebuild() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, MIB).unwrap();
        image.write_at(0, &[3u8; 65536]).unwrap();
        image.close().unwrap();
        corrupt_first_reftable_entry(&path);

        let mut rebuilt = ImageFactory::cached().open_image(&path, false).unwrap();
        let cluster_size = rebuilt.header().cluster_size();
        let file_len = std::fs::metadata(&path).unwrap().len();
        let mut sum: u64 = 0;
        let mut occupied: u64 = 0;
        let mut addr = 0;
        while addr < file_len {
            let refcount = rebuilt.cluster_refcount(addr).unwrap();
            sum += u64::from(refcount);
            if refcount > 0 {
                occupied += 1;
            }
            addr += cluster_size;
        }
        assert_eq!(sum, occupied);
        // The header cluster is reachable and counted.
        assert!(rebuilt.cluster_refcount(0).unwrap() >= 1);
    }

    #[test]
    fn file_size_is_cluster_aligned() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, 10 * MIB).unwrap();
        image.write_at(MIB, &[0xee; 123]).unwrap();
        image.flush().unwrap();
        let cluster_size = image.header().cluster_size();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len % cluster_size, 0);
    }

    #[test]
    fn freed_clusters_are_reused_after_flush() {
        let dir = TempDir::new().unwrap();
        let path = image_path(&dir, "disk.qcow2");
        let mut image = ImageFactory::cached().create_image(&path, 10 * MIB).unwrap();
        for round in 0..8u8 {
            image.write_at(0, &[round; 4096]).unwrap();
            image.flush().unwrap();
        }
        let len_after = std::fs::metadata(&path).unwrap().len();
        for round in 8..16u8 {
            image.write_at(0, &[round; 4096]).unwrap();
            image.flush().unwrap();
        }
        // Rewriting the same range settles into reusing freed clusters
        // instead of growing the file every round.
        let len_final = std::fs::metadata(&path).unwrap().len();
        let cluster_size = image.header().cluster_size();
        assert!(len_final <= len_after + 2 * cluster_size);
    }

    #[test]
    fn backing_chain_reads_and_cow() {
        let dir = TempDir::new().unwrap();
        let parent_path = image_path(&dir, "parent.qcow2");
        let child_path = image_path(&dir, "child.qcow2");
        let size = 10 * MIB;

        let mut parent = ImageFactory::cached().create_image(&parent_path, size).unwrap();
        let pattern_05 = [0x05u8; 512];
        let mut offset = 0;
        while offset < size {
            parent.write_at(offset, &pattern_05).unwrap();
            offset += 1024;
        }
        parent.flush().unwrap();
        parent.close().unwrap();
        let parent_bytes_before = std::fs::read(&parent_path).unwrap();

        let mut child = ImageFactory::cached()
            .create_image_with_backing(&child_path, parent_path.to_str().unwrap())
            .unwrap();
        assert_eq!(child.virtual_size(), size);

        // Even 512-blocks come from the parent, odd ones are zero.
        let mut buf = [0u8; 512];
        let mut offset = 0;
        while offset < size {
            child.read_at(offset, &mut buf).unwrap();
            if offset % 1024 == 0 {
                assert_eq!(buf, pattern_05, "offset {offset}");
            } else {
                assert_eq!(buf, [0u8; 512], "offset {offset}");
            }
            offset += 512;
        }

        // Writing the child hides the parent's bytes at those blocks.
        let pattern_13 = [0x13u8; 512];
        let mut offset = 0;
        while offset < size {
            child.write_at(offset, &pattern_13).unwrap();
            offset += 1024;
        }
        let mut offset = 0;
        while offset < size {
            child.read_at(offset, &mut buf).unwrap();
            if offset % 1024 == 0 {
                assert_eq!(buf, pattern_13, "offset {offset}");
            } else {
                assert_eq!(buf, [0u8; 512], "offset {offset}");
            }
            offset += 512;
        }
        child.flush().unwrap();
        child.close().unwrap();

        // The parent file is untouched by child writes.
        let parent_bytes_after = std::fs::read(&parent_path).unwrap();
        assert_eq!(parent_bytes_before, parent_bytes_after);
    }

    #[test]
    fn partial_write_preserves_backing_cluster() {
        let dir = TempDir::new().unwrap();
        let parent_path = image_path(&dir, "parent.qcow2");
        let child_path = image_path(&dir, "child.qcow2");

        let mut parent = ImageFactory::cached().create_image(&parent_path, MIB).unwrap();
        parent.write_at(0, &vec![0x77u8; 65536]).unwrap();
        parent.close().unwrap();

        let mut child = ImageFactory::cached()
            .create_image_with_backing(&child_path, parent_path.to_str().unwrap())
            .unwrap();
        // Overwrite 16 bytes in the middle of the first cluster.
        child.write_at(1000, &[0x99u8; 16]).unwrap();

        let mut buf = vec![0u8; 65536];
        child.read_at(0, &mut buf).unwrap();
        assert!(buf[..1000].iter().all(|&b| b == 0x77));
        assert!(buf[1000..1016].iter().all(|&b| b == 0x99));
        assert!(buf[1016..].iter().all(|&b| b == 0x77));
    }

    #[test]
    fn missing_backing_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let child_path = image_path(&dir, "child.qcow2");
        assert!(matches!(
            ImageFactory::cached().create_image_with_backing(&child_path, "/nonexistent/base.qcow2"),
            Err(Error::BackingFileMissing(_))
        ));
    }
}
