// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use vmm_sys_util::write_zeroes::WriteZeroesAt;

/// Returned by every mutating operation invoked on a read-only file.
pub(crate) fn write_to_read_only() -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        "write access to a read-only image",
    )
}

/// A qcow file. Allows reading/writing clusters and appending clusters.
#[derive(Debug)]
pub struct QcowRawFile {
    file: File,
    cluster_size: u64,
    cluster_mask: u64,
    read_only: bool,
}

impl QcowRawFile {
    /// Creates a `QcowRawFile` from the given `File`. `None` is returned if `cluster_size` is not
    /// a power of two.
    pub fn from(file: File, cluster_size: u64, read_only: bool) -> Option<Self> {
        if !cluster_size.is_power_of_two() {
            return None;
        }
        Some(QcowRawFile {
            file,
            cluster_size,
            cluster_mask: cluster_size - 1,
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the current length of the file in bytes.
    pub fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    /// Reads `buf.len()` bytes at the absolute `offset`.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    /// Writes all of `buf` at the absolute `offset`.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        self.file.write_all_at(buf, offset)
    }

    pub fn read_u16_at(&mut self, offset: u64) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u64_at(&mut self, offset: u64) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn write_u16_at(&mut self, value: u16, offset: u64) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        self.file.write_all_at(&value.to_be_bytes(), offset)
    }

    pub fn write_u64_at(&mut self, value: u64, offset: u64) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        self.file.write_all_at(&value.to_be_bytes(), offset)
    }

    /// Reads `count` 64 bit offsets at `offset` and returns them as a vector.
    /// `mask` optionally `&`s out some of the bits on the file.
    pub fn read_pointer_table(
        &mut self,
        offset: u64,
        count: u64,
        mask: Option<u64>,
    ) -> io::Result<Vec<u64>> {
        let mut buf = vec![0u8; count as usize * 8];
        self.file.read_exact_at(&mut buf, offset)?;
        let mut table = vec![0u64; count as usize];
        BigEndian::read_u64_into(&buf, &mut table);
        if let Some(m) = mask {
            for ptr in &mut table {
                *ptr &= m;
            }
        }
        Ok(table)
    }

    /// Reads a cluster's worth of 64 bit offsets and returns them as a vector.
    /// `mask` optionally `&`s out some of the bits on the file.
    pub fn read_pointer_cluster(&mut self, offset: u64, mask: Option<u64>) -> io::Result<Vec<u64>> {
        let count = self.cluster_size / size_of::<u64>() as u64;
        self.read_pointer_table(offset, count, mask)
    }

    /// Writes a pointer table to `offset` in the file.
    /// `non_zero_flags` will be OR'd with all non-zero entries before writing.
    pub fn write_pointer_table(
        &mut self,
        offset: u64,
        table: &[u64],
        non_zero_flags: u64,
    ) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        let mut buf = Vec::with_capacity(table.len() * 8);
        for &addr in table {
            let entry = if addr == 0 { 0 } else { addr | non_zero_flags };
            buf.write_u64::<BigEndian>(entry)?;
        }
        self.file.write_all_at(&buf, offset)
    }

    /// Reads a refcount block from the file, one cluster's worth of 16 bit counts.
    pub fn read_refcount_block(&mut self, offset: u64) -> io::Result<Vec<u16>> {
        let count = self.cluster_size as usize / size_of::<u16>();
        let mut buf = vec![0u8; count * 2];
        self.file.read_exact_at(&mut buf, offset)?;
        let mut table = vec![0u16; count];
        BigEndian::read_u16_into(&buf, &mut table);
        Ok(table)
    }

    /// Writes a refcount block to the file.
    pub fn write_refcount_block(&mut self, offset: u64, table: &[u16]) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        let mut buf = Vec::with_capacity(table.len() * 2);
        for &count in table {
            buf.write_u16::<BigEndian>(count)?;
        }
        self.file.write_all_at(&buf, offset)
    }

    /// Allocates a new cluster at the end of the current file, returning its address.
    /// The file is padded out and truncated to the next cluster boundary.
    pub fn allocate_cluster_at_file_end(
        &mut self,
        max_valid_cluster_offset: u64,
    ) -> io::Result<Option<u64>> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        let file_end = self.file.seek(SeekFrom::End(0))?;
        let new_cluster_address = (file_end + self.cluster_size - 1) & !self.cluster_mask;
        if new_cluster_address > max_valid_cluster_offset {
            return Ok(None);
        }
        self.file.set_len(new_cluster_address + self.cluster_size)?;
        Ok(Some(new_cluster_address))
    }

    /// Zeroes out a cluster in the file.
    pub fn zero_cluster(&mut self, address: u64) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        let cluster_size = self.cluster_size as usize;
        self.file.write_all_zeroes_at(address, cluster_size)?;
        Ok(())
    }

    /// Fills the cluster at `address` with the first cluster's worth of `data`.
    pub fn write_cluster(&mut self, address: u64, data: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        let cluster_size = self.cluster_size as usize;
        if data.len() < cluster_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "initial cluster data is smaller than the cluster size",
            ));
        }
        self.file.write_all_at(&data[..cluster_size], address)
    }

    /// Returns the size of the file's clusters.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Returns the offset of `address` within a cluster.
    pub fn cluster_offset(&self, address: u64) -> u64 {
        address & self.cluster_mask
    }

    /// Returns the base address of the cluster containing `address`.
    pub fn cluster_address(&self, address: u64) -> u64 {
        address & !self.cluster_mask
    }

    /// Limits `count` so that it doesn't overflow the end of a cluster.
    pub fn limit_range_cluster(&self, address: u64, count: u64) -> u64 {
        let offset = self.cluster_offset(address);
        let limit = self.cluster_size - offset;
        count.min(limit)
    }

    pub fn sync_all(&mut self) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        self.file.sync_all()
    }

    pub fn sync_data(&mut self) -> io::Result<()> {
        if self.read_only {
            return Err(write_to_read_only());
        }
        self.file.sync_data()
    }

    /// Returns a mutable reference to the underlying file.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}
