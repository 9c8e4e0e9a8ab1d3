// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Backing stores a logical unit can sit on.

use std::io;
use std::path::{Path, PathBuf};

use qcow2::{ImageFactory, ImageFile};

/// The storage a logical unit reads from and writes to.
pub trait BackingStore: Send {
    /// Reads into `buf` at `offset`, returning how many bytes were read.
    /// Ranges beyond the end of the store are truncated.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `data` at `offset`, returning how many bytes were written.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;

    /// Commits all pending writes to stable storage.
    fn sync(&mut self) -> io::Result<()>;

    /// Size of the store in bytes.
    fn size(&self) -> u64;

    /// The path the store was opened from, if any.
    fn path(&self) -> Option<&Path>;

    fn close(&mut self) -> io::Result<()>;
}

/// A logical unit backed by a writable QCOW2 image.
pub struct Qcow2BackingStore {
    image: ImageFile,
    path: PathBuf,
}

impl Qcow2BackingStore {
    pub fn open(factory: &ImageFactory, disk_path: &Path) -> qcow2::Result<Qcow2BackingStore> {
        let image = factory.open_image(disk_path, false)?;
        Ok(Qcow2BackingStore {
            path: image.path().to_path_buf(),
            image,
        })
    }
}

impl BackingStore for Qcow2BackingStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.image.read_at(offset, buf).map_err(io::Error::other)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.image.write_at(offset, data).map_err(io::Error::other)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.image.flush().map_err(io::Error::other)
    }

    fn size(&self) -> u64 {
        self.image.virtual_size()
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn close(&mut self) -> io::Result<()> {
        self.image.close().map_err(io::Error::other)
    }
}

/// The placeholder store behind the well-known LUN 0 device when no logical
/// unit is attached there. Zero-sized and never readable.
#[derive(Default)]
pub struct NullBackingStore;

impl BackingStore for NullBackingStore {
    fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write_at(&mut self, _offset: u64, _data: &[u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        0
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
