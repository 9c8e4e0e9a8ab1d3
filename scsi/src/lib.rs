// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! SCSI command processing for exported logical units: an SBC-2 / SPC-3
//! subset sufficient for standard operating-system initiators, a logical
//! unit model over pluggable backing stores, and the target / IT-nexus
//! registry.

#[macro_use]
extern crate log;

pub mod backing;
mod inquiry;
mod lun;
mod report_opcodes;
mod sbc;
mod spc;
pub mod target;

use uuid::Uuid;

pub use crate::backing::{BackingStore, NullBackingStore, Qcow2BackingStore};
pub use crate::lun::{LogicalUnit, ModePage, ModePages};
pub use crate::target::{
    ItNexus, LunRepresentation, ScsiTarget, TargetRepresentation, TargetService,
};

/// 512-byte logical blocks.
pub const DEFAULT_BLOCK_SHIFT: u32 = 9;

/// SCSI operation codes dispatched by the logical unit.
pub mod op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const FORMAT_UNIT: u8 = 0x04;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const START_STOP: u8 = 0x1b;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const MODE_SENSE_10: u8 = 0x5a;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8a;
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    pub const WRITE_SAME_16: u8 = 0x93;
    pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
    pub const REPORT_LUNS: u8 = 0xa0;
    pub const MAINTENANCE_IN: u8 = 0xa3;

    // Service actions.
    pub const SA_READ_CAPACITY_16: u8 = 0x10;
    pub const SA_REPORT_SUPPORTED_OPCODES: u8 = 0x0c;
}

/// SAM-3 status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamStat(pub u8);

pub const SAM_STAT_GOOD: SamStat = SamStat(0x00);
pub const SAM_STAT_CHECK_CONDITION: SamStat = SamStat(0x02);
pub const SAM_STAT_BUSY: SamStat = SamStat(0x08);
pub const SAM_STAT_RESERVATION_CONFLICT: SamStat = SamStat(0x18);
pub const SAM_STAT_TASK_ABORTED: SamStat = SamStat(0x40);

/// SPC-3 sense keys.
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
}

/// Additional sense code and qualifier pairs, ASC in the high byte.
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u16 = 0x0000;
    pub const BECOMING_READY: u16 = 0x0401;
    pub const WRITE_ERROR: u16 = 0x0c00;
    pub const READ_ERROR: u16 = 0x1100;
    pub const INVALID_OP_CODE: u16 = 0x2000;
    pub const LBA_OUT_OF_RANGE: u16 = 0x2100;
    pub const INVALID_FIELD_IN_CDB: u16 = 0x2400;
    pub const SAVING_PARMS_UNSUP: u16 = 0x3900;
    pub const MEDIUM_NOT_PRESENT: u16 = 0x3a00;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataDirection {
    None,
    Read,
    Write,
    Bidirectional,
}

/// A data-in or data-out buffer with residual accounting.
#[derive(Clone, Debug, Default)]
pub struct DataBuffer {
    pub buffer: Vec<u8>,
    pub length: u32,
    pub residual: u32,
}

impl DataBuffer {
    pub fn new(length: u32) -> DataBuffer {
        DataBuffer {
            buffer: vec![0u8; length as usize],
            length,
            residual: 0,
        }
    }
}

/// Fixed-format sense data.
#[derive(Clone, Debug, Default)]
pub struct SenseBuffer {
    pub buffer: Vec<u8>,
}

impl SenseBuffer {
    pub fn length(&self) -> u32 {
        self.buffer.len() as u32
    }
}

/// One SCSI command travelling through the target: the CDB plus the transport
/// context it arrived with and the buffers and status it leaves with.
#[derive(Debug)]
pub struct ScsiCommand {
    pub cdb: Vec<u8>,
    pub lun: u8,
    pub tag: u64,
    pub it_nexus_id: Uuid,
    pub direction: DataDirection,

    pub offset: u64,
    pub transfer_length: u64,

    pub in_buffer: Option<DataBuffer>,
    pub out_buffer: Option<DataBuffer>,
    pub sense_buffer: Option<SenseBuffer>,
    /// SAM status byte of the completed command.
    pub result: u8,

    pub rel_target_port_id: u16,
    pub target_port_group_id: u16,
    pub target_port_name: String,
    pub target_name: String,
    /// LUN inventory of the addressed target, for REPORT LUNS.
    pub attached_luns: Vec<u8>,
}

impl ScsiCommand {
    pub fn new(cdb: Vec<u8>, lun: u8, tag: u64) -> ScsiCommand {
        ScsiCommand {
            cdb,
            lun,
            tag,
            it_nexus_id: Uuid::nil(),
            direction: DataDirection::None,
            offset: 0,
            transfer_length: 0,
            in_buffer: None,
            out_buffer: None,
            sense_buffer: None,
            result: 0,
            rel_target_port_id: 0,
            target_port_group_id: 0,
            target_port_name: String::new(),
            target_name: String::new(),
            attached_luns: Vec::new(),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    /// Copies `data` into the data-in buffer, recording the full length as the
    /// residual when it doesn't fit.
    pub(crate) fn fill_in_buffer(&mut self, data: &[u8]) {
        if let Some(in_buffer) = self.in_buffer.as_mut() {
            let n = data.len().min(in_buffer.buffer.len());
            in_buffer.buffer[..n].copy_from_slice(&data[..n]);
            if data.len() > in_buffer.buffer.len() {
                in_buffer.residual = data.len() as u32;
            }
        }
    }
}

/// Builds fixed-format current sense data into the command.
pub fn build_sense_data(cmd: &mut ScsiCommand, key: u8, asc: u16) {
    let sense = vec![
        // Response code: current error, fixed format.
        0x70,
        0x00,
        key,
        0x00,
        0x00,
        0x00,
        0x00,
        // Additional sense length.
        0x0a,
        0x00,
        0x00,
        0x00,
        0x00,
        (asc >> 8) as u8,
        (asc & 0xff) as u8,
        0x00,
        0x00,
        0x00,
        0x00,
    ];
    cmd.sense_buffer = Some(SenseBuffer { buffer: sense });
}

// The logical block address field of a READ/WRITE-family CDB.
pub(crate) fn read_write_lba(cdb: &[u8]) -> u64 {
    match cdb[0] {
        op::READ_16
        | op::WRITE_16
        | op::SYNCHRONIZE_CACHE_16
        | op::WRITE_SAME_16
        | op::SERVICE_ACTION_IN_16 => u64::from_be_bytes(cdb[2..10].try_into().unwrap()),
        _ => u64::from(u32::from_be_bytes(cdb[2..6].try_into().unwrap())),
    }
}

// The transfer length field of a READ/WRITE-family CDB, in blocks.
pub(crate) fn read_write_count(cdb: &[u8]) -> u64 {
    match cdb[0] {
        op::READ_16 | op::WRITE_16 | op::SYNCHRONIZE_CACHE_16 | op::WRITE_SAME_16 => {
            u64::from(u32::from_be_bytes(cdb[10..14].try_into().unwrap()))
        }
        _ => u64::from(u16::from_be_bytes(cdb[7..9].try_into().unwrap())),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::io;
    use std::path::Path;

    use crate::backing::BackingStore;
    use crate::lun::LogicalUnit;

    /// An in-memory backing store for exercising the command layer.
    pub struct MemStore(pub Vec<u8>);

    impl BackingStore for MemStore {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let offset = offset as usize;
            let n = buf.len().min(self.0.len().saturating_sub(offset));
            buf[..n].copy_from_slice(&self.0[offset..offset + n]);
            Ok(n)
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
            let offset = offset as usize;
            let n = data.len().min(self.0.len().saturating_sub(offset));
            self.0[offset..offset + n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }

        fn path(&self) -> Option<&Path> {
            None
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub fn mem_lu(size: u64) -> LogicalUnit {
        LogicalUnit::new(Box::new(MemStore(vec![0u8; size as usize])), 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_data_is_fixed_format() {
        let mut cmd = ScsiCommand::new(vec![0u8; 16], 0, 1);
        build_sense_data(&mut cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_OP_CODE);
        let sense = cmd.sense_buffer.unwrap();
        assert_eq!(sense.length(), 18);
        assert_eq!(sense.buffer[0], 0x70);
        assert_eq!(sense.buffer[2], 0x05);
        assert_eq!(sense.buffer[7], 0x0a);
        assert_eq!(sense.buffer[12], 0x20);
        assert_eq!(sense.buffer[13], 0x00);
    }

    #[test]
    fn cdb_lba_and_count_fields() {
        let mut cdb = vec![0u8; 10];
        cdb[0] = op::READ_10;
        cdb[2..6].copy_from_slice(&0x00ab_cdefu32.to_be_bytes());
        cdb[7..9].copy_from_slice(&0x0102u16.to_be_bytes());
        assert_eq!(read_write_lba(&cdb), 0x00ab_cdef);
        assert_eq!(read_write_count(&cdb), 0x0102);

        let mut cdb = vec![0u8; 16];
        cdb[0] = op::WRITE_16;
        cdb[2..10].copy_from_slice(&0x1234_5678_9abc_def0u64.to_be_bytes());
        cdb[10..14].copy_from_slice(&0x0004_0000u32.to_be_bytes());
        assert_eq!(read_write_lba(&cdb), 0x1234_5678_9abc_def0);
        assert_eq!(read_write_count(&cdb), 0x0004_0000);
    }
}
