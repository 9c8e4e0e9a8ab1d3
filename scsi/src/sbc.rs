// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! SBC-2 block command processing.

use crate::lun::LogicalUnit;
use crate::{
    asc, build_sense_data, read_write_count, read_write_lba, sense_key, SamStat, ScsiCommand,
    SAM_STAT_CHECK_CONDITION, SAM_STAT_GOOD, SAM_STAT_RESERVATION_CONFLICT,
};

// Checks a CDB's LBA and transfer length against the device capacity.
fn validate_offset_length(
    transfer_length: u64,
    logical_block_address: u64,
    device_size_in_blocks: u64,
) -> bool {
    if transfer_length != 0 {
        match logical_block_address.checked_add(transfer_length) {
            Some(end) if end <= device_size_in_blocks => true,
            _ => {
                warn!(
                    "lba out of range: lba {logical_block_address}, \
                     tl {transfer_length}, size {device_size_in_blocks}"
                );
                false
            }
        }
    } else if logical_block_address >= device_size_in_blocks {
        warn!("lba out of range: lba {logical_block_address}, size {device_size_in_blocks}");
        false
    } else {
        true
    }
}

// Resolves the CDB's block range into cmd.offset / cmd.transfer_length,
// answering with LBA OUT OF RANGE sense when it doesn't fit.
fn resolve_range(device: &LogicalUnit, cmd: &mut ScsiCommand) -> bool {
    let logical_block_address = read_write_lba(&cmd.cdb);
    let transfer_length = read_write_count(&cmd.cdb);
    let device_size_in_blocks = device.size >> device.block_shift;
    if !validate_offset_length(transfer_length, logical_block_address, device_size_in_blocks) {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE);
        return false;
    }
    cmd.offset = logical_block_address << device.block_shift;
    cmd.transfer_length = transfer_length << device.block_shift;
    true
}

/// MODE SELECT(10) accepts and ignores all parameter data.
pub fn mode_select() -> SamStat {
    SAM_STAT_GOOD
}

/// FORMAT UNIT. The medium is already "formatted"; only the unsupported
/// options are rejected.
pub fn format_unit(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    const FORMAT_PROTECTION_INFORMATION: u8 = 0x80;
    const FORMAT_DATA: u8 = 0x10;
    const DEFECT_LIST_FORMAT: u8 = 0x07;

    if device.reserve(cmd).is_err() {
        return SAM_STAT_RESERVATION_CONFLICT;
    }
    if !device.attrs.online {
        build_sense_data(cmd, sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT);
        return SAM_STAT_CHECK_CONDITION;
    }
    if cmd.cdb[1] & (FORMAT_PROTECTION_INFORMATION | FORMAT_DATA | DEFECT_LIST_FORMAT) != 0 {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }
    SAM_STAT_GOOD
}

/// START STOP UNIT. Nothing to spin up or down.
pub fn start_stop(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    if device.reserve(cmd).is_err() {
        return SAM_STAT_RESERVATION_CONFLICT;
    }
    if let Some(in_buffer) = cmd.in_buffer.as_mut() {
        in_buffer.residual = 0;
    }
    SAM_STAT_GOOD
}

/// READ(10) / READ(16).
pub fn read(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    const READ_PROTECT: u8 = 0xe0;
    if cmd.cdb[1] & READ_PROTECT != 0 {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }
    if !resolve_range(device, cmd) {
        return SAM_STAT_CHECK_CONDITION;
    }

    let length = cmd.transfer_length as usize;
    let mut data = vec![0u8; length];
    match device.backing.read_at(cmd.offset, &mut data) {
        Ok(_) => {
            cmd.fill_in_buffer(&data);
            SAM_STAT_GOOD
        }
        Err(e) => {
            error!("read error at offset {}: {e}", cmd.offset);
            build_sense_data(cmd, sense_key::MEDIUM_ERROR, asc::READ_ERROR);
            SAM_STAT_CHECK_CONDITION
        }
    }
}

/// WRITE(10) / WRITE(16).
pub fn write(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    const WRITE_PROTECT: u8 = 0xe0;
    if cmd.cdb[1] & WRITE_PROTECT != 0 {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }
    if !resolve_range(device, cmd) {
        return SAM_STAT_CHECK_CONDITION;
    }

    let length = cmd.transfer_length as usize;
    let data = match cmd.out_buffer.as_ref() {
        Some(out_buffer) => &out_buffer.buffer[..length.min(out_buffer.buffer.len())],
        None => &[][..],
    };
    match device.backing.write_at(cmd.offset, data) {
        Ok(_) => SAM_STAT_GOOD,
        Err(e) => {
            error!("write error at offset {}: {e}", cmd.offset);
            build_sense_data(cmd, sense_key::MEDIUM_ERROR, asc::WRITE_ERROR);
            SAM_STAT_CHECK_CONDITION
        }
    }
}

/// WRITE SAME(16): repeats the single block of out data over the range.
pub fn write_same_16(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    const ANCHOR: u8 = 0x10;
    const UNMAP: u8 = 0x08;
    const WRITE_PROTECT: u8 = 0xe0;
    const LB_DATA: u8 = 0x04;
    const PB_DATA: u8 = 0x02;

    // No resource provisioning, no unmap, no protection information.
    if cmd.cdb[1] & (ANCHOR | UNMAP | WRITE_PROTECT) != 0 {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }
    // LBDATA and PBDATA cannot both be set.
    if cmd.cdb[1] & (LB_DATA | PB_DATA) == (LB_DATA | PB_DATA) {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }
    if !resolve_range(device, cmd) {
        return SAM_STAT_CHECK_CONDITION;
    }

    let block_size = 1usize << device.block_shift;
    let block = match cmd.out_buffer.as_ref() {
        Some(out_buffer) if out_buffer.buffer.len() >= block_size => {
            out_buffer.buffer[..block_size].to_vec()
        }
        _ => {
            build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
            return SAM_STAT_CHECK_CONDITION;
        }
    };

    let mut offset = cmd.offset;
    let end = cmd.offset + cmd.transfer_length;
    while offset < end {
        if let Err(e) = device.backing.write_at(offset, &block) {
            error!("write error at offset {offset}: {e}");
            build_sense_data(cmd, sense_key::MEDIUM_ERROR, asc::WRITE_ERROR);
            return SAM_STAT_CHECK_CONDITION;
        }
        offset += block_size as u64;
    }
    SAM_STAT_GOOD
}

/// READ CAPACITY(10): last LBA capped at 32 bits, plus the block size.
pub fn read_capacity_10(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    let size = device.size >> device.block_shift;

    // The obsolete LBA field must be zero unless PMI is set.
    if cmd.cdb[8] & 0x1 == 0 && (cmd.cdb[2] | cmd.cdb[3] | cmd.cdb[4] | cmd.cdb[5]) != 0 {
        if let Some(in_buffer) = cmd.in_buffer.as_mut() {
            in_buffer.residual = 0;
        }
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }

    if let Some(in_buffer) = cmd.in_buffer.as_ref() {
        if in_buffer.length < 8 {
            if let Some(in_buffer) = cmd.in_buffer.as_mut() {
                in_buffer.residual = 8;
            }
            return SAM_STAT_GOOD;
        }
    }

    let last_lba: u32 = if size >> 32 != 0 {
        u32::MAX
    } else {
        (size - 1) as u32
    };
    let mut data = last_lba.to_be_bytes().to_vec();
    data.extend_from_slice(&(1u32 << device.block_shift).to_be_bytes());
    cmd.fill_in_buffer(&data);
    SAM_STAT_GOOD
}

/// READ CAPACITY(16): full 64-bit last LBA, block size, physical block
/// exponent and lowest aligned LBA.
pub fn read_capacity_16(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    let size = device.size >> device.block_shift;
    let allocation_length = u32::from_be_bytes(cmd.cdb[10..14].try_into().unwrap());

    let mut data = (size.saturating_sub(1)).to_be_bytes().to_vec();
    if allocation_length > 12 {
        data.extend_from_slice(&(1u32 << device.block_shift).to_be_bytes());
        if allocation_length > 16 {
            let val = (device.attrs.logical_blocks_per_physical_block_exponent << 16)
                | device.attrs.lowest_aligned_lba;
            data.extend_from_slice(&val.to_be_bytes());
        }
    }
    cmd.fill_in_buffer(&data);
    SAM_STAT_GOOD
}

/// SYNCHRONIZE CACHE(10) / (16).
pub fn sync_cache(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    let logical_block_address = read_write_lba(&cmd.cdb);
    let number_of_blocks = read_write_count(&cmd.cdb);
    cmd.offset = logical_block_address << device.block_shift;
    cmd.transfer_length = number_of_blocks << device.block_shift;

    match device.backing.sync() {
        Ok(()) => SAM_STAT_GOOD,
        Err(e) => {
            error!("sync error: {e}");
            build_sense_data(cmd, sense_key::MEDIUM_ERROR, asc::WRITE_ERROR);
            SAM_STAT_CHECK_CONDITION
        }
    }
}
