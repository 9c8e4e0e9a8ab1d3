// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! SPC-3 primary command processing.

use crate::lun::LogicalUnit;
use crate::{
    asc, build_sense_data, sense_key, SamStat, ScsiCommand, SenseBuffer, SAM_STAT_CHECK_CONDITION,
    SAM_STAT_GOOD,
};

/// TEST UNIT READY.
pub fn test_unit_ready(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    if device.attrs.online {
        return SAM_STAT_GOOD;
    }
    build_sense_data(cmd, sense_key::NOT_READY, asc::BECOMING_READY);
    SAM_STAT_CHECK_CONDITION
}

/// REQUEST SENSE: returns the current sense data and installs a fresh empty
/// buffer, so the next REQUEST SENSE reports NO SENSE.
pub fn request_sense(cmd: &mut ScsiCommand) -> SamStat {
    let mut allocation_length = u32::from(cmd.cdb[4]);
    if let Some(in_buffer) = cmd.in_buffer.as_ref() {
        allocation_length = allocation_length.min(in_buffer.length);
    }
    build_sense_data(cmd, sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE);
    // The buffer was installed right above.
    let sense = cmd.sense_buffer.take().unwrap();
    let actual_length = sense.length().min(allocation_length) as usize;
    let data = sense.buffer[..actual_length].to_vec();
    cmd.fill_in_buffer(&data);
    if let Some(in_buffer) = cmd.in_buffer.as_mut() {
        in_buffer.residual = actual_length as u32;
    }
    cmd.sense_buffer = Some(SenseBuffer::default());
    SAM_STAT_GOOD
}

// Shared MODE SENSE(6)/(10) parameter decode and response assembly.
pub fn mode_sense(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    const DISABLE_BLOCK_DESCRIPTORS: u8 = 0x08;
    const PAGE_CODE_MASK: u8 = 0x3f;
    const PAGE_CONTROL_MASK: u8 = 0xc0;

    let ten_byte = cmd.cdb.len() >= 10 && cmd.cdb[0] == crate::op::MODE_SENSE_10;
    let disable_block_descriptors = cmd.cdb[1] & DISABLE_BLOCK_DESCRIPTORS != 0;
    let page_code = cmd.cdb[2] & PAGE_CODE_MASK;
    let page_control = (cmd.cdb[2] & PAGE_CONTROL_MASK) >> 6;
    let subpage_code = cmd.cdb[3];
    let allocation_length = if ten_byte {
        u32::from(u16::from_be_bytes(cmd.cdb[7..9].try_into().unwrap()))
    } else {
        u32::from(cmd.cdb[4])
    };

    // Saved values are not supported.
    if page_control == 3 {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::SAVING_PARMS_UNSUP);
        return SAM_STAT_CHECK_CONDITION;
    }

    let block_descriptor: &[u8] = if disable_block_descriptors {
        &[]
    } else {
        &device.mode_block_descriptor
    };

    let pages = match device
        .mode_pages
        .to_bytes(page_code, subpage_code, page_control)
    {
        Some(pages) => pages,
        None => {
            build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
            return SAM_STAT_CHECK_CONDITION;
        }
    };

    // DPOFUA is reported set: reads always come from the medium.
    const DEVICE_SPECIFIC: u8 = 0x10;
    let mut response = Vec::with_capacity(8 + block_descriptor.len() + pages.len());
    if ten_byte {
        let mode_data_length = pages.len() as u16;
        response.extend_from_slice(&mode_data_length.to_be_bytes());
        response.push(0x00); // medium type
        response.push(DEVICE_SPECIFIC);
        response.extend_from_slice(&[0x00, 0x00]);
        response.extend_from_slice(&(block_descriptor.len() as u16).to_be_bytes());
    } else {
        response.push(pages.len() as u8);
        response.push(0x00); // medium type
        response.push(DEVICE_SPECIFIC);
        response.push(block_descriptor.len() as u8);
    }
    response.extend_from_slice(block_descriptor);
    response.extend_from_slice(&pages);

    if response.len() as u32 > allocation_length {
        if let Some(in_buffer) = cmd.in_buffer.as_mut() {
            in_buffer.residual = allocation_length;
        }
        response.truncate(allocation_length as usize);
    }
    cmd.fill_in_buffer(&response);
    SAM_STAT_GOOD
}

/// REPORT LUNS: the inventory of attached logical units, with the implicit
/// LUN 0 entry when nothing is attached there.
pub fn report_luns(cmd: &mut ScsiCommand) -> SamStat {
    let allocation_length = u32::from_be_bytes(cmd.cdb[6..10].try_into().unwrap());
    if allocation_length < 16 {
        warn!("REPORT LUNS allocation length {allocation_length} is below 16");
        if let Some(in_buffer) = cmd.in_buffer.as_mut() {
            in_buffer.residual = 0;
        }
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }

    let has_lun0 = cmd.attached_luns.contains(&0);
    let mut lun_count = cmd.attached_luns.len();
    if !has_lun0 {
        lun_count += 1;
    }
    let available_length = (lun_count * 8) as u32;

    let mut response = Vec::with_capacity(8 + lun_count * 8);
    response.extend_from_slice(&available_length.to_be_bytes());
    response.extend_from_slice(&[0u8; 4]);

    let mut remaining = allocation_length.saturating_sub(8);
    if !has_lun0 && remaining >= 8 {
        response.extend_from_slice(&[0u8; 8]);
        remaining -= 8;
    }
    for &lun in &cmd.attached_luns {
        if remaining < 8 {
            break;
        }
        // Single level LUN structure: address method and bus identifier zero.
        response.extend_from_slice(&[0x00, lun, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        remaining -= 8;
    }

    if let Some(in_buffer) = cmd.in_buffer.as_mut() {
        in_buffer.residual = allocation_length;
    }
    cmd.fill_in_buffer(&response);
    SAM_STAT_GOOD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{op, DataBuffer};

    fn offline_lu() -> LogicalUnit {
        LogicalUnit::lun0()
    }

    fn online_lu() -> LogicalUnit {
        crate::test_util::mem_lu(1 << 20)
    }

    #[test]
    fn test_unit_ready_offline_is_not_ready() {
        let mut lu = offline_lu();
        let mut cmd = ScsiCommand::new(vec![0u8; 6], 0, 1);
        assert_eq!(test_unit_ready(&mut lu, &mut cmd), SAM_STAT_CHECK_CONDITION);
        let sense = cmd.sense_buffer.unwrap();
        assert_eq!(sense.buffer[2], sense_key::NOT_READY);
    }

    #[test]
    fn request_sense_resets_to_no_sense() {
        let mut cmd = ScsiCommand::new(vec![op::REQUEST_SENSE, 0, 0, 0, 18, 0], 0, 1);
        cmd.in_buffer = Some(DataBuffer::new(18));
        build_sense_data(&mut cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_OP_CODE);
        assert_eq!(request_sense(&mut cmd), SAM_STAT_GOOD);
        // The served data reports NO SENSE and the stored buffer is empty.
        assert_eq!(cmd.in_buffer.as_ref().unwrap().buffer[2], 0x00);
        assert_eq!(cmd.sense_buffer.as_ref().unwrap().length(), 0);
    }

    #[test]
    fn mode_sense_6_includes_block_descriptor() {
        let mut lu = online_lu();
        let mut cmd = ScsiCommand::new(vec![op::MODE_SENSE_6, 0, 0x3f, 0, 0xff, 0], 0, 1);
        cmd.in_buffer = Some(DataBuffer::new(255));
        assert_eq!(mode_sense(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[2], 0x10); // DPOFUA
        assert_eq!(data[3], 8); // block descriptor length
        // Block count then block length in the descriptor.
        assert_eq!(
            u32::from_be_bytes(data[4..8].try_into().unwrap()),
            (1 << 20) >> 9
        );
        assert_eq!(u32::from_be_bytes(data[8..12].try_into().unwrap()), 512);
    }

    #[test]
    fn mode_sense_10_single_page() {
        let mut lu = online_lu();
        let mut cmd =
            ScsiCommand::new(vec![op::MODE_SENSE_10, 0, 0x08, 0, 0, 0, 0, 0, 0xff, 0], 0, 1);
        cmd.in_buffer = Some(DataBuffer::new(255));
        assert_eq!(mode_sense(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[7], 8); // block descriptor length
        assert_eq!(data[16], 0x08); // caching page follows the descriptor
    }

    #[test]
    fn mode_sense_rejects_saved_values() {
        let mut lu = online_lu();
        let mut cmd = ScsiCommand::new(vec![op::MODE_SENSE_6, 0, 0xc8, 0, 0xff, 0], 0, 1);
        cmd.in_buffer = Some(DataBuffer::new(255));
        assert_eq!(mode_sense(&mut lu, &mut cmd), SAM_STAT_CHECK_CONDITION);
        assert_eq!(cmd.sense_buffer.unwrap().buffer[12], 0x39);
    }

    #[test]
    fn report_luns_includes_implicit_lun0() {
        let mut cmd = ScsiCommand::new(vec![0u8; 12], 0, 1);
        cmd.cdb[0] = op::REPORT_LUNS;
        cmd.cdb[6..10].copy_from_slice(&256u32.to_be_bytes());
        cmd.in_buffer = Some(DataBuffer::new(256));
        cmd.attached_luns = vec![2, 5];
        assert_eq!(report_luns(&mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        // Three entries: implicit 0 plus LUNs 2 and 5.
        assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 24);
        assert_eq!(data[9], 0);
        assert_eq!(data[17], 2);
        assert_eq!(data[25], 5);
    }

    #[test]
    fn report_luns_rejects_short_allocation() {
        let mut cmd = ScsiCommand::new(vec![0u8; 12], 0, 1);
        cmd.cdb[0] = op::REPORT_LUNS;
        cmd.cdb[6..10].copy_from_slice(&8u32.to_be_bytes());
        cmd.in_buffer = Some(DataBuffer::new(8));
        assert_eq!(report_luns(&mut cmd), SAM_STAT_CHECK_CONDITION);
    }
}
