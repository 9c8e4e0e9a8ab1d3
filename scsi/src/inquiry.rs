// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! INQUIRY: standard data and the vital product data pages.

use crate::lun::LogicalUnit;
use crate::{
    asc, build_sense_data, sense_key, SamStat, ScsiCommand, SAM_STAT_CHECK_CONDITION,
    SAM_STAT_GOOD,
};

const PROTOCOL_IDENTIFIER_ISCSI: u8 = 0x05;
const VERSION_SPC3: u8 = 0x05;

// Code sets for identification descriptors.
const CODE_SET_BINARY: u8 = 1;
const CODE_SET_ASCII: u8 = 2;
const CODE_SET_UTF8: u8 = 3;

// Association field values.
const ASSOCIATED_LOGICAL_UNIT: u8 = 0x00;
const ASSOCIATED_TARGET_PORT: u8 = 0x01;

// Designator types.
const DESIGNATOR_VENDOR: u8 = 0;
const DESIGNATOR_NAA: u8 = 3;
const DESIGNATOR_REL_TARGET_PORT: u8 = 4;
const DESIGNATOR_TARGET_PORT_GROUP: u8 = 5;
const DESIGNATOR_SCSI_NAME: u8 = 8;

const NAA_LOCAL: u64 = 0x3;

const PERIPHERAL_QUALIFIER_NOT_CONNECTED: u8 = 0x01 << 5;

const PAGE_SUPPORTED_VPD_PAGES: u8 = 0x00;
const PAGE_UNIT_SERIAL_NUMBER: u8 = 0x80;
const PAGE_DEVICE_IDENTIFICATION: u8 = 0x83;
const PAGE_BLOCK_LIMITS: u8 = 0xb0;
const PAGE_BLOCK_DEVICE_CHARACTERISTICS: u8 = 0xb1;
const PAGE_BLOCK_PROVISIONING: u8 = 0xb2;

fn peripheral_byte(device: &LogicalUnit) -> u8 {
    let qualifier = if device.attrs.online {
        0
    } else {
        PERIPHERAL_QUALIFIER_NOT_CONNECTED
    };
    qualifier | device.attrs.device_type
}

fn supported_vpd_pages(device: &LogicalUnit) -> Vec<u8> {
    vec![
        peripheral_byte(device),
        PAGE_SUPPORTED_VPD_PAGES,
        0x00,
        0x06, // page length
        PAGE_SUPPORTED_VPD_PAGES,
        PAGE_UNIT_SERIAL_NUMBER,
        PAGE_DEVICE_IDENTIFICATION,
        PAGE_BLOCK_LIMITS,
        PAGE_BLOCK_DEVICE_CHARACTERISTICS,
        PAGE_BLOCK_PROVISIONING,
    ]
}

fn unit_serial_number(device: &LogicalUnit) -> Vec<u8> {
    let serial = format!("qcow2target-{:<36}", device.uuid);
    let mut page = vec![
        peripheral_byte(device),
        PAGE_UNIT_SERIAL_NUMBER,
        0x00,
        serial.len() as u8,
    ];
    page.extend_from_slice(serial.as_bytes());
    page
}

fn protocol_and_code_set(code_set: u8) -> u8 {
    (PROTOCOL_IDENTIFIER_ISCSI << 4) | code_set
}

fn association_and_designator(association: u8, designator_type: u8) -> u8 {
    0x80 | (association << 4) | designator_type
}

fn device_identification(device: &LogicalUnit, cmd: &ScsiCommand) -> Vec<u8> {
    // T10 vendor descriptor carrying the target name.
    let target_name = cmd.target_name.as_bytes();
    let mut vendor_descriptor = vec![
        protocol_and_code_set(CODE_SET_ASCII),
        association_and_designator(ASSOCIATED_TARGET_PORT, DESIGNATOR_VENDOR),
        0x00,
        target_name.len() as u8,
    ];
    vendor_descriptor.extend_from_slice(target_name);

    // NAA IEEE Registered, locally assigned, carrying the LU uuid.
    let naa = device.uuid | (NAA_LOCAL << 60);
    let mut naa_descriptor = vec![
        protocol_and_code_set(CODE_SET_BINARY),
        association_and_designator(ASSOCIATED_LOGICAL_UNIT, DESIGNATOR_NAA),
        0x00,
        0x08,
    ];
    naa_descriptor.extend_from_slice(&naa.to_be_bytes());

    let target_port_group_descriptor = [
        protocol_and_code_set(CODE_SET_BINARY),
        association_and_designator(ASSOCIATED_TARGET_PORT, DESIGNATOR_TARGET_PORT_GROUP),
        0x00,
        0x04,
        0x00,
        0x00,
        (cmd.target_port_group_id >> 8) as u8,
        cmd.target_port_group_id as u8,
    ];
    let relative_port_descriptor = [
        protocol_and_code_set(CODE_SET_BINARY),
        association_and_designator(ASSOCIATED_TARGET_PORT, DESIGNATOR_REL_TARGET_PORT),
        0x00,
        0x04,
        0x00,
        0x00,
        (cmd.rel_target_port_id >> 8) as u8,
        cmd.rel_target_port_id as u8,
    ];

    // SCSI name string, 4-byte aligned, NUL padded.
    let mut port_name = cmd.target_port_name.clone().into_bytes();
    port_name.truncate(256);
    while port_name.len() % 4 != 0 {
        port_name.push(0);
    }
    let mut scsi_name_descriptor = vec![
        protocol_and_code_set(CODE_SET_UTF8),
        association_and_designator(ASSOCIATED_TARGET_PORT, DESIGNATOR_SCSI_NAME),
        0x00,
        port_name.len() as u8,
    ];
    scsi_name_descriptor.extend_from_slice(&port_name);

    let page_length = vendor_descriptor.len()
        + naa_descriptor.len()
        + target_port_group_descriptor.len()
        + relative_port_descriptor.len()
        + scsi_name_descriptor.len();

    let mut page = vec![
        peripheral_byte(device),
        PAGE_DEVICE_IDENTIFICATION,
        (page_length >> 8) as u8,
        page_length as u8,
    ];
    page.extend_from_slice(&vendor_descriptor);
    page.extend_from_slice(&naa_descriptor);
    page.extend_from_slice(&target_port_group_descriptor);
    page.extend_from_slice(&relative_port_descriptor);
    page.extend_from_slice(&scsi_name_descriptor);
    page
}

fn block_limits(device: &LogicalUnit) -> Vec<u8> {
    let mut page = vec![peripheral_byte(device), PAGE_BLOCK_LIMITS, 0x00, 0x3c];
    page.extend_from_slice(&[0u8; 0x3c]);
    page
}

fn block_device_characteristics(device: &LogicalUnit) -> Vec<u8> {
    let mut page = vec![
        peripheral_byte(device),
        PAGE_BLOCK_DEVICE_CHARACTERISTICS,
        0x00,
        0x3c,
        // Medium rotation rate: non-rotating medium.
        0x00,
        0x01,
    ];
    page.extend_from_slice(&[0u8; 0x3a]);
    page
}

fn block_provisioning(device: &LogicalUnit) -> Vec<u8> {
    vec![
        peripheral_byte(device),
        PAGE_BLOCK_PROVISIONING,
        0x00,
        0x04, // page length
        0x00, // threshold exponent
        0x00, // LBPU | LBPWS | LBPWS10 | LBPRZ | ANC_SUP | DP
        0x00, // minimum percentage, provisioning type
        0x00,
    ]
}

fn standard_inquiry(device: &LogicalUnit) -> Vec<u8> {
    const TPGS_IMPLICIT: u8 = 0x10;
    const HISUP: u8 = 0x10;
    const STANDARD_FORMAT: u8 = 0x02;
    const CMDQUE: u8 = 0x02;

    let mut variadic = vec![TPGS_IMPLICIT, 0x00, CMDQUE];
    variadic.extend_from_slice(format!("{:<8}", device.attrs.vendor_id).as_bytes());
    variadic.extend_from_slice(format!("{:<16}", device.attrs.product_id).as_bytes());
    variadic.extend_from_slice(format!("{:<4}", device.attrs.product_rev).as_bytes());
    // Vendor specific, reserved and obsolete bytes.
    variadic.extend_from_slice(&[0u8; 22]);
    variadic.extend_from_slice(&device.attrs.version_desc);

    let mut data = vec![
        peripheral_byte(device),
        0x00, // not removable
        VERSION_SPC3,
        HISUP | STANDARD_FORMAT,
        variadic.len() as u8,
    ];
    data.extend_from_slice(&variadic);
    data
}

/// INQUIRY dispatch: standard data or a VPD page.
pub fn inquiry(device: &mut LogicalUnit, cmd: &mut ScsiCommand) -> SamStat {
    const ENABLE_VPD: u8 = 0x01;

    let enable_vpd = cmd.cdb[1] & ENABLE_VPD != 0;
    let page_code = cmd.cdb[2];
    let allocation_length = u16::from_be_bytes(cmd.cdb[3..5].try_into().unwrap()) as usize;

    if enable_vpd {
        let data = match page_code {
            PAGE_SUPPORTED_VPD_PAGES => supported_vpd_pages(device),
            PAGE_UNIT_SERIAL_NUMBER => unit_serial_number(device),
            PAGE_DEVICE_IDENTIFICATION => device_identification(device, cmd),
            PAGE_BLOCK_LIMITS => block_limits(device),
            PAGE_BLOCK_DEVICE_CHARACTERISTICS => block_device_characteristics(device),
            PAGE_BLOCK_PROVISIONING => block_provisioning(device),
            _ => {
                build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
                return SAM_STAT_CHECK_CONDITION;
            }
        };
        if allocation_length < data.len() {
            let truncated = data[..allocation_length].to_vec();
            cmd.fill_in_buffer(&truncated);
            if let Some(in_buffer) = cmd.in_buffer.as_mut() {
                in_buffer.residual = data.len() as u32;
            }
        } else {
            cmd.fill_in_buffer(&data);
        }
        return SAM_STAT_GOOD;
    }

    // A page code without EVPD is invalid.
    if page_code != 0 {
        build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        return SAM_STAT_CHECK_CONDITION;
    }
    let data = standard_inquiry(device);
    if allocation_length < data.len() {
        let truncated = data[..allocation_length].to_vec();
        cmd.fill_in_buffer(&truncated);
        if let Some(in_buffer) = cmd.in_buffer.as_mut() {
            in_buffer.residual = allocation_length as u32;
        }
    } else {
        cmd.fill_in_buffer(&data);
        if let Some(in_buffer) = cmd.in_buffer.as_mut() {
            in_buffer.residual = data.len() as u32;
        }
    }
    SAM_STAT_GOOD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::mem_lu;
    use crate::{op, DataBuffer};

    fn inquiry_cmd(evpd: bool, page: u8) -> ScsiCommand {
        let mut cmd = ScsiCommand::new(vec![0u8; 6], 0, 1);
        cmd.cdb[0] = op::INQUIRY;
        cmd.cdb[1] = u8::from(evpd);
        cmd.cdb[2] = page;
        cmd.cdb[3..5].copy_from_slice(&255u16.to_be_bytes());
        cmd.in_buffer = Some(DataBuffer::new(255));
        cmd.target_name = "iqn.2020-11.io.cloudhypervisor.qcow2:disk0".to_string();
        cmd.target_port_name = "iqn.2020-11.io.cloudhypervisor.qcow2:disk0".to_string();
        cmd.target_port_group_id = 1;
        cmd.rel_target_port_id = 1;
        cmd
    }

    #[test]
    fn standard_inquiry_reports_disk() {
        let mut lu = mem_lu(1 << 20);
        let mut cmd = inquiry_cmd(false, 0);
        assert_eq!(inquiry(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[0], 0x00); // connected disk
        assert_eq!(data[2], VERSION_SPC3);
        assert_eq!(&data[8..16], b"QCOW2T  ");
        assert_eq!(&data[16..32], b"QCOW2TARGET     ");
    }

    #[test]
    fn standard_inquiry_with_page_code_is_rejected() {
        let mut lu = mem_lu(1 << 20);
        let mut cmd = inquiry_cmd(false, 0x80);
        assert_eq!(inquiry(&mut lu, &mut cmd), SAM_STAT_CHECK_CONDITION);
    }

    #[test]
    fn supported_vpd_page_lists_all_pages() {
        let mut lu = mem_lu(1 << 20);
        let mut cmd = inquiry_cmd(true, PAGE_SUPPORTED_VPD_PAGES);
        assert_eq!(inquiry(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[1], 0x00);
        assert_eq!(data[3], 6);
        assert_eq!(&data[4..10], &[0x00, 0x80, 0x83, 0xb0, 0xb1, 0xb2]);
    }

    #[test]
    fn device_identification_has_five_descriptors() {
        let mut lu = mem_lu(1 << 20);
        let mut cmd = inquiry_cmd(true, PAGE_DEVICE_IDENTIFICATION);
        assert_eq!(inquiry(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = cmd.in_buffer.as_ref().unwrap().buffer.clone();
        assert_eq!(data[1], 0x83);
        let page_length = usize::from(u16::from_be_bytes(data[2..4].try_into().unwrap()));

        let mut descriptor_types = Vec::new();
        let mut offset = 4;
        while offset < 4 + page_length {
            descriptor_types.push(data[offset + 1] & 0x0f);
            let len = data[offset + 3] as usize;
            offset += 4 + len;
        }
        assert_eq!(
            descriptor_types,
            vec![
                DESIGNATOR_VENDOR,
                DESIGNATOR_NAA,
                DESIGNATOR_TARGET_PORT_GROUP,
                DESIGNATOR_REL_TARGET_PORT,
                DESIGNATOR_SCSI_NAME
            ]
        );
    }

    #[test]
    fn naa_descriptor_carries_local_authority_and_uuid() {
        let mut lu = mem_lu(1 << 20);
        lu.uuid = 1234;
        let mut cmd = inquiry_cmd(true, PAGE_DEVICE_IDENTIFICATION);
        assert_eq!(inquiry(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        // Skip header and the vendor descriptor to reach the NAA one.
        let vendor_len = data[7] as usize;
        let naa = &data[4 + 4 + vendor_len..];
        assert_eq!(naa[1] & 0x0f, DESIGNATOR_NAA);
        let value = u64::from_be_bytes(naa[4..12].try_into().unwrap());
        assert_eq!(value >> 60, NAA_LOCAL);
        assert_eq!(value & 0x0fff_ffff_ffff_ffff, 1234);
    }

    #[test]
    fn block_provisioning_page_has_own_code() {
        let mut lu = mem_lu(1 << 20);
        let mut cmd = inquiry_cmd(true, PAGE_BLOCK_PROVISIONING);
        assert_eq!(inquiry(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[1], PAGE_BLOCK_PROVISIONING);
    }

    #[test]
    fn offline_lu_reports_not_connected() {
        let mut lu = crate::lun::LogicalUnit::lun0();
        let mut cmd = inquiry_cmd(false, 0);
        assert_eq!(inquiry(&mut lu, &mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[0] >> 5, 0x01);
        assert_eq!(data[0] & 0x1f, crate::lun::TYPE_UNKNOWN);
    }
}
