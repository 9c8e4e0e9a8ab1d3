// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! REPORT SUPPORTED OPERATION CODES (MAINTENANCE IN, service action 0x0c).

use crate::{
    asc, build_sense_data, op, sense_key, SamStat, ScsiCommand, SAM_STAT_CHECK_CONDITION,
    SAM_STAT_GOOD,
};

const REPORT_ALL: u8 = 0x00;
const REPORT_SINGLE: u8 = 0x01;
const REPORT_SINGLE_SERVICE_ACTION: u8 = 0x02;
const REPORT_SINGLE_EITHER: u8 = 0x03;

// Command timeouts descriptor: no nominal or recommended timeouts.
const TIMEOUTS_DESCRIPTOR: [u8; 12] = [
    0x00, 0x0a, // descriptor length
    0x00, // reserved
    0x00, // command specific
    0x00, 0x00, 0x00, 0x00, // nominal command processing timeout
    0x00, 0x00, 0x00, 0x00, // recommended command timeout
];

struct CommandDescription {
    opcode: u8,
    service_action: u8,
    has_service_action: bool,
    usage: &'static [u8],
}

// CDB usage bitmaps: a set bit marks a field the device server inspects.
const DESCRIPTIONS: &[CommandDescription] = &[
    CommandDescription {
        opcode: op::TEST_UNIT_READY,
        service_action: 0,
        has_service_action: false,
        usage: &[op::TEST_UNIT_READY, 0x00, 0x00, 0x00, 0x00, 0x00],
    },
    CommandDescription {
        opcode: op::REQUEST_SENSE,
        service_action: 0,
        has_service_action: false,
        usage: &[op::REQUEST_SENSE, 0x00, 0x00, 0xff, 0x00, 0x00],
    },
    CommandDescription {
        opcode: op::FORMAT_UNIT,
        service_action: 0,
        has_service_action: false,
        usage: &[op::FORMAT_UNIT, 0x97, 0x00, 0x00, 0x00, 0x00],
    },
    CommandDescription {
        opcode: op::INQUIRY,
        service_action: 0,
        has_service_action: false,
        usage: &[op::INQUIRY, 0x01, 0xff, 0xff, 0xff, 0x00],
    },
    CommandDescription {
        opcode: op::MODE_SENSE_6,
        service_action: 0,
        has_service_action: false,
        usage: &[op::MODE_SENSE_6, 0x08, 0xff, 0xff, 0xff, 0x00],
    },
    CommandDescription {
        opcode: op::START_STOP,
        service_action: 0,
        has_service_action: false,
        usage: &[op::START_STOP, 0x00, 0x00, 0x00, 0x00, 0x00],
    },
    CommandDescription {
        opcode: op::READ_CAPACITY_10,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::READ_CAPACITY_10,
            0x00,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
            0x01,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::READ_10,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::READ_10,
            0xf8,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0xff,
            0xff,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::WRITE_10,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::WRITE_10,
            0xf8,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0xff,
            0xff,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::SYNCHRONIZE_CACHE_10,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::SYNCHRONIZE_CACHE_10,
            0x00,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0xff,
            0xff,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::MODE_SELECT_10,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::MODE_SELECT_10,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::MODE_SENSE_10,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::MODE_SENSE_10,
            0x08,
            0xff,
            0xff,
            0x00,
            0x00,
            0x00,
            0xff,
            0xff,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::READ_16,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::READ_16,
            0xf8,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::WRITE_16,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::WRITE_16,
            0xf8,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::SYNCHRONIZE_CACHE_16,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::SYNCHRONIZE_CACHE_16,
            0x00,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::WRITE_SAME_16,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::WRITE_SAME_16,
            0xfe,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::REPORT_LUNS,
        service_action: 0,
        has_service_action: false,
        usage: &[
            op::REPORT_LUNS,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::SERVICE_ACTION_IN_16,
        service_action: op::SA_READ_CAPACITY_16,
        has_service_action: true,
        usage: &[
            op::SERVICE_ACTION_IN_16,
            0x1f,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
        ],
    },
    CommandDescription {
        opcode: op::MAINTENANCE_IN,
        service_action: op::SA_REPORT_SUPPORTED_OPCODES,
        has_service_action: true,
        usage: &[
            op::MAINTENANCE_IN,
            0x1f,
            0x87,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0xff,
            0x00,
            0x00,
        ],
    },
];

fn report_all(cmd: &mut ScsiCommand, return_timeouts: bool) -> SamStat {
    let mut data = Vec::new();
    let flags = if return_timeouts { 0x02u8 } else { 0x00 };
    for description in DESCRIPTIONS {
        let mut current_flags = flags;
        if description.has_service_action {
            current_flags |= 0x01;
        }
        data.push(description.opcode);
        data.push(0x00); // reserved
        data.push(0x00);
        data.push(description.service_action);
        data.push(0x00); // reserved
        data.push(current_flags);
        data.push(0x00);
        data.push(description.usage.len() as u8);
        if return_timeouts {
            data.extend_from_slice(&TIMEOUTS_DESCRIPTOR);
        }
    }
    let mut response = (data.len() as u32).to_be_bytes().to_vec();
    response.extend_from_slice(&data);
    cmd.fill_in_buffer(&response);
    SAM_STAT_GOOD
}

fn report_single(cmd: &mut ScsiCommand, reporting_options: u8, return_timeouts: bool) -> SamStat {
    let opcode = cmd.cdb[3];
    // Service actions here are all single byte, encoded big-endian in
    // bytes 4..6.
    let service_action = cmd.cdb[5];

    let description = DESCRIPTIONS.iter().find(|d| {
        d.opcode == opcode
            && match reporting_options {
                REPORT_SINGLE_SERVICE_ACTION | REPORT_SINGLE_EITHER => {
                    !d.has_service_action || d.service_action == service_action
                }
                _ => true,
            }
    });
    let description = match description {
        Some(description) => description,
        None => {
            build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
            return SAM_STAT_CHECK_CONDITION;
        }
    };

    match reporting_options {
        REPORT_SINGLE if description.has_service_action => {
            build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
            return SAM_STAT_CHECK_CONDITION;
        }
        REPORT_SINGLE_SERVICE_ACTION if !description.has_service_action => {
            build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
            return SAM_STAT_CHECK_CONDITION;
        }
        _ => {}
    }

    let second_byte = if return_timeouts { 0x80u8 } else { 0x00 };
    let mut response = vec![
        0x00, // reserved
        // CTDP, reserved, CDLP, SUPPORT: supported per the standard.
        second_byte | 0x03,
        0x00,
        description.usage.len() as u8,
    ];
    response.extend_from_slice(description.usage);
    if return_timeouts {
        response.extend_from_slice(&TIMEOUTS_DESCRIPTOR);
    }
    cmd.fill_in_buffer(&response);
    SAM_STAT_GOOD
}

/// The three reporting modes of REPORT SUPPORTED OPERATION CODES.
pub fn report_supported_opcodes(cmd: &mut ScsiCommand) -> SamStat {
    const REPORTING_OPTIONS_MASK: u8 = 0x07;
    const RETURN_TIMEOUTS_DESCRIPTOR: u8 = 0x80;

    let reporting_options = cmd.cdb[2] & REPORTING_OPTIONS_MASK;
    let return_timeouts = cmd.cdb[2] & RETURN_TIMEOUTS_DESCRIPTOR != 0;
    match reporting_options {
        REPORT_ALL => report_all(cmd, return_timeouts),
        REPORT_SINGLE | REPORT_SINGLE_SERVICE_ACTION | REPORT_SINGLE_EITHER => {
            report_single(cmd, reporting_options, return_timeouts)
        }
        _ => {
            error!("unsupported reporting options {reporting_options}");
            if let Some(in_buffer) = cmd.in_buffer.as_mut() {
                in_buffer.residual = 0;
            }
            build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
            SAM_STAT_CHECK_CONDITION
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataBuffer;

    fn opcodes_cmd(options: u8, opcode: u8, service_action: u8) -> ScsiCommand {
        let mut cmd = ScsiCommand::new(vec![0u8; 12], 0, 1);
        cmd.cdb[0] = op::MAINTENANCE_IN;
        cmd.cdb[1] = op::SA_REPORT_SUPPORTED_OPCODES;
        cmd.cdb[2] = options;
        cmd.cdb[3] = opcode;
        cmd.cdb[5] = service_action;
        cmd.cdb[6..10].copy_from_slice(&4096u32.to_be_bytes());
        cmd.in_buffer = Some(DataBuffer::new(4096));
        cmd
    }

    #[test]
    fn report_all_lists_every_command() {
        let mut cmd = opcodes_cmd(REPORT_ALL, 0, 0);
        assert_eq!(report_supported_opcodes(&mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        let length = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
        assert_eq!(length, DESCRIPTIONS.len() * 8);
    }

    #[test]
    fn report_all_with_timeouts_grows_descriptors() {
        let mut cmd = opcodes_cmd(REPORT_ALL | 0x80, 0, 0);
        assert_eq!(report_supported_opcodes(&mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        let length = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
        assert_eq!(length, DESCRIPTIONS.len() * 20);
    }

    #[test]
    fn report_single_returns_usage_map() {
        let mut cmd = opcodes_cmd(REPORT_SINGLE, op::READ_10, 0);
        assert_eq!(report_supported_opcodes(&mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[1] & 0x03, 0x03); // supported
        assert_eq!(data[3], 10); // CDB size
        assert_eq!(data[4], op::READ_10);
    }

    #[test]
    fn report_single_rejects_service_action_commands() {
        let mut cmd = opcodes_cmd(REPORT_SINGLE, op::SERVICE_ACTION_IN_16, 0);
        assert_eq!(report_supported_opcodes(&mut cmd), SAM_STAT_CHECK_CONDITION);
    }

    #[test]
    fn report_single_service_action_finds_read_capacity_16() {
        let mut cmd = opcodes_cmd(
            REPORT_SINGLE_SERVICE_ACTION,
            op::SERVICE_ACTION_IN_16,
            op::SA_READ_CAPACITY_16,
        );
        assert_eq!(report_supported_opcodes(&mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        assert_eq!(data[4], op::SERVICE_ACTION_IN_16);
    }

    #[test]
    fn report_single_service_action_on_plain_command_fails() {
        let mut cmd = opcodes_cmd(REPORT_SINGLE_SERVICE_ACTION, op::READ_10, 0);
        assert_eq!(report_supported_opcodes(&mut cmd), SAM_STAT_CHECK_CONDITION);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut cmd = opcodes_cmd(REPORT_SINGLE, 0xee, 0);
        assert_eq!(report_supported_opcodes(&mut cmd), SAM_STAT_CHECK_CONDITION);
    }
}
