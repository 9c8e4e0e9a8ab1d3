// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! iSCSI PDU parsing and serialization: the 48-byte basic header segment for
//! each opcode, plus the `Key=Value` text codec used during login and text
//! negotiation.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Basic Header Segment size in bytes.
pub const BHS_SIZE: usize = 48;

/// Data segments are padded to 4-byte boundaries.
pub const DATA_PADDING: usize = 4;

const OPCODE_MASK: u8 = 0x3f;
const IMMEDIATE_MASK: u8 = 0x40;

/// All opcodes this target speaks, per RFC 7143.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OpCode {
    #[default]
    NopOut = 0x00,
    ScsiCommand = 0x01,
    ScsiTaskRequest = 0x02,
    LoginRequest = 0x03,
    TextRequest = 0x04,
    ScsiDataOut = 0x05,
    LogoutRequest = 0x06,
    NopIn = 0x20,
    ScsiResponse = 0x21,
    ScsiTaskResponse = 0x22,
    LoginResponse = 0x23,
    TextResponse = 0x24,
    ScsiDataIn = 0x25,
    LogoutResponse = 0x26,
    Ready = 0x31,
    Reject = 0x3f,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<OpCode> {
        Some(match value {
            0x00 => OpCode::NopOut,
            0x01 => OpCode::ScsiCommand,
            0x02 => OpCode::ScsiTaskRequest,
            0x03 => OpCode::LoginRequest,
            0x04 => OpCode::TextRequest,
            0x05 => OpCode::ScsiDataOut,
            0x06 => OpCode::LogoutRequest,
            0x20 => OpCode::NopIn,
            0x21 => OpCode::ScsiResponse,
            0x22 => OpCode::ScsiTaskResponse,
            0x23 => OpCode::LoginResponse,
            0x24 => OpCode::TextResponse,
            0x25 => OpCode::ScsiDataIn,
            0x26 => OpCode::LogoutResponse,
            0x31 => OpCode::Ready,
            0x3f => OpCode::Reject,
            _ => return None,
        })
    }
}

/// iSCSI login stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoginStage {
    #[default]
    SecurityNegotiation,
    LoginOperationalNegotiation,
    FullFeaturePhase,
}

impl LoginStage {
    pub fn from_bits(bits: u8) -> LoginStage {
        match bits {
            0 => LoginStage::SecurityNegotiation,
            1 => LoginStage::LoginOperationalNegotiation,
            _ => LoginStage::FullFeaturePhase,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            LoginStage::SecurityNegotiation => 0,
            LoginStage::LoginOperationalNegotiation => 1,
            LoginStage::FullFeaturePhase => 3,
        }
    }
}

/// Task management functions, from byte 1 of a TMF request.
pub mod tmf {
    pub const ABORT_TASK: u8 = 1;
    pub const ABORT_TASK_SET: u8 = 2;
    pub const CLEAR_ACA: u8 = 3;
    pub const CLEAR_TASK_SET: u8 = 4;
    pub const LOGICAL_UNIT_RESET: u8 = 5;
    pub const TARGET_WARM_RESET: u8 = 6;
    pub const TARGET_COLD_RESET: u8 = 7;
    pub const TASK_REASSIGN: u8 = 8;

    pub const RSP_COMPLETE: u8 = 0x00;
    pub const RSP_NO_TASK: u8 = 0x01;
    pub const RSP_NOT_SUPPORTED: u8 = 0x05;
    pub const RSP_REJECTED: u8 = 0xff;
}

/// Reject PDU reason codes.
pub const REJECT_REASON_PROTOCOL_ERROR: u8 = 0x04;

/// The initiator task tag reserved for unsolicited target NOP-Ins.
pub const RESERVED_TASK_TAG: u32 = 0xffff_ffff;

#[derive(Error, Debug)]
pub enum Error {
    #[error("basic header segment is not {BHS_SIZE} bytes")]
    GarbledHeader,
    #[error("transit and continue bits set in the same request")]
    TransitAndContinue,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One parsed or to-be-serialized PDU. Which fields are meaningful depends on
/// the opcode.
#[derive(Clone, Debug, Default)]
pub struct IscsiCommand {
    pub opcode: OpCode,
    pub immediate: bool,
    pub final_bit: bool,
    pub final_in_seq: bool,
    pub ahs_length: usize,
    pub data_length: usize,
    pub raw_data: Vec<u8>,
    pub task_tag: u32,

    // Sequencing.
    pub cmd_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub stat_sn: u32,
    pub exp_stat_sn: u32,

    // Login.
    pub transit: bool,
    pub continue_bit: bool,
    pub current_stage: LoginStage,
    pub next_stage: LoginStage,
    pub isid: u64,
    pub tsih: u16,
    pub connection_id: u16,
    pub status_class: u8,
    pub status_detail: u8,

    // SCSI command.
    pub read: bool,
    pub write: bool,
    pub lun: u8,
    pub scsi_opcode: u8,
    pub expected_data_length: u32,
    pub cdb: Vec<u8>,
    pub status: u8,
    pub scsi_response: u8,
    pub has_status: bool,
    pub residual: u32,

    // Task management.
    pub task_function: u8,
    pub referenced_task_tag: u32,
    pub tmf_result: u8,

    // R2T.
    pub r2t_sn: u32,
    pub desired_length: u32,

    // Data-In / Data-Out.
    pub data_sn: u32,
    pub buffer_offset: u32,
}

// SCSI opcodes whose data direction is implied even when the initiator left
// the R/W flags unset.
const SCSI_READ_10: u8 = 0x28;
const SCSI_READ_16: u8 = 0x88;
const SCSI_WRITE_10: u8 = 0x2a;
const SCSI_WRITE_16: u8 = 0x8a;

/// Parses a 48-byte basic header segment.
pub fn parse_header(data: &[u8]) -> Result<IscsiCommand> {
    if data.len() != BHS_SIZE {
        return Err(Error::GarbledHeader);
    }
    let opcode =
        OpCode::from_u8(data[0] & OPCODE_MASK).ok_or(Error::UnknownOpcode(data[0] & OPCODE_MASK))?;

    let mut cmd = IscsiCommand {
        opcode,
        immediate: data[0] & IMMEDIATE_MASK != 0,
        final_bit: data[1] & 0x80 != 0,
        ahs_length: data[4] as usize * 4,
        data_length: BigEndian::read_u24(&data[5..8]) as usize,
        task_tag: BigEndian::read_u32(&data[16..20]),
        ..Default::default()
    };

    match opcode {
        OpCode::ScsiCommand => {
            // The LUN field is formatted per SAM-2; with at most 256 units the
            // single-level structure applies and the unit number is byte 9.
            cmd.lun = data[9];
            cmd.expected_data_length = BigEndian::read_u32(&data[20..24]);
            cmd.cmd_sn = BigEndian::read_u32(&data[24..28]);
            cmd.exp_stat_sn = BigEndian::read_u32(&data[28..32]);
            cmd.read = data[1] & 0x40 != 0;
            cmd.write = data[1] & 0x20 != 0;
            cmd.cdb = data[32..48].to_vec();
            cmd.scsi_opcode = cmd.cdb[0];
            match cmd.scsi_opcode {
                SCSI_READ_10 | SCSI_READ_16 => cmd.read = true,
                SCSI_WRITE_10 | SCSI_WRITE_16 => cmd.write = true,
                _ => {}
            }
        }
        OpCode::ScsiTaskRequest => {
            cmd.lun = data[9];
            cmd.task_function = data[1] & 0x7f;
            cmd.referenced_task_tag = BigEndian::read_u32(&data[20..24]);
            cmd.cmd_sn = BigEndian::read_u32(&data[24..28]);
            cmd.exp_stat_sn = BigEndian::read_u32(&data[28..32]);
        }
        OpCode::ScsiDataOut => {
            cmd.lun = data[9];
            cmd.exp_stat_sn = BigEndian::read_u32(&data[28..32]);
            cmd.data_sn = BigEndian::read_u32(&data[36..40]);
            cmd.buffer_offset = BigEndian::read_u32(&data[40..44]);
        }
        OpCode::NopOut => {
            cmd.transit = cmd.final_bit;
            cmd.lun = data[9];
            cmd.cmd_sn = BigEndian::read_u32(&data[24..28]);
            cmd.exp_stat_sn = BigEndian::read_u32(&data[28..32]);
        }
        OpCode::LoginRequest | OpCode::TextRequest | OpCode::LogoutRequest => {
            cmd.transit = cmd.final_bit;
            cmd.continue_bit = data[1] & 0x40 != 0;
            if cmd.continue_bit && cmd.transit {
                // rfc7143 11.12.2
                return Err(Error::TransitAndContinue);
            }
            cmd.current_stage = LoginStage::from_bits((data[1] & 0x0c) >> 2);
            cmd.next_stage = LoginStage::from_bits(data[1] & 0x03);
            cmd.isid = BigEndian::read_u48(&data[8..14]);
            cmd.tsih = BigEndian::read_u16(&data[14..16]);
            cmd.connection_id = BigEndian::read_u16(&data[20..22]);
            cmd.cmd_sn = BigEndian::read_u32(&data[24..28]);
            cmd.exp_stat_sn = BigEndian::read_u32(&data[28..32]);
        }
        _ => {}
    }
    Ok(cmd)
}

/// Rounds `length` up to the 4-byte data segment padding.
pub fn padded_length(length: usize) -> usize {
    length.div_ceil(DATA_PADDING) * DATA_PADDING
}

fn push_padded(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(data);
    let mut padding = data.len();
    while padding % DATA_PADDING != 0 {
        buf.push(0);
        padding += 1;
    }
}

fn data_segment_length(data: &[u8]) -> [u8; 3] {
    let mut bytes = [0u8; 3];
    BigEndian::write_u24(&mut bytes, data.len() as u32);
    bytes
}

impl IscsiCommand {
    /// Serializes a response PDU.
    pub fn bytes(&self) -> Vec<u8> {
        match self.opcode {
            OpCode::LoginResponse => self.login_response_bytes(),
            OpCode::LogoutResponse => self.logout_response_bytes(),
            OpCode::ScsiResponse => self.scsi_response_bytes(),
            OpCode::ScsiDataIn => self.data_in_bytes(),
            OpCode::TextResponse => self.text_response_bytes(),
            OpCode::NopIn => self.noop_in_bytes(),
            OpCode::ScsiTaskResponse => self.tmf_response_bytes(),
            OpCode::Ready => self.r2t_bytes(),
            OpCode::Reject => self.reject_bytes(),
            _ => Vec::new(),
        }
    }

    // rfc7143 11.13
    fn login_response_bytes(&self) -> Vec<u8> {
        let mut stages = 0u8;
        if self.transit {
            stages |= 0x80;
        }
        if self.continue_bit {
            stages |= 0x40;
        }
        stages |= self.current_stage.to_bits() << 2;
        stages |= self.next_stage.to_bits();

        let mut buf = vec![
            OpCode::LoginResponse as u8,
            stages,
            0x00, // version-max
            0x00, // version-active
            0x00, // AHS length
        ];
        buf.extend_from_slice(&data_segment_length(&self.raw_data));
        buf.extend_from_slice(&self.isid.to_be_bytes()[2..8]);
        buf.extend_from_slice(&self.tsih.to_be_bytes());
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.push(self.status_class);
        buf.push(self.status_detail);
        buf.extend_from_slice(&[0u8; 10]);
        push_padded(&mut buf, &self.raw_data);
        buf
    }

    // rfc7143 11.15
    fn logout_response_bytes(&self) -> Vec<u8> {
        let mut buf = vec![
            OpCode::LogoutResponse as u8,
            0x80,
            0x00, // response: connection or session closed successfully
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ];
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        buf
    }

    // rfc7143 11.4
    fn scsi_response_bytes(&self) -> Vec<u8> {
        let mut flags = 0x80u8;
        if self.residual > 0 {
            if self.residual > self.expected_data_length {
                flags |= 0x04; // overflow
            } else {
                flags |= 0x02; // underflow
            }
        }
        let mut buf = vec![
            OpCode::ScsiResponse as u8,
            flags,
            self.scsi_response,
            self.status,
            0x00,
        ];
        buf.extend_from_slice(&data_segment_length(&self.raw_data));
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.residual.to_be_bytes());
        push_padded(&mut buf, &self.raw_data);
        buf
    }

    // rfc7143 11.7. Emits the segment selected by buffer_offset/data_length
    // out of raw_data.
    fn data_in_bytes(&self) -> Vec<u8> {
        let data_length = self.data_length;
        let mut buf = Vec::with_capacity(BHS_SIZE + padded_length(data_length));
        buf.push(OpCode::ScsiDataIn as u8);
        let mut flags = 0u8;
        if self.final_in_seq || self.final_bit {
            flags |= 0x80;
        }
        if self.has_status && self.final_bit {
            flags |= 0x01;
        }
        if self.residual > 0 {
            if self.residual > self.expected_data_length {
                flags |= 0x04;
            } else if self.residual < self.expected_data_length {
                flags |= 0x02;
            }
        }
        buf.push(flags);
        buf.push(0x00);
        buf.push(if self.has_status && self.final_bit {
            self.status
        } else {
            0x00
        });
        buf.push(0x00); // AHS length
        let mut dlen = [0u8; 3];
        BigEndian::write_u24(&mut dlen, data_length as u32);
        buf.extend_from_slice(&dlen);
        buf.extend_from_slice(&[0u8; 8]); // LUN, A bit not set
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&RESERVED_TASK_TAG.to_be_bytes());
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.data_sn.to_be_bytes());
        buf.extend_from_slice(&self.buffer_offset.to_be_bytes());
        buf.extend_from_slice(&self.residual.to_be_bytes());
        let start = self.buffer_offset as usize;
        push_padded(&mut buf, &self.raw_data[start..start + data_length]);
        buf
    }

    // rfc7143 11.11
    fn text_response_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.final_bit {
            flags |= 0x80;
        }
        if self.continue_bit {
            flags |= 0x40;
        }
        let mut buf = vec![OpCode::TextResponse as u8, flags, 0x00, 0x00, 0x00];
        buf.extend_from_slice(&data_segment_length(&self.raw_data));
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&RESERVED_TASK_TAG.to_be_bytes());
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        push_padded(&mut buf, &self.raw_data);
        buf
    }

    // rfc7143 11.12
    fn noop_in_bytes(&self) -> Vec<u8> {
        let mut buf = vec![OpCode::NopIn as u8, 0x80, 0x00, 0x00, 0x00];
        buf.extend_from_slice(&data_segment_length(&self.raw_data));
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&RESERVED_TASK_TAG.to_be_bytes());
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        push_padded(&mut buf, &self.raw_data);
        buf
    }

    // rfc7143 11.6
    fn tmf_response_bytes(&self) -> Vec<u8> {
        let mut buf = vec![
            OpCode::ScsiTaskResponse as u8,
            0x80,
            self.tmf_result,
            0x00,
        ];
        buf.extend_from_slice(&[0u8; 12]);
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        buf
    }

    // rfc7143 11.8
    fn r2t_bytes(&self) -> Vec<u8> {
        let mut buf = vec![OpCode::Ready as u8, 0x80, 0x00, 0x00];
        buf.extend_from_slice(&[0u8; 12]);
        buf.extend_from_slice(&self.task_tag.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]); // target transfer tag
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.r2t_sn.to_be_bytes());
        buf.extend_from_slice(&self.buffer_offset.to_be_bytes());
        buf.extend_from_slice(&self.desired_length.to_be_bytes());
        buf
    }

    // rfc7143 11.17. Carries the rejected header as the data segment.
    fn reject_bytes(&self) -> Vec<u8> {
        let mut buf = vec![
            OpCode::Reject as u8,
            0x80,
            REJECT_REASON_PROTOCOL_ERROR,
            0x00,
            0x00,
        ];
        buf.extend_from_slice(&data_segment_length(&self.raw_data));
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&RESERVED_TASK_TAG.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.stat_sn.to_be_bytes());
        buf.extend_from_slice(&self.exp_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.max_cmd_sn.to_be_bytes());
        buf.extend_from_slice(&self.data_sn.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        push_padded(&mut buf, &self.raw_data);
        buf
    }
}

/// Parses a zero-separated `Key=Value` data segment.
pub fn parse_key_values(data: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(chunk);
        if let Some((key, value)) = text.split_once('=') {
            pairs.push((key.to_string(), value.to_string()));
        }
    }
    pairs
}

/// Serializes `Key=Value` pairs, each zero-terminated.
pub fn serialize_key_values(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scsi_command_header() -> [u8; 48] {
        let mut bhs = [0u8; 48];
        bhs[0] = 0x01;
        bhs[1] = 0x80 | 0x40; // final, read
        bhs[9] = 3; // lun
        BigEndian::write_u32(&mut bhs[20..24], 4096);
        BigEndian::write_u32(&mut bhs[24..28], 9); // CmdSN
        BigEndian::write_u32(&mut bhs[28..32], 5); // ExpStatSN
        BigEndian::write_u32(&mut bhs[16..20], 0xabcd); // ITT
        bhs[32] = 0x28; // READ(10)
        bhs
    }

    #[test]
    fn parses_scsi_command() {
        let cmd = parse_header(&scsi_command_header()).unwrap();
        assert_eq!(cmd.opcode, OpCode::ScsiCommand);
        assert!(cmd.read);
        assert!(!cmd.write);
        assert!(cmd.final_bit);
        assert_eq!(cmd.lun, 3);
        assert_eq!(cmd.expected_data_length, 4096);
        assert_eq!(cmd.cmd_sn, 9);
        assert_eq!(cmd.exp_stat_sn, 5);
        assert_eq!(cmd.task_tag, 0xabcd);
        assert_eq!(cmd.scsi_opcode, 0x28);
        assert_eq!(cmd.cdb.len(), 16);
    }

    #[test]
    fn write_opcode_forces_write_direction() {
        let mut bhs = scsi_command_header();
        bhs[1] = 0x80;
        bhs[32] = 0x2a; // WRITE(10)
        let cmd = parse_header(&bhs).unwrap();
        assert!(cmd.write);
        assert!(!cmd.read);
    }

    #[test]
    fn rejects_transit_and_continue() {
        let mut bhs = [0u8; 48];
        bhs[0] = 0x03;
        bhs[1] = 0x80 | 0x40;
        assert!(matches!(
            parse_header(&bhs),
            Err(Error::TransitAndContinue)
        ));
    }

    #[test]
    fn rejects_short_header() {
        assert!(matches!(parse_header(&[0u8; 20]), Err(Error::GarbledHeader)));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bhs = [0u8; 48];
        bhs[0] = 0x1e;
        assert!(matches!(
            parse_header(&bhs),
            Err(Error::UnknownOpcode(0x1e))
        ));
    }

    #[test]
    fn parses_login_request() {
        let mut bhs = [0u8; 48];
        bhs[0] = 0x03 | 0x40;
        bhs[1] = 0x80 | 0x07; // transit, CSG operational, NSG full feature
        bhs[8..14].copy_from_slice(&[0x00, 0x02, 0x3d, 0x00, 0x00, 0x01]);
        BigEndian::write_u16(&mut bhs[14..16], 0);
        BigEndian::write_u16(&mut bhs[20..22], 7);
        BigEndian::write_u32(&mut bhs[24..28], 1);
        let cmd = parse_header(&bhs).unwrap();
        assert_eq!(cmd.opcode, OpCode::LoginRequest);
        assert!(cmd.immediate);
        assert!(cmd.transit);
        assert_eq!(cmd.current_stage, LoginStage::LoginOperationalNegotiation);
        assert_eq!(cmd.next_stage, LoginStage::FullFeaturePhase);
        assert_eq!(cmd.isid, 0x00023d000001);
        assert_eq!(cmd.tsih, 0);
        assert_eq!(cmd.connection_id, 7);
    }

    #[test]
    fn login_response_layout() {
        let response = IscsiCommand {
            opcode: OpCode::LoginResponse,
            transit: true,
            current_stage: LoginStage::LoginOperationalNegotiation,
            next_stage: LoginStage::FullFeaturePhase,
            isid: 0x00023d000001,
            tsih: 5,
            task_tag: 0x11223344,
            stat_sn: 1,
            exp_cmd_sn: 2,
            max_cmd_sn: 130,
            raw_data: b"TargetPortalGroupTag=1\0".to_vec(),
            ..Default::default()
        };
        let bytes = response.bytes();
        assert_eq!(bytes[0], 0x23);
        assert_eq!(bytes[1], 0x87);
        assert_eq!(BigEndian::read_u24(&bytes[5..8]), 23);
        assert_eq!(&bytes[8..14], &[0x00, 0x02, 0x3d, 0x00, 0x00, 0x01]);
        assert_eq!(BigEndian::read_u16(&bytes[14..16]), 5);
        assert_eq!(BigEndian::read_u32(&bytes[16..20]), 0x11223344);
        assert_eq!(BigEndian::read_u32(&bytes[24..28]), 1);
        assert_eq!(BigEndian::read_u32(&bytes[28..32]), 2);
        assert_eq!(BigEndian::read_u32(&bytes[32..36]), 130);
        assert_eq!(bytes[36], 0); // status class: success
        // Data segment padded to 4 bytes.
        assert_eq!(bytes.len(), 48 + 24);
    }

    #[test]
    fn data_in_slices_payload_by_offset() {
        let mut payload = vec![0u8; 1024];
        payload[512] = 0x7e;
        let response = IscsiCommand {
            opcode: OpCode::ScsiDataIn,
            raw_data: payload,
            buffer_offset: 512,
            data_length: 512,
            final_bit: true,
            has_status: true,
            ..Default::default()
        };
        let bytes = response.bytes();
        assert_eq!(bytes.len(), 48 + 512);
        assert_eq!(bytes[1] & 0x80, 0x80); // final
        assert_eq!(bytes[1] & 0x01, 0x01); // status present
        assert_eq!(BigEndian::read_u32(&bytes[40..44]), 512); // buffer offset
        assert_eq!(bytes[48], 0x7e);
    }

    #[test]
    fn r2t_layout() {
        let response = IscsiCommand {
            opcode: OpCode::Ready,
            task_tag: 9,
            r2t_sn: 0,
            buffer_offset: 4096,
            desired_length: 8192,
            stat_sn: 3,
            exp_cmd_sn: 7,
            max_cmd_sn: 135,
            ..Default::default()
        };
        let bytes = response.bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(bytes[0], 0x31);
        assert_eq!(BigEndian::read_u32(&bytes[16..20]), 9);
        assert_eq!(BigEndian::read_u32(&bytes[36..40]), 0);
        assert_eq!(BigEndian::read_u32(&bytes[40..44]), 4096);
        assert_eq!(BigEndian::read_u32(&bytes[44..48]), 8192);
    }

    #[test]
    fn key_value_round_trip() {
        let pairs = vec![
            ("InitiatorName".to_string(), "iqn.1993-08.org.debian:01:c0ffee".to_string()),
            ("SessionType".to_string(), "Normal".to_string()),
        ];
        let data = serialize_key_values(&pairs);
        assert_eq!(parse_key_values(&data), pairs);
    }
}
