// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Login negotiation: the session key table with converters, defaults, and
//! bounds, plus the security-phase and operational-phase processing.

use thiserror::Error;

use crate::pdu::{parse_key_values, IscsiCommand, LoginStage};

pub const DIGEST_NONE: u32 = 1 << 0;
pub const DIGEST_CRC32C: u32 = 1 << 1;
pub const DIGEST_ALL: u32 = DIGEST_NONE | DIGEST_CRC32C;

pub const MAX_QUEUE_CMD_DEF: u32 = 128;
const MAX_QUEUE_CMD_MIN: u32 = 1;
const MAX_QUEUE_CMD_MAX: u32 = 512;

pub const MAX_BURST_LENGTH: u32 = 262144;
pub const MAX_RECV_DATA_SEGMENT_LENGTH: u32 = 65536;

/// Indexes into the session parameter value table.
pub mod param {
    pub const MAX_RECV_DATA_SEGMENT_LENGTH: usize = 0;
    pub const HEADER_DIGEST: usize = 1;
    pub const DATA_DIGEST: usize = 2;
    pub const INITIAL_R2T: usize = 3;
    pub const MAX_OUTSTANDING_R2T: usize = 4;
    pub const IMMEDIATE_DATA: usize = 5;
    pub const FIRST_BURST_LENGTH: usize = 6;
    pub const MAX_BURST_LENGTH: usize = 7;
    pub const DATA_PDU_IN_ORDER: usize = 8;
    pub const DATA_SEQUENCE_IN_ORDER: usize = 9;
    pub const ERROR_RECOVERY_LEVEL: usize = 10;
    pub const IF_MARKER: usize = 11;
    pub const OF_MARKER: usize = 12;
    pub const DEFAULT_TIME2WAIT: usize = 13;
    pub const DEFAULT_TIME2RETAIN: usize = 14;
    pub const OF_MARK_INT: usize = 15;
    pub const IF_MARK_INT: usize = 16;
    pub const MAX_CONNECTIONS: usize = 17;
    pub const RDMA_EXTENSIONS: usize = 18;
    pub const TARGET_RECV_DATA_SEGMENT_LENGTH: usize = 19;
    pub const INITIATOR_RECV_DATA_SEGMENT_LENGTH: usize = 20;
    pub const MAX_OUTSTANDING_UNEXPECTED_PDUS: usize = 21;
    // "Local" parameters, never sent to the initiator. The initiator's
    // MaxRecvDataSegmentLength is remembered here as our transmit limit.
    pub const MAX_XMIT_DATA_SEGMENT_LENGTH: usize = 22;
    pub const MAX_QUEUE_CMD: usize = 23;

    pub const COUNT: usize = 24;
}

#[derive(Clone, Copy, Debug)]
pub enum KeyConv {
    Number,
    Boolean,
    Digest,
}

/// One negotiable key: its converter, default, bounds, and whether the target
/// imposes its default ("constant" keys).
pub struct SessionKeyDef {
    pub name: &'static str,
    pub idx: usize,
    pub constant: bool,
    pub def: u32,
    pub min: u32,
    pub max: u32,
    pub conv: KeyConv,
}

// The defaults are the RFC 7143 defaults; constant keys are the ones this
// target imposes rather than negotiates.
pub const SESSION_KEYS: &[SessionKeyDef] = &[
    SessionKeyDef {
        name: "MaxRecvDataSegmentLength",
        idx: param::MAX_RECV_DATA_SEGMENT_LENGTH,
        constant: true,
        def: MAX_RECV_DATA_SEGMENT_LENGTH,
        min: 512,
        max: 16777215,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "HeaderDigest",
        idx: param::HEADER_DIGEST,
        constant: false,
        def: DIGEST_NONE,
        min: DIGEST_NONE,
        max: DIGEST_ALL,
        conv: KeyConv::Digest,
    },
    SessionKeyDef {
        name: "DataDigest",
        idx: param::DATA_DIGEST,
        constant: false,
        def: DIGEST_NONE,
        min: DIGEST_NONE,
        max: DIGEST_ALL,
        conv: KeyConv::Digest,
    },
    SessionKeyDef {
        name: "InitialR2T",
        idx: param::INITIAL_R2T,
        constant: true,
        def: 1,
        min: 0,
        max: 1,
        conv: KeyConv::Boolean,
    },
    SessionKeyDef {
        name: "MaxOutstandingR2T",
        idx: param::MAX_OUTSTANDING_R2T,
        constant: true,
        def: 1,
        min: 1,
        max: 65535,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "ImmediateData",
        idx: param::IMMEDIATE_DATA,
        constant: true,
        def: 1,
        min: 0,
        max: 1,
        conv: KeyConv::Boolean,
    },
    SessionKeyDef {
        name: "FirstBurstLength",
        idx: param::FIRST_BURST_LENGTH,
        constant: true,
        def: 65536,
        min: 512,
        max: 16777215,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "MaxBurstLength",
        idx: param::MAX_BURST_LENGTH,
        constant: true,
        def: MAX_BURST_LENGTH,
        min: 512,
        max: 16777215,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "DataPDUInOrder",
        idx: param::DATA_PDU_IN_ORDER,
        constant: true,
        def: 1,
        min: 0,
        max: 1,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "DataSequenceInOrder",
        idx: param::DATA_SEQUENCE_IN_ORDER,
        constant: true,
        def: 1,
        min: 0,
        max: 1,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "ErrorRecoveryLevel",
        idx: param::ERROR_RECOVERY_LEVEL,
        constant: true,
        def: 0,
        min: 0,
        max: 2,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "IFMarker",
        idx: param::IF_MARKER,
        constant: true,
        def: 0,
        min: 0,
        max: 1,
        conv: KeyConv::Boolean,
    },
    SessionKeyDef {
        name: "OFMarker",
        idx: param::OF_MARKER,
        constant: true,
        def: 0,
        min: 0,
        max: 1,
        conv: KeyConv::Boolean,
    },
    SessionKeyDef {
        name: "DefaultTime2Wait",
        idx: param::DEFAULT_TIME2WAIT,
        constant: true,
        def: 2,
        min: 0,
        max: 3600,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "DefaultTime2Retain",
        idx: param::DEFAULT_TIME2RETAIN,
        constant: false,
        def: 20,
        min: 0,
        max: 3600,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "OFMarkInt",
        idx: param::OF_MARK_INT,
        constant: true,
        def: 2048,
        min: 1,
        max: 65535,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "IFMarkInt",
        idx: param::IF_MARK_INT,
        constant: true,
        def: 2048,
        min: 1,
        max: 65535,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "MaxConnections",
        idx: param::MAX_CONNECTIONS,
        constant: true,
        def: 1,
        min: 1,
        max: 65535,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "RDMAExtensions",
        idx: param::RDMA_EXTENSIONS,
        constant: true,
        def: 0,
        min: 0,
        max: 1,
        conv: KeyConv::Boolean,
    },
    SessionKeyDef {
        name: "TargetRecvDataSegmentLength",
        idx: param::TARGET_RECV_DATA_SEGMENT_LENGTH,
        constant: true,
        def: 8192,
        min: 512,
        max: 16777215,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "InitiatorRecvDataSegmentLength",
        idx: param::INITIATOR_RECV_DATA_SEGMENT_LENGTH,
        constant: true,
        def: 8192,
        min: 512,
        max: 16777215,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "MaxOutstandingUnexpectedPDUs",
        idx: param::MAX_OUTSTANDING_UNEXPECTED_PDUS,
        constant: true,
        def: 0,
        min: 2,
        max: 4294967295,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "MaxXmitDataSegmentLength",
        idx: param::MAX_XMIT_DATA_SEGMENT_LENGTH,
        constant: true,
        def: 8192,
        min: 512,
        max: 16777215,
        conv: KeyConv::Number,
    },
    SessionKeyDef {
        name: "MaxQueueCmd",
        idx: param::MAX_QUEUE_CMD,
        constant: true,
        def: MAX_QUEUE_CMD_DEF,
        min: MAX_QUEUE_CMD_MIN,
        max: MAX_QUEUE_CMD_MAX,
        conv: KeyConv::Number,
    },
];

/// Default session parameter value table, indexed by `param::*`.
pub fn default_session_params() -> Vec<u32> {
    let mut values = vec![0u32; param::COUNT];
    for key in SESSION_KEYS {
        values[key.idx] = key.def;
    }
    values
}

fn find_key(name: &str) -> Option<&'static SessionKeyDef> {
    SESSION_KEYS.iter().find(|key| key.name == name)
}

fn convert_value(conv: KeyConv, value: &str) -> Option<u32> {
    match conv {
        KeyConv::Number => value.parse().ok(),
        KeyConv::Boolean => {
            if value.eq_ignore_ascii_case("yes") {
                Some(1)
            } else if value.eq_ignore_ascii_case("no") {
                Some(0)
            } else {
                None
            }
        }
        KeyConv::Digest => {
            let mut crc = 0;
            for part in value.split(',') {
                if part.eq_ignore_ascii_case("crc32c") {
                    crc |= DIGEST_CRC32C;
                } else if part.eq_ignore_ascii_case("none") {
                    crc |= DIGEST_NONE;
                } else {
                    return None;
                }
            }
            Some(crc)
        }
    }
}

fn unconvert_value(conv: KeyConv, value: u32) -> String {
    match conv {
        KeyConv::Number => value.to_string(),
        KeyConv::Boolean => {
            if value == 0 {
                "No".to_string()
            } else {
                "Yes".to_string()
            }
        }
        KeyConv::Digest => match value {
            DIGEST_NONE => "None".to_string(),
            DIGEST_CRC32C => "CRC32C".to_string(),
            DIGEST_ALL => "None,CRC32C".to_string(),
            _ => String::new(),
        },
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("initiator requested AuthMethod {0}, only None is supported")]
    AuthMethodUnsupported(String),
    #[error("unknown negotiation key {0}={1}")]
    UnknownKey(String, String),
    #[error("cannot transit: CSG={0:?}, NSG={1:?}, transit={2}")]
    CannotTransit(LoginStage, LoginStage, bool),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionType {
    #[default]
    Normal,
    Discovery,
}

/// Everything learned during a connection's login phase.
#[derive(Debug)]
pub struct LoginParams {
    pub initialized: bool,

    pub ini_csg: LoginStage,
    pub ini_nsg: LoginStage,
    pub ini_transit: bool,
    pub ini_continue: bool,

    pub tgt_csg: LoginStage,
    pub tgt_nsg: LoginStage,
    pub tgt_transit: bool,

    pub session_type: SessionType,
    pub session_params: Vec<u32>,
    pub keys_declared: bool,

    pub initiator: String,
    pub initiator_alias: String,
    pub target_name: String,

    pub tpgt: u16,
    pub isid: u64,
    pub tsih: u16,
}

impl Default for LoginParams {
    fn default() -> LoginParams {
        LoginParams {
            initialized: false,
            ini_csg: LoginStage::SecurityNegotiation,
            ini_nsg: LoginStage::SecurityNegotiation,
            ini_transit: false,
            ini_continue: false,
            tgt_csg: LoginStage::LoginOperationalNegotiation,
            tgt_nsg: LoginStage::LoginOperationalNegotiation,
            tgt_transit: false,
            session_type: SessionType::Normal,
            session_params: default_session_params(),
            keys_declared: false,
            initiator: String::new(),
            initiator_alias: String::new(),
            target_name: String::new(),
            tpgt: 0,
            isid: 0,
            tsih: 0,
        }
    }
}

impl LoginParams {
    pub fn value(&self, idx: usize) -> u32 {
        self.session_params[idx]
    }

    /// Security negotiation: only `AuthMethod=None` is accepted.
    pub fn process_security_data(&mut self, request: &IscsiCommand) -> Result<()> {
        for (key, value) in parse_key_values(&request.raw_data) {
            match key.as_str() {
                "AuthMethod" => {
                    if !value.split(',').any(|method| method == "None") {
                        return Err(Error::AuthMethodUnsupported(value));
                    }
                    self.tgt_nsg = LoginStage::LoginOperationalNegotiation;
                    self.tgt_transit = true;
                }
                "TargetName" => self.target_name = value,
                "InitiatorName" => self.initiator = value,
                _ => {}
            }
        }
        Ok(())
    }

    /// Operational negotiation: walks the initiator's keys through the key
    /// table, clamping and echoing per the constant flag and bounds, and
    /// decides whether the target transits to full feature phase.
    pub fn process_login_data(
        &mut self,
        request: &IscsiCommand,
    ) -> Result<Vec<(String, String)>> {
        let mut negotiated: Vec<(String, String)> = Vec::new();
        let mut kv_changes = 0;

        for (key, value) in parse_key_values(&request.raw_data) {
            match key.as_str() {
                // The initiator's receive limit is our transmit limit.
                "MaxRecvDataSegmentLength" => {
                    let def = find_key("MaxXmitDataSegmentLength").unwrap();
                    if let Some(converted) = convert_value(def.conv, &value) {
                        self.session_params[def.idx] = converted;
                    }
                    continue;
                }
                "InitiatorName" => {
                    self.initiator = value;
                    continue;
                }
                "InitiatorAlias" => {
                    self.initiator_alias = value;
                    continue;
                }
                "TargetName" => {
                    self.target_name = value;
                    continue;
                }
                "SessionType" => {
                    self.session_type = if value == "Normal" {
                        SessionType::Normal
                    } else {
                        SessionType::Discovery
                    };
                    continue;
                }
                _ => {}
            }

            let def = match find_key(&key) {
                Some(def) => def,
                None => return Err(Error::UnknownKey(key, value)),
            };
            let mut converted = match convert_value(def.conv, &value) {
                Some(converted) => converted,
                None => continue,
            };
            // CRC32C is tolerated in the offer but coerced to None.
            if def.idx == param::HEADER_DIGEST || def.idx == param::DATA_DIGEST {
                if converted == DIGEST_ALL {
                    converted = DIGEST_NONE;
                }
            }
            if def.constant {
                // The key cannot be changed; answer with the target default.
                if converted != def.def {
                    kv_changes += 1;
                }
                negotiated.push((key, unconvert_value(def.conv, def.def)));
            } else if (def.min..=def.max).contains(&converted) {
                self.session_params[def.idx] = converted;
                negotiated.push((key, unconvert_value(def.conv, converted)));
            } else {
                // Out of the acceptable range; answer with the target default.
                negotiated.push((key, unconvert_value(def.conv, def.def)));
                kv_changes += 1;
            }
        }

        if kv_changes == 0 {
            if self.ini_nsg == LoginStage::FullFeaturePhase && self.ini_transit {
                self.tgt_nsg = LoginStage::FullFeaturePhase;
                self.tgt_transit = true;
            } else {
                return Err(Error::CannotTransit(
                    self.ini_csg,
                    self.ini_nsg,
                    self.ini_transit,
                ));
            }
        } else {
            self.tgt_nsg = LoginStage::FullFeaturePhase;
            self.tgt_transit = true;
        }
        Ok(negotiated)
    }

    /// Keys the target declares unprompted on the first operational response.
    pub fn declared_keys(&self) -> Vec<(String, String)> {
        vec![
            ("TargetPortalGroupTag".to_string(), self.tpgt.to_string()),
            (
                "MaxRecvDataSegmentLength".to_string(),
                MAX_RECV_DATA_SEGMENT_LENGTH.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::serialize_key_values;

    fn login_request(pairs: &[(&str, &str)], transit: bool) -> IscsiCommand {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IscsiCommand {
            opcode: crate::pdu::OpCode::LoginRequest,
            raw_data: serialize_key_values(&pairs),
            transit,
            next_stage: LoginStage::FullFeaturePhase,
            ..Default::default()
        }
    }

    fn params_for(request: &IscsiCommand) -> (LoginParams, Vec<(String, String)>) {
        let mut params = LoginParams {
            ini_nsg: LoginStage::FullFeaturePhase,
            ini_transit: true,
            ..Default::default()
        };
        let negotiated = params.process_login_data(request).unwrap();
        (params, negotiated)
    }

    fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn constant_keys_echo_target_default() {
        let request = login_request(&[("MaxBurstLength", "1048576")], true);
        let (params, negotiated) = params_for(&request);
        assert_eq!(lookup(&negotiated, "MaxBurstLength"), Some("262144"));
        assert_eq!(params.value(param::MAX_BURST_LENGTH), MAX_BURST_LENGTH);
        assert!(params.tgt_transit);
        assert_eq!(params.tgt_nsg, LoginStage::FullFeaturePhase);
    }

    #[test]
    fn bounded_keys_accept_in_range_values() {
        let request = login_request(&[("DefaultTime2Retain", "60")], true);
        let (params, negotiated) = params_for(&request);
        assert_eq!(lookup(&negotiated, "DefaultTime2Retain"), Some("60"));
        assert_eq!(params.value(param::DEFAULT_TIME2RETAIN), 60);
    }

    #[test]
    fn bounded_keys_out_of_range_fall_back_to_default() {
        let request = login_request(&[("DefaultTime2Retain", "9999")], true);
        let (params, negotiated) = params_for(&request);
        assert_eq!(lookup(&negotiated, "DefaultTime2Retain"), Some("20"));
        assert_eq!(params.value(param::DEFAULT_TIME2RETAIN), 20);
    }

    #[test]
    fn crc32c_offer_is_coerced_to_none() {
        let request = login_request(&[("HeaderDigest", "None,CRC32C")], true);
        let (params, negotiated) = params_for(&request);
        assert_eq!(lookup(&negotiated, "HeaderDigest"), Some("None"));
        assert_eq!(params.value(param::HEADER_DIGEST), DIGEST_NONE);
    }

    #[test]
    fn initiator_recv_limit_becomes_xmit_limit() {
        let request = login_request(&[("MaxRecvDataSegmentLength", "131072")], true);
        let (params, _) = params_for(&request);
        assert_eq!(params.value(param::MAX_XMIT_DATA_SEGMENT_LENGTH), 131072);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let request = login_request(&[("FancyNewKey", "1")], true);
        let mut params = LoginParams::default();
        assert!(matches!(
            params.process_login_data(&request),
            Err(Error::UnknownKey(_, _))
        ));
    }

    #[test]
    fn session_type_and_names_are_captured() {
        let request = login_request(
            &[
                ("InitiatorName", "iqn.1993-08.org.debian:01:abc"),
                ("TargetName", "iqn.2020-11.io.cloudhypervisor.qcow2:disk0"),
                ("SessionType", "Normal"),
            ],
            true,
        );
        let (params, _) = params_for(&request);
        assert_eq!(params.initiator, "iqn.1993-08.org.debian:01:abc");
        assert_eq!(
            params.target_name,
            "iqn.2020-11.io.cloudhypervisor.qcow2:disk0"
        );
        assert_eq!(params.session_type, SessionType::Normal);
    }

    #[test]
    fn security_phase_requires_auth_none() {
        let mut params = LoginParams::default();
        let ok = IscsiCommand {
            raw_data: serialize_key_values(&[(
                "AuthMethod".to_string(),
                "None".to_string(),
            )]),
            ..Default::default()
        };
        params.process_security_data(&ok).unwrap();
        assert!(params.tgt_transit);
        assert_eq!(params.tgt_nsg, LoginStage::LoginOperationalNegotiation);

        let chap = IscsiCommand {
            raw_data: serialize_key_values(&[(
                "AuthMethod".to_string(),
                "CHAP".to_string(),
            )]),
            ..Default::default()
        };
        assert!(matches!(
            params.process_security_data(&chap),
            Err(Error::AuthMethodUnsupported(_))
        ));
    }

    #[test]
    fn no_transit_without_initiator_request() {
        // All keys agree but the initiator doesn't ask for full feature.
        let request = login_request(&[("MaxBurstLength", "262144")], false);
        let mut params = LoginParams::default();
        assert!(matches!(
            params.process_login_data(&request),
            Err(Error::CannotTransit(_, _, _))
        ));
    }
}
