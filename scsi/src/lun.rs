// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The logical unit model: per-LU attributes, mode pages, and the command
//! dispatch table.

use uuid::Uuid;

use crate::backing::BackingStore;
use crate::{
    asc, build_sense_data, inquiry, op, report_opcodes, sbc, spc, sense_key, SamStat, ScsiCommand,
    DEFAULT_BLOCK_SHIFT, SAM_STAT_CHECK_CONDITION,
};

pub const TYPE_DISK: u8 = 0x00;
pub const TYPE_UNKNOWN: u8 = 0x1f;

/// A mode page as returned by MODE SENSE.
#[derive(Clone, Debug)]
pub struct ModePage {
    pub page_code: u8,
    pub subpage_code: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct ModePages(pub Vec<ModePage>);

impl ModePages {
    /// Serializes the pages selected by `page_code`/`subpage_code` under the
    /// given page control. Returns None when no page matches.
    pub fn to_bytes(&self, page_code: u8, subpage_code: u8, page_control: u8) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for page in &self.0 {
            let selected = if page_code == 0x3f {
                subpage_code == 0xff || page.subpage_code == 0
            } else {
                page.page_code == page_code && page.subpage_code == subpage_code
            };
            if !selected {
                continue;
            }
            // Page control 1 reports the changeable mask; nothing here is
            // changeable.
            let body: Vec<u8> = if page_control == 1 {
                vec![0u8; page.data.len()]
            } else {
                page.data.clone()
            };
            if page.subpage_code == 0 {
                out.push(page.page_code);
                out.push(body.len() as u8);
            } else {
                out.push(page.page_code | 0x40);
                out.push(page.subpage_code);
                out.push((body.len() >> 8) as u8);
                out.push(body.len() as u8);
            }
            out.extend_from_slice(&body);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Physical attributes reported through INQUIRY and friends.
#[derive(Clone, Debug)]
pub struct LuPhyAttribute {
    pub device_type: u8,
    pub online: bool,
    pub vendor_id: String,
    pub product_id: String,
    pub product_rev: String,
    pub scsi_id: String,
    pub scsi_sn: String,
    pub version_desc: [u8; 16],
    pub logical_blocks_per_physical_block_exponent: u32,
    pub lowest_aligned_lba: u32,
}

impl Default for LuPhyAttribute {
    fn default() -> LuPhyAttribute {
        LuPhyAttribute {
            device_type: TYPE_DISK,
            online: false,
            vendor_id: String::new(),
            product_id: String::new(),
            product_rev: String::new(),
            scsi_id: String::new(),
            scsi_sn: String::new(),
            version_desc: [0; 16],
            logical_blocks_per_physical_block_exponent: 0,
            lowest_aligned_lba: 0,
        }
    }
}

/// One exported logical unit: a block device view over a backing store.
pub struct LogicalUnit {
    pub size: u64,
    pub uuid: u64,
    pub block_shift: u32,
    pub attrs: LuPhyAttribute,
    pub mode_pages: ModePages,
    pub mode_block_descriptor: Vec<u8>,
    pub reserve_id: Option<Uuid>,
    pub backing: Box<dyn BackingStore>,
    pub target_lun_id: u8,
}

impl LogicalUnit {
    /// Builds a logical unit over `backing`, taking its size from the store.
    pub fn new(backing: Box<dyn BackingStore>, uuid: u64) -> LogicalUnit {
        let mut lu = LogicalUnit {
            size: backing.size(),
            uuid,
            block_shift: DEFAULT_BLOCK_SHIFT,
            attrs: LuPhyAttribute::default(),
            mode_pages: ModePages::default(),
            mode_block_descriptor: Vec::new(),
            reserve_id: None,
            backing,
            target_lun_id: 0,
        };
        lu.init(TYPE_DISK);
        lu.attrs.online = true;
        lu.attrs.logical_blocks_per_physical_block_exponent = 3;
        lu
    }

    /// The placeholder device answering for LUN 0 while nothing is attached
    /// there.
    pub fn lun0() -> LogicalUnit {
        let mut lu = LogicalUnit {
            size: 0,
            uuid: 0,
            block_shift: DEFAULT_BLOCK_SHIFT,
            attrs: LuPhyAttribute::default(),
            mode_pages: ModePages::default(),
            mode_block_descriptor: Vec::new(),
            reserve_id: None,
            backing: Box::new(crate::backing::NullBackingStore),
            target_lun_id: 0,
        };
        lu.init(TYPE_UNKNOWN);
        lu.attrs.online = false;
        lu.attrs.logical_blocks_per_physical_block_exponent = 3;
        lu
    }

    fn init(&mut self, device_type: u8) {
        self.attrs.device_type = device_type;
        self.attrs.vendor_id = "QCOW2T".to_string();
        self.attrs.product_id = "QCOW2TARGET".to_string();
        self.attrs.product_rev = "0.1".to_string();
        self.attrs.scsi_sn = format!("qcow2target-beaf-0{}", self.uuid);
        self.attrs.scsi_id = "iqn.2020-11.io.cloudhypervisor.qcow2:iscsi-tgt".to_string();
        self.attrs.version_desc = [
            0x03, 0x20, // SBC-2 no version claimed
            0x09, 0x60, // iSCSI no version claimed
            0x03, 0x00, // SPC-3 no version claimed
            0x00, 0x60, // SAM-3 no version claimed
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        self.mode_pages = ModePages(vec![
            // Disconnect-reconnect page: buffer full and empty ratios 0x80,
            // bus inactivity limit 10.
            ModePage {
                page_code: 0x02,
                subpage_code: 0,
                data: vec![
                    0x80, 0x80, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                    0x00,
                ],
            },
            // Caching page.
            ModePage {
                page_code: 0x08,
                subpage_code: 0,
                data: vec![
                    0x14, 0x00, 0xff, 0xff, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0x80, 0x14, 0x00,
                    0x00, 0x00, 0x00, 0x00, 0x00,
                ],
            },
            // Control page.
            ModePage {
                page_code: 0x0a,
                subpage_code: 0,
                data: vec![0x02, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00],
            },
            // Control extensions subpage: TCMOS set.
            ModePage {
                page_code: 0x0a,
                subpage_code: 0x01,
                data: vec![
                    0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                    0x00, 0x00,
                ],
            },
            // Informational exceptions control page.
            ModePage {
                page_code: 0x1c,
                subpage_code: 0,
                data: vec![0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            },
        ]);

        // Block descriptor: number of blocks (capped) and block length.
        let blocks = self.size >> self.block_shift;
        let capped = if blocks >> 32 != 0 {
            u32::MAX
        } else {
            blocks as u32
        };
        let mut descriptor = capped.to_be_bytes().to_vec();
        descriptor.extend_from_slice(&(1u32 << self.block_shift).to_be_bytes());
        self.mode_block_descriptor = descriptor;
    }

    /// Establishes this command's nexus as the reservation holder, failing if
    /// another nexus already holds it.
    pub fn reserve(&mut self, cmd: &ScsiCommand) -> Result<(), ()> {
        if let Some(holder) = self.reserve_id {
            if holder != cmd.it_nexus_id {
                warn!(
                    "reservation conflict: held by {holder}, requested by {}",
                    cmd.it_nexus_id
                );
                return Err(());
            }
        }
        self.reserve_id = Some(cmd.it_nexus_id);
        Ok(())
    }

    /// Runs one command against this logical unit, leaving status, data, and
    /// sense in the command.
    pub fn perform_command(&mut self, cmd: &mut ScsiCommand) -> SamStat {
        let stat = match cmd.opcode() {
            op::TEST_UNIT_READY => spc::test_unit_ready(self, cmd),
            op::REQUEST_SENSE => spc::request_sense(cmd),
            op::FORMAT_UNIT => sbc::format_unit(self, cmd),
            op::INQUIRY => inquiry::inquiry(self, cmd),
            op::START_STOP => sbc::start_stop(self, cmd),
            op::READ_CAPACITY_10 => sbc::read_capacity_10(self, cmd),
            op::MODE_SELECT_10 => sbc::mode_select(),
            op::MODE_SENSE_6 | op::MODE_SENSE_10 => spc::mode_sense(self, cmd),
            op::READ_10 | op::READ_16 => sbc::read(self, cmd),
            op::WRITE_10 | op::WRITE_16 => sbc::write(self, cmd),
            op::SYNCHRONIZE_CACHE_10 | op::SYNCHRONIZE_CACHE_16 => sbc::sync_cache(self, cmd),
            op::WRITE_SAME_16 => sbc::write_same_16(self, cmd),
            op::REPORT_LUNS => spc::report_luns(cmd),
            op::MAINTENANCE_IN => {
                if cmd.cdb[1] & 0x1f == op::SA_REPORT_SUPPORTED_OPCODES {
                    report_opcodes::report_supported_opcodes(cmd)
                } else {
                    if let Some(in_buffer) = cmd.in_buffer.as_mut() {
                        in_buffer.residual = 0;
                    }
                    build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
                    SAM_STAT_CHECK_CONDITION
                }
            }
            op::SERVICE_ACTION_IN_16 => {
                if cmd.cdb[1] & 0x1f == op::SA_READ_CAPACITY_16 {
                    sbc::read_capacity_16(self, cmd)
                } else {
                    if let Some(in_buffer) = cmd.in_buffer.as_mut() {
                        in_buffer.residual = 0;
                    }
                    build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
                    SAM_STAT_CHECK_CONDITION
                }
            }
            opcode => {
                debug!("unsupported SCSI opcode {opcode:#04x}");
                build_sense_data(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_OP_CODE);
                SAM_STAT_CHECK_CONDITION
            }
        };
        cmd.result = stat.0;
        stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::NullBackingStore;

    use crate::test_util::mem_lu as test_lu;

    #[test]
    fn unknown_opcode_is_check_condition() {
        let mut lu = test_lu(1 << 20);
        let mut cmd = ScsiCommand::new(vec![0xffu8; 16], 0, 1);
        let stat = lu.perform_command(&mut cmd);
        assert_eq!(stat, SAM_STAT_CHECK_CONDITION);
        let sense = cmd.sense_buffer.unwrap();
        assert_eq!(sense.buffer[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.buffer[12], 0x20);
    }

    #[test]
    fn mode_pages_serialize_single_and_all() {
        let lu = test_lu(1 << 20);
        let caching = lu.mode_pages.to_bytes(0x08, 0, 0).unwrap();
        assert_eq!(caching[0], 0x08);
        assert_eq!(caching[1] as usize, caching.len() - 2);

        let subpage = lu.mode_pages.to_bytes(0x0a, 0x01, 0).unwrap();
        assert_eq!(subpage[0], 0x4a);
        assert_eq!(subpage[1], 0x01);

        let all = lu.mode_pages.to_bytes(0x3f, 0, 0).unwrap();
        assert!(all.len() > caching.len());
        assert!(lu.mode_pages.to_bytes(0x33, 0, 0).is_none());
    }

    #[test]
    fn lun0_is_offline_unknown_type() {
        let lu = LogicalUnit::lun0();
        assert!(!lu.attrs.online);
        assert_eq!(lu.attrs.device_type, TYPE_UNKNOWN);
        assert_eq!(lu.size, 0);
    }

    #[test]
    fn reservation_conflicts_between_nexuses() {
        let mut lu = test_lu(1 << 20);
        let mut cmd_a = ScsiCommand::new(vec![0u8; 16], 0, 1);
        cmd_a.it_nexus_id = Uuid::new_v4();
        let mut cmd_b = ScsiCommand::new(vec![0u8; 16], 0, 2);
        cmd_b.it_nexus_id = Uuid::new_v4();

        assert!(lu.reserve(&cmd_a).is_ok());
        assert!(lu.reserve(&cmd_a).is_ok());
        assert!(lu.reserve(&cmd_b).is_err());
    }

    #[test]
    fn null_backing_store_reads_nothing() {
        let mut store = NullBackingStore;
        let mut buf = [0u8; 8];
        assert_eq!(store.read_at(0, &mut buf).unwrap(), 0);
        assert_eq!(store.size(), 0);
    }
}
