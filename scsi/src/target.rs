// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The SCSI target registry: targets, their logical units, and the IT-nexus
//! bookkeeping shared with the transport layer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use qcow2::ImageFactory;

use crate::backing::Qcow2BackingStore;
use crate::lun::LogicalUnit;
use crate::{SamStat, ScsiCommand};

#[derive(Error, Debug)]
pub enum Error {
    #[error("target already exists: {0}")]
    TargetExists(String),
    #[error("target does not exist: {0}")]
    TargetMissing(String),
    #[error("target has logical units attached")]
    TargetHasLogicalUnits,
    #[error("target has active connections")]
    TargetHasConnections,
    #[error("logical unit not found: {0}")]
    LunMissing(u8),
    #[error("can't have more than 256 logical units on a single target")]
    OutOfLuns,
    #[error("failed to open disk image: {0}")]
    OpeningImage(#[source] qcow2::Error),
    #[error("failed to close disk image: {0}")]
    ClosingImage(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The identity of one (initiator, target) pairing.
#[derive(Clone, Debug)]
pub struct ItNexus {
    pub id: Uuid,
    pub tag: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LunRepresentation {
    pub lun_id: u8,
    pub file_path: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TargetRepresentation {
    pub target_id: u32,
    pub logical_units: Vec<LunRepresentation>,
    pub has_connections: bool,
    pub it_nexuses: Vec<String>,
}

// First-fit allocator over the 256 single-level LUN slots.
struct LunNumbers([bool; 256]);

impl LunNumbers {
    fn new() -> LunNumbers {
        LunNumbers([true; 256])
    }

    fn next(&mut self) -> Result<u8> {
        for (index, available) in self.0.iter_mut().enumerate() {
            if *available {
                *available = false;
                return Ok(index as u8);
            }
        }
        Err(Error::OutOfLuns)
    }

    fn release(&mut self, lun_id: u8) {
        self.0[lun_id as usize] = true;
    }
}

struct TargetDevices {
    devices: HashMap<u8, LogicalUnit>,
    available_luns: LunNumbers,
}

/// One SCSI target: its logical units and the nexuses logged into it.
pub struct ScsiTarget {
    pub name: String,
    pub target_id: u32,
    devices: Mutex<TargetDevices>,
    lun0: Mutex<LogicalUnit>,
    it_nexuses: Mutex<HashMap<Uuid, ItNexus>>,
}

impl ScsiTarget {
    fn new(name: String, target_id: u32) -> ScsiTarget {
        ScsiTarget {
            name,
            target_id,
            devices: Mutex::new(TargetDevices {
                devices: HashMap::new(),
                available_luns: LunNumbers::new(),
            }),
            lun0: Mutex::new(LogicalUnit::lun0()),
            it_nexuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_lun(&self, logical_unit: LogicalUnit) -> Result<u8> {
        let mut devices = self.devices.lock().unwrap();
        let lun_id = devices.available_luns.next()?;
        let mut logical_unit = logical_unit;
        logical_unit.target_lun_id = lun_id;
        devices.devices.insert(lun_id, logical_unit);
        Ok(lun_id)
    }

    /// Detaches the logical unit, closing its backing store. Returns the path
    /// the store was opened from.
    pub fn detach_lun(&self, lun_id: u8) -> Result<String> {
        let mut devices = self.devices.lock().unwrap();
        let mut lun = devices
            .devices
            .remove(&lun_id)
            .ok_or(Error::LunMissing(lun_id))?;
        let path = lun
            .backing
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        if let Err(e) = lun.backing.close() {
            devices.devices.insert(lun_id, lun);
            return Err(Error::ClosingImage(e));
        }
        devices.available_luns.release(lun_id);
        Ok(path)
    }

    /// Detaches every logical unit, refusing while connections are live.
    pub fn clear(&self) -> Result<Vec<String>> {
        if self.has_connections() {
            return Err(Error::TargetHasConnections);
        }
        let lun_ids: Vec<u8> = {
            let devices = self.devices.lock().unwrap();
            devices.devices.keys().copied().collect()
        };
        let mut paths = Vec::with_capacity(lun_ids.len());
        for lun_id in lun_ids {
            paths.push(self.detach_lun(lun_id)?);
        }
        Ok(paths)
    }

    pub fn attached_luns(&self) -> Vec<u8> {
        let devices = self.devices.lock().unwrap();
        let mut luns: Vec<u8> = devices.devices.keys().copied().collect();
        luns.sort_unstable();
        luns
    }

    pub fn has_logical_units(&self) -> bool {
        !self.devices.lock().unwrap().devices.is_empty()
    }

    pub fn has_connections(&self) -> bool {
        !self.it_nexuses.lock().unwrap().is_empty()
    }

    pub fn add_it_nexus(&self, nexus: ItNexus) -> bool {
        let mut nexuses = self.it_nexuses.lock().unwrap();
        if nexuses.contains_key(&nexus.id) {
            return false;
        }
        nexuses.insert(nexus.id, nexus);
        true
    }

    pub fn remove_it_nexus(&self, id: &Uuid) {
        self.it_nexuses.lock().unwrap().remove(id);
    }

    pub fn representation(&self) -> TargetRepresentation {
        let devices = self.devices.lock().unwrap();
        let logical_units = devices
            .devices
            .iter()
            .map(|(&lun_id, lun)| LunRepresentation {
                lun_id,
                file_path: lun
                    .backing
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            })
            .collect();
        let it_nexuses = self
            .it_nexuses
            .lock()
            .unwrap()
            .values()
            .map(|nexus| nexus.tag.clone())
            .collect();
        TargetRepresentation {
            target_id: self.target_id,
            logical_units,
            has_connections: self.has_connections(),
            it_nexuses,
        }
    }

    /// Runs `cmd` against the addressed logical unit, or against the
    /// placeholder LUN 0 device when nothing is attached at that address.
    pub fn perform_command(&self, cmd: &mut ScsiCommand) -> SamStat {
        cmd.target_name = self.name.clone();
        cmd.attached_luns = self.attached_luns();
        let mut devices = self.devices.lock().unwrap();
        match devices.devices.get_mut(&cmd.lun) {
            Some(lun) => lun.perform_command(cmd),
            None => {
                drop(devices);
                self.lun0.lock().unwrap().perform_command(cmd)
            }
        }
    }
}

/// The registry of SCSI targets and the LU factory shared by all of them.
pub struct TargetService {
    targets: RwLock<HashMap<String, Arc<ScsiTarget>>>,
    image_factory: ImageFactory,
    next_lu_uuid: Mutex<u64>,
}

impl TargetService {
    pub fn new(image_factory: ImageFactory) -> TargetService {
        TargetService {
            targets: RwLock::new(HashMap::new()),
            image_factory,
            next_lu_uuid: Mutex::new(1000),
        }
    }

    pub fn new_target(&self, name: &str) -> Result<Arc<ScsiTarget>> {
        let mut targets = self.targets.write().unwrap();
        if targets.contains_key(name) {
            return Err(Error::TargetExists(name.to_string()));
        }
        let target = Arc::new(ScsiTarget::new(name.to_string(), targets.len() as u32));
        targets.insert(name.to_string(), Arc::clone(&target));
        Ok(target)
    }

    pub fn delete_target(&self, name: &str) -> Result<()> {
        let mut targets = self.targets.write().unwrap();
        let target = targets
            .get(name)
            .ok_or_else(|| Error::TargetMissing(name.to_string()))?;
        if target.has_logical_units() {
            return Err(Error::TargetHasLogicalUnits);
        }
        if target.has_connections() {
            return Err(Error::TargetHasConnections);
        }
        targets.remove(name);
        Ok(())
    }

    pub fn target(&self, name: &str) -> Result<Arc<ScsiTarget>> {
        self.targets
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TargetMissing(name.to_string()))
    }

    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Opens the QCOW2 image at `disk_path` and attaches it to `target_name`
    /// as a new logical unit, returning the assigned LUN.
    pub fn attach_lun(&self, target_name: &str, disk_path: &Path) -> Result<u8> {
        let target = self.target(target_name)?;
        let backing =
            Qcow2BackingStore::open(&self.image_factory, disk_path).map_err(Error::OpeningImage)?;
        let uuid = {
            let mut next = self.next_lu_uuid.lock().unwrap();
            let uuid = *next;
            *next += 1;
            uuid
        };
        let lun = LogicalUnit::new(Box::new(backing), uuid);
        let lun_id = target.add_lun(lun)?;
        info!("attached {} to target {target_name} as LUN {lun_id}", disk_path.display());
        Ok(lun_id)
    }

    pub fn detach_lun(&self, target_name: &str, lun_id: u8) -> Result<String> {
        let target = self.target(target_name)?;
        target.detach_lun(lun_id)
    }

    pub fn clear_target(&self, target_name: &str) -> Result<Vec<String>> {
        let target = self.target(target_name)?;
        target.clear()
    }

    pub fn list(&self) -> HashMap<String, TargetRepresentation> {
        self.targets
            .read()
            .unwrap()
            .iter()
            .map(|(name, target)| (name.clone(), target.representation()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::mem_lu;
    use crate::{op, DataBuffer, SAM_STAT_CHECK_CONDITION, SAM_STAT_GOOD};

    fn service() -> TargetService {
        TargetService::new(ImageFactory::cached())
    }

    #[test]
    fn target_names_are_unique() {
        let service = service();
        service.new_target("iqn.test:a").unwrap();
        assert!(matches!(
            service.new_target("iqn.test:a"),
            Err(Error::TargetExists(_))
        ));
    }

    #[test]
    fn lun_ids_are_first_fit_and_reusable() {
        let service = service();
        let target = service.new_target("iqn.test:a").unwrap();
        let first = target.add_lun(mem_lu(1 << 20)).unwrap();
        let second = target.add_lun(mem_lu(1 << 20)).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        target.detach_lun(0).unwrap();
        assert_eq!(target.add_lun(mem_lu(1 << 20)).unwrap(), 0);
    }

    #[test]
    fn delete_target_refuses_attached_luns() {
        let service = service();
        let target = service.new_target("iqn.test:a").unwrap();
        target.add_lun(mem_lu(1 << 20)).unwrap();
        assert!(matches!(
            service.delete_target("iqn.test:a"),
            Err(Error::TargetHasLogicalUnits)
        ));
        target.detach_lun(0).unwrap();
        service.delete_target("iqn.test:a").unwrap();
        assert!(service.target("iqn.test:a").is_err());
    }

    #[test]
    fn delete_target_refuses_live_nexus() {
        let service = service();
        let target = service.new_target("iqn.test:a").unwrap();
        let nexus = ItNexus {
            id: Uuid::new_v4(),
            tag: "initiator-i0x1,target-t1".to_string(),
        };
        assert!(target.add_it_nexus(nexus.clone()));
        assert!(!target.add_it_nexus(nexus.clone()));
        assert!(matches!(
            service.delete_target("iqn.test:a"),
            Err(Error::TargetHasConnections)
        ));
        target.remove_it_nexus(&nexus.id);
        service.delete_target("iqn.test:a").unwrap();
    }

    #[test]
    fn commands_to_unattached_lun_hit_placeholder() {
        let service = service();
        let target = service.new_target("iqn.test:a").unwrap();
        let mut cmd = ScsiCommand::new(vec![op::TEST_UNIT_READY, 0, 0, 0, 0, 0], 5, 1);
        // The placeholder device is offline, so TEST UNIT READY fails.
        assert_eq!(target.perform_command(&mut cmd), SAM_STAT_CHECK_CONDITION);
    }

    #[test]
    fn commands_reach_attached_lun() {
        let service = service();
        let target = service.new_target("iqn.test:a").unwrap();
        let lun_id = target.add_lun(mem_lu(1 << 20)).unwrap();
        let mut cmd = ScsiCommand::new(vec![op::TEST_UNIT_READY, 0, 0, 0, 0, 0], lun_id, 1);
        assert_eq!(target.perform_command(&mut cmd), SAM_STAT_GOOD);
    }

    #[test]
    fn report_luns_sees_inventory() {
        let service = service();
        let target = service.new_target("iqn.test:a").unwrap();
        target.add_lun(mem_lu(1 << 20)).unwrap();
        target.add_lun(mem_lu(1 << 20)).unwrap();
        let mut cmd = ScsiCommand::new(vec![0u8; 12], 0, 1);
        cmd.cdb[0] = op::REPORT_LUNS;
        cmd.cdb[6..10].copy_from_slice(&256u32.to_be_bytes());
        cmd.in_buffer = Some(DataBuffer::new(256));
        assert_eq!(target.perform_command(&mut cmd), SAM_STAT_GOOD);
        let data = &cmd.in_buffer.as_ref().unwrap().buffer;
        // Two attached LUNs, one of them LUN 0.
        assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 16);
    }

    #[test]
    fn representation_reflects_state() {
        let service = service();
        let target = service.new_target("iqn.test:a").unwrap();
        target.add_lun(mem_lu(1 << 20)).unwrap();
        let listing = service.list();
        let representation = &listing["iqn.test:a"];
        assert_eq!(representation.logical_units.len(), 1);
        assert!(!representation.has_connections);
    }
}
