// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! iSCSI-side target state: the SCSI target it fronts, its sessions, and the
//! target portal group.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use scsi::ScsiTarget;

use crate::session::IscsiSession;

/// The single portal group every target belongs to.
#[derive(Clone, Debug)]
pub struct TargetPortGroup {
    pub tag: u16,
    pub portals: Vec<String>,
}

impl TargetPortGroup {
    pub fn new(portals: Vec<String>) -> TargetPortGroup {
        TargetPortGroup { tag: 1, portals }
    }

    /// The target port name and relative target port id for the portal a
    /// connection arrived on.
    pub fn port_for_local_addr(&self, local_addr: &str) -> (String, u16) {
        (local_addr.to_string(), self.tag)
    }
}

pub struct IscsiTarget {
    pub scsi_target: Arc<ScsiTarget>,
    pub portal_group: TargetPortGroup,
    pub sessions: RwLock<HashMap<u16, Arc<IscsiSession>>>,
}

impl IscsiTarget {
    pub fn new(scsi_target: Arc<ScsiTarget>, portal_group: TargetPortGroup) -> IscsiTarget {
        IscsiTarget {
            scsi_target,
            portal_group,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn session(&self, tsih: u16) -> Option<Arc<IscsiSession>> {
        self.sessions.read().unwrap().get(&tsih).cloned()
    }

    pub fn register_session(&self, session: Arc<IscsiSession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.tsih, session);
    }

    pub fn unregister_session(&self, tsih: u16) {
        self.sessions.write().unwrap().remove(&tsih);
    }
}
