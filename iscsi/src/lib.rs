// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The iSCSI target driver: a TCP server whose per-connection receive loops
//! drive login negotiation, command sequencing, R2T write solicitation,
//! Data-In segmentation, task management, and heartbeat probing, feeding the
//! SCSI command layer underneath.

#[macro_use]
extern crate log;

pub mod connection;
pub mod login;
pub mod pdu;
pub mod session;
pub mod target;

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use thiserror::Error as ThisError;
use uuid::Uuid;

use scsi::{
    build_sense_data, asc, sense_key, DataBuffer, DataDirection, ItNexus, ScsiCommand,
    TargetRepresentation, TargetService, SAM_STAT_CHECK_CONDITION, SAM_STAT_TASK_ABORTED,
};

use crate::connection::{probe_initiator, Connection, ConnectionState, RxEvent};
use crate::login::{param, LoginParams, SessionType};
use crate::pdu::{parse_key_values, serialize_key_values, tmf, IscsiCommand, LoginStage, OpCode};
use crate::session::{
    IscsiSession, IscsiTask, SessionSequence, TaskQueue, TaskState, TSIH_MAX, TSIH_UNSPECIFIED,
};
use crate::target::{IscsiTarget, TargetPortGroup};

/// The well-known iSCSI port.
pub const ISCSI_PORT: u16 = 3260;

// Heartbeat: probe after 5 s of silence, give the initiator 1 s to answer.
const NOP_INTERVAL: Duration = Duration::from_secs(5);
const NOP_TIMEOUT: Duration = Duration::from_secs(1);

// TCP keep-alive knobs applied to every accepted socket.
const KEEPALIVE_IDLE_SECS: libc::c_int = 60;
const KEEPALIVE_INTERVAL_SECS: libc::c_int = 5;
const KEEPALIVE_COUNT: libc::c_int = 2;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("login failed: {0}")]
    Login(#[from] login::Error),
    #[error("invalid login request")]
    InvalidLoginRequest,
    #[error("no session is bound to this connection")]
    NoSession,
    #[error("login referenced a session that does not exist")]
    NoSuchSession,
    #[error("SCSI layer error: {0}")]
    Scsi(#[from] scsi::target::Error),
    #[error("target already exists: {0}")]
    TargetExists(String),
    #[error("target does not exist: {0}")]
    TargetMissing(String),
    #[error("the TSIH pool is exhausted")]
    TsihPoolExhausted,
    #[error("cannot find task with tag {0:#x}")]
    UnknownTask(u32),
    #[error("unexpected PDU {0:?} in this connection state")]
    UnexpectedPdu(OpCode),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The driver owning every iSCSI target exported by this process.
pub struct IscsiTargetDriver {
    pub scsi: Arc<TargetService>,
    targets: RwLock<HashMap<String, Arc<IscsiTarget>>>,
    tsih_pool: Mutex<HashSet<u16>>,
    portals: Vec<String>,
}

impl IscsiTargetDriver {
    pub fn new(scsi: Arc<TargetService>, portals: Vec<String>) -> Arc<IscsiTargetDriver> {
        // TSIH 0 and 0xffff are reserved and never allocated.
        let mut tsih_pool = HashSet::new();
        tsih_pool.insert(TSIH_UNSPECIFIED);
        tsih_pool.insert(TSIH_MAX);
        Arc::new(IscsiTargetDriver {
            scsi,
            targets: RwLock::new(HashMap::new()),
            tsih_pool: Mutex::new(tsih_pool),
            portals,
        })
    }

    // -- Control-plane operations --

    pub fn new_target(&self, target_name: &str) -> Result<()> {
        let mut targets = self.targets.write().unwrap();
        if targets.contains_key(target_name) {
            return Err(Error::TargetExists(target_name.to_string()));
        }
        let scsi_target = self.scsi.new_target(target_name)?;
        let target = Arc::new(IscsiTarget::new(
            scsi_target,
            TargetPortGroup::new(self.portals.clone()),
        ));
        targets.insert(target_name.to_string(), target);
        Ok(())
    }

    pub fn delete_target(&self, target_name: &str) -> Result<()> {
        let mut targets = self.targets.write().unwrap();
        if !targets.contains_key(target_name) {
            return Err(Error::TargetMissing(target_name.to_string()));
        }
        self.scsi.delete_target(target_name)?;
        targets.remove(target_name);
        Ok(())
    }

    pub fn check_target_exists(&self, target_name: &str) -> Result<()> {
        if self.targets.read().unwrap().contains_key(target_name) {
            Ok(())
        } else {
            Err(Error::TargetMissing(target_name.to_string()))
        }
    }

    pub fn add_lun(&self, target_name: &str, disk_path: &std::path::Path) -> Result<u8> {
        self.check_target_exists(target_name)?;
        Ok(self.scsi.attach_lun(target_name, disk_path)?)
    }

    pub fn remove_lun(&self, target_name: &str, lun_id: u8) -> Result<String> {
        self.check_target_exists(target_name)?;
        Ok(self.scsi.detach_lun(target_name, lun_id)?)
    }

    pub fn clear_target(&self, target_name: &str) -> Result<Vec<String>> {
        self.check_target_exists(target_name)?;
        Ok(self.scsi.clear_target(target_name)?)
    }

    pub fn list(&self) -> HashMap<String, TargetRepresentation> {
        self.targets
            .read()
            .unwrap()
            .iter()
            .map(|(name, target)| (name.clone(), target.scsi_target.representation()))
            .collect()
    }

    // -- TSIH pool --

    fn alloc_tsih(&self) -> Result<u16> {
        let mut pool = self.tsih_pool.lock().unwrap();
        for tsih in 1..TSIH_MAX {
            if !pool.contains(&tsih) {
                pool.insert(tsih);
                return Ok(tsih);
            }
        }
        Err(Error::TsihPoolExhausted)
    }

    fn release_tsih(&self, tsih: u16) {
        self.tsih_pool.lock().unwrap().remove(&tsih);
    }

    // -- Server loop --

    /// Binds the listening portal and serves connections forever.
    pub fn serve(self: Arc<Self>, address: &str) -> io::Result<()> {
        let listener = TcpListener::bind(address)?;
        info!("iSCSI target listening on {address}");
        self.run(listener)
    }

    /// Accept loop over an already-bound listener. Each connection gets a
    /// receive thread and a heartbeat thread.
    pub fn run(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            if let Err(e) = configure_keepalive(&stream) {
                warn!("failed to configure TCP keep-alive: {e}");
            }
            let connection = match Connection::new(stream) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("failed to set up connection: {e}");
                    continue;
                }
            };

            let heartbeat_shared = Arc::clone(&connection.shared);
            thread::spawn(move || {
                if probe_initiator(&heartbeat_shared, NOP_INTERVAL, NOP_TIMEOUT) {
                    warn!("no heartbeat received, dropping connection");
                    heartbeat_shared.close();
                }
            });

            let driver = Arc::clone(&self);
            thread::spawn(move || driver.handle_connection(connection));
        }
        Ok(())
    }

    fn handle_connection(&self, mut conn: Connection) {
        loop {
            if matches!(conn.state, ConnectionState::Close | ConnectionState::Exit) {
                break;
            }
            let event = match conn.read_pdu() {
                Ok(event) => event,
                Err(e) => {
                    debug!("receive loop ended: {e}");
                    break;
                }
            };
            let pdu = match event {
                RxEvent::PingReply => continue,
                RxEvent::Unknown(bhs) => {
                    if conn.state == ConnectionState::Scsi {
                        warn!("unknown opcode in full feature phase, closing");
                        break;
                    }
                    if self.send_reject(&mut conn, &bhs).is_err() {
                        break;
                    }
                    continue;
                }
                RxEvent::Pdu(pdu) => pdu,
            };

            // Discovery sessions stay on the text/login/logout dispatch; only
            // normal sessions reach the SCSI command path.
            let result = match conn.state {
                ConnectionState::Scsi => self.handle_full_feature_pdu(&mut conn, pdu),
                _ => self.handle_login_phase_pdu(&mut conn, pdu),
            };
            if let Err(e) = result {
                warn!("closing connection: {e}");
                break;
            }
        }

        // Unbind only if the session still considers this connection its own;
        // a reinstated connection has already taken it over.
        if let Some(session) = conn.session.take() {
            let still_ours = session
                .connection(conn.connection_id)
                .map(|shared| Arc::ptr_eq(&shared, &conn.shared))
                .unwrap_or(false);
            if still_ours {
                self.unbind_session(&session);
            }
        }
        conn.close();
        debug!("iscsi connection [{}] closed", conn.connection_id);
    }

    fn send_reject(&self, conn: &mut Connection, bhs: &[u8]) -> Result<()> {
        let request = IscsiCommand::default();
        let mut response = conn.build_response(OpCode::Reject, &request, None);
        response.raw_data = bhs.to_vec();
        conn.transmit_response(&mut response)?;
        Ok(())
    }

    // -- Login phase --

    fn handle_login_phase_pdu(&self, conn: &mut Connection, pdu: IscsiCommand) -> Result<()> {
        match pdu.opcode {
            OpCode::LoginRequest => self.exec_login(conn, pdu),
            OpCode::LogoutRequest => exec_logout(conn, &pdu),
            OpCode::TextRequest => self.exec_text(conn, &pdu),
            _ => {
                let mut response = conn.build_response(OpCode::Reject, &pdu, None);
                conn.transmit_response(&mut response)?;
                Ok(())
            }
        }
    }

    fn exec_login(&self, conn: &mut Connection, pdu: IscsiCommand) -> Result<()> {
        conn.connection_id = pdu.connection_id;
        conn.login.ini_csg = pdu.current_stage;
        conn.login.ini_nsg = pdu.next_stage;
        conn.login.ini_transit = pdu.transit;
        conn.login.ini_continue = pdu.continue_bit;
        conn.login.isid = pdu.isid;
        conn.login.tsih = pdu.tsih;
        conn.exp_cmd_sn = pdu.cmd_sn;
        conn.max_burst_length = login::MAX_BURST_LENGTH;
        conn.max_recv_data_segment_length = login::MAX_RECV_DATA_SEGMENT_LENGTH;
        conn.max_seq_count = conn.max_burst_length / conn.max_recv_data_segment_length;

        if pdu.current_stage == LoginStage::SecurityNegotiation {
            conn.login.process_security_data(&pdu)?;
            conn.state = ConnectionState::Login;
            let mut response = build_login_response(conn, &pdu, Vec::new());
            conn.transmit_response(&mut response)?;
            return Ok(());
        }

        let negotiated = conn.login.process_login_data(&pdu)?;
        if !conn.login.initialized {
            self.bind_session(conn)?;
            conn.login.initialized = true;
        }
        conn.state = if conn.login.tgt_nsg == LoginStage::FullFeaturePhase && conn.login.tgt_transit
        {
            ConnectionState::LoginFull
        } else {
            ConnectionState::Login
        };

        let mut keys = negotiated;
        if !conn.login.keys_declared {
            keys.extend(conn.login.declared_keys());
            conn.login.keys_declared = true;
        }
        let mut response = build_login_response(conn, &pdu, keys);
        conn.transmit_response(&mut response)?;

        if conn.state == ConnectionState::LoginFull {
            let session_type = conn
                .session
                .as_ref()
                .map(|session| session.session_type)
                .unwrap_or(SessionType::Normal);
            conn.state = if session_type == SessionType::Normal {
                ConnectionState::Scsi
            } else {
                ConnectionState::FullFeature
            };
            if conn.state == ConnectionState::Scsi {
                conn.shared.set_scsi_active();
            }
        }
        Ok(())
    }

    fn exec_text(&self, conn: &mut Connection, pdu: &IscsiCommand) -> Result<()> {
        let mut result_keys: Vec<(String, String)> = Vec::new();
        let keys = parse_key_values(&pdu.raw_data);
        if keys
            .iter()
            .any(|(key, value)| key == "SendTargets" && value == "All")
        {
            for (name, target) in self.targets.read().unwrap().iter() {
                result_keys.push(("TargetName".to_string(), name.clone()));
                let (port_name, tpgt) = target
                    .portal_group
                    .port_for_local_addr(&conn.local_addr);
                result_keys.push(("TargetAddress".to_string(), format!("{port_name},{tpgt}")));
            }
        }

        let mut response = IscsiCommand {
            opcode: OpCode::TextResponse,
            final_bit: true,
            next_stage: LoginStage::FullFeaturePhase,
            stat_sn: pdu.exp_stat_sn,
            task_tag: pdu.task_tag,
            exp_cmd_sn: pdu.cmd_sn,
            max_cmd_sn: pdu.cmd_sn,
            raw_data: serialize_key_values(&result_keys),
            ..Default::default()
        };
        conn.transmit_response(&mut response)?;
        Ok(())
    }

    // -- Session binding --

    fn bind_session(&self, conn: &mut Connection) -> Result<()> {
        let target = if conn.login.session_type == SessionType::Discovery {
            None
        } else {
            let target = self
                .targets
                .read()
                .unwrap()
                .get(&conn.login.target_name)
                .cloned()
                .ok_or_else(|| Error::TargetMissing(conn.login.target_name.clone()))?;
            conn.login.tpgt = target.portal_group.tag;
            Some(target)
        };

        // A TSIH of zero matches on (ISID, TPGT) for session reinstatement;
        // anything else must name a live session.
        let existing = target.as_ref().and_then(|target| {
            target
                .sessions
                .read()
                .unwrap()
                .values()
                .find(|session| {
                    session.isid == conn.login.isid
                        && session.tpgt == conn.login.tpgt
                        && (conn.login.tsih == TSIH_UNSPECIFIED
                            || session.tsih == conn.login.tsih)
                })
                .cloned()
        });

        match (existing, conn.login.tsih) {
            (None, TSIH_UNSPECIFIED) => {
                let session = self.new_session(conn, target.clone())?;
                if session.session_type == SessionType::Normal {
                    // The unwrap holds: a normal session always has a target.
                    let target = target.unwrap();
                    info!(
                        "login from initiator {}, session type Normal, target {}, ISID {:#x}",
                        conn.login.initiator, conn.login.target_name, conn.login.isid
                    );
                    self.register_nexus(&target, &session);
                    target.register_session(Arc::clone(&session));
                } else {
                    info!(
                        "discovery request from initiator {}, ISID {:#x}",
                        conn.login.initiator, conn.login.isid
                    );
                }
                session.register_connection(conn.connection_id, Arc::clone(&conn.shared));
                conn.session = Some(session);
                Ok(())
            }
            (None, _) => Err(Error::NoSuchSession),
            (Some(old_session), TSIH_UNSPECIFIED) => {
                info!(
                    "session reinstatement from initiator {}, target {}, ISID {:#x}",
                    conn.login.initiator, conn.login.target_name, conn.login.isid
                );
                let session = self.new_session(conn, target.clone())?;
                {
                    let old_sequence = old_session.sequence.lock().unwrap();
                    let mut sequence = session.sequence.lock().unwrap();
                    sequence.exp_cmd_sn = old_sequence.exp_cmd_sn;
                    sequence.max_cmd_sn = old_sequence.max_cmd_sn.wrapping_add(1);
                }
                self.unbind_session(&old_session);
                old_session.close_connections();

                let target = target.unwrap();
                self.register_nexus(&target, &session);
                target.register_session(Arc::clone(&session));
                session.register_connection(conn.connection_id, Arc::clone(&conn.shared));
                conn.session = Some(session);
                Ok(())
            }
            (Some(existing), tsih) if tsih == existing.tsih => {
                info!(
                    "connection reinstatement from initiator {}, target {}, ISID {:#x}",
                    conn.login.initiator, conn.login.target_name, conn.login.isid
                );
                if let Some(old_connection) = existing.connection(conn.connection_id) {
                    old_connection.close();
                }
                existing.register_connection(conn.connection_id, Arc::clone(&conn.shared));
                conn.session = Some(existing);
                Ok(())
            }
            _ => Err(Error::InvalidLoginRequest),
        }
    }

    fn register_nexus(&self, target: &IscsiTarget, session: &IscsiSession) {
        let nexus = ItNexus {
            id: Uuid::new_v4(),
            tag: format!(
                "{}i{:#x},{}t{}",
                session.initiator, session.isid, session.target_name, session.tpgt
            ),
        };
        *session.it_nexus_id.lock().unwrap() = Some(nexus.id);
        target.scsi_target.add_it_nexus(nexus);
    }

    fn new_session(
        &self,
        conn: &Connection,
        target: Option<Arc<IscsiTarget>>,
    ) -> Result<Arc<IscsiSession>> {
        let tsih = self.alloc_tsih()?;
        let max_queue_command = conn.login.value(param::MAX_QUEUE_CMD);
        Ok(Arc::new(IscsiSession {
            initiator: conn.login.initiator.clone(),
            initiator_alias: conn.login.initiator_alias.clone(),
            target,
            target_name: conn.login.target_name.clone(),
            isid: conn.login.isid,
            tsih,
            tpgt: conn.login.tpgt,
            session_type: conn.login.session_type,
            max_queue_command,
            params: conn.login.session_params.clone(),
            it_nexus_id: Mutex::new(None),
            sequence: Mutex::new(SessionSequence {
                exp_cmd_sn: conn.exp_cmd_sn,
                max_cmd_sn: conn.exp_cmd_sn.wrapping_add(max_queue_command),
            }),
            pending_tasks: Mutex::new(TaskQueue::new()),
            outstanding_tasks: Mutex::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }))
    }

    fn unbind_session(&self, session: &IscsiSession) {
        if let Some(target) = &session.target {
            target.unregister_session(session.tsih);
            if let Some(nexus_id) = session.it_nexus_id.lock().unwrap().take() {
                target.scsi_target.remove_it_nexus(&nexus_id);
            }
        }
        self.release_tsih(session.tsih);
    }

    // -- Full feature phase --

    fn handle_full_feature_pdu(&self, conn: &mut Connection, pdu: IscsiCommand) -> Result<()> {
        match pdu.opcode {
            OpCode::ScsiCommand => self.handle_scsi_command(conn, pdu),
            OpCode::ScsiDataOut => self.handle_data_out(conn, pdu),
            OpCode::NopOut => {
                let mut response = conn.build_response(OpCode::NopIn, &pdu, None);
                conn.transmit_response(&mut response)?;
                Ok(())
            }
            OpCode::ScsiTaskRequest => self.handle_task_management(conn, pdu),
            OpCode::LogoutRequest => exec_logout(conn, &pdu),
            opcode => Err(Error::UnexpectedPdu(opcode)),
        }
    }

    fn handle_scsi_command(&self, conn: &mut Connection, mut pdu: IscsiCommand) -> Result<()> {
        let session = conn.session.clone().ok_or(Error::NoSession)?;
        let target = session.target.clone().ok_or(Error::NoSession)?;

        let mut scsi_command =
            ScsiCommand::new(pdu.cdb.clone(), pdu.lun, u64::from(pdu.task_tag));
        scsi_command.it_nexus_id = session
            .it_nexus_id
            .lock()
            .unwrap()
            .unwrap_or_else(Uuid::nil);
        scsi_command.rel_target_port_id = session.tpgt;
        scsi_command.target_port_group_id = target.portal_group.tag;
        scsi_command.target_port_name =
            format!("{},t,{:#06x}", session.target_name, session.tpgt);

        scsi_command.direction = match (pdu.read, pdu.write) {
            (true, true) => DataDirection::Bidirectional,
            (true, false) => DataDirection::Read,
            (false, true) => DataDirection::Write,
            (false, false) => DataDirection::None,
        };

        if scsi_command.direction == DataDirection::Bidirectional {
            scsi_command.result = SAM_STAT_CHECK_CONDITION.0;
            build_sense_data(
                &mut scsi_command,
                sense_key::ILLEGAL_REQUEST,
                asc::NO_ADDITIONAL_SENSE,
            );
            let task = IscsiTask::new(pdu, Some(scsi_command));
            let mut response = conn.build_response(OpCode::ScsiResponse, &task.pdu, Some(&task));
            conn.transmit_response(&mut response)?;
            return Ok(());
        }

        if scsi_command.direction == DataDirection::Write {
            let expected = pdu.expected_data_length as usize;
            let immediate_length = pdu.raw_data.len();
            let buffer_length = if expected == 0 { immediate_length } else { expected };
            let mut out_buffer = DataBuffer::new(buffer_length as u32);
            let mut offset = 0usize;
            if session.params[param::IMMEDIATE_DATA] == 1 && immediate_length > 0 {
                let n = immediate_length.min(out_buffer.buffer.len());
                out_buffer.buffer[..n].copy_from_slice(&pdu.raw_data[..n]);
                offset = n;
            }
            scsi_command.out_buffer = Some(out_buffer);
            let immediate_payload = std::mem::take(&mut pdu.raw_data);

            let mut task = IscsiTask::new(pdu, Some(scsi_command));
            task.expected_data_length = expected as u64;
            task.r2t_count = expected as i64 - immediate_payload.len() as i64;
            task.offset = offset;
            if !task.pdu.final_bit {
                task.unsol_count = 1;
            }
            debug!(
                "SCSI write, R2T count {}, unsolicited count {}, offset {}",
                task.r2t_count, task.unsol_count, task.offset
            );

            if task.r2t_count > 0 {
                // The rest of the data arrives as Data-Out; the command is
                // consumed as far as sequencing goes.
                {
                    let mut sequence = session.sequence.lock().unwrap();
                    sequence.exp_cmd_sn = sequence.exp_cmd_sn.wrapping_add(1);
                }
                task.state = TaskState::Pending;
                if session.params[param::INITIAL_R2T] == 1 {
                    let mut response =
                        conn.build_response(OpCode::Ready, &task.pdu.clone(), Some(&task));
                    session
                        .outstanding_tasks
                        .lock()
                        .unwrap()
                        .insert(task.tag, task);
                    conn.transmit_response(&mut response)?;
                } else {
                    debug!("waiting for unsolicited data-out");
                    session
                        .outstanding_tasks
                        .lock()
                        .unwrap()
                        .insert(task.tag, task);
                }
                return Ok(());
            }
            task.offset = 0;
            return self.task_queue_handler(conn, task);
        }

        if scsi_command.direction == DataDirection::Read {
            scsi_command.in_buffer = Some(DataBuffer::new(pdu.expected_data_length));
        }
        let task = IscsiTask::new(pdu, Some(scsi_command));
        self.task_queue_handler(conn, task)
    }

    // Runs a task now if its CmdSN is due, queues it if it is early, and
    // drains any successors its completion unblocks.
    fn task_queue_handler(&self, conn: &mut Connection, mut task: IscsiTask) -> Result<()> {
        let session = conn.session.clone().ok_or(Error::NoSession)?;
        if task.pdu.immediate {
            return self.execute_and_respond(conn, task);
        }
        let cmd_sn = task.cmd_sn();
        let exp_cmd_sn = session.exp_cmd_sn();
        if cmd_sn == exp_cmd_sn {
            loop {
                {
                    let mut sequence = session.sequence.lock().unwrap();
                    sequence.exp_cmd_sn = sequence.exp_cmd_sn.wrapping_add(1);
                }
                self.execute_and_respond(conn, task)?;

                let next = {
                    let mut pending = session.pending_tasks.lock().unwrap();
                    if pending.next_cmd_sn() == Some(session.exp_cmd_sn()) {
                        pending.pop()
                    } else {
                        None
                    }
                };
                match next {
                    Some(mut next_task) => {
                        next_task.state = TaskState::Scsi;
                        task = next_task;
                    }
                    None => return Ok(()),
                }
            }
        } else if cmd_sn < exp_cmd_sn {
            // The command is behind the window; fail it without taking the
            // connection down.
            error!("unexpected command serial number ({cmd_sn}, {exp_cmd_sn})");
            Ok(())
        } else {
            debug!("queueing task with CmdSN {cmd_sn}, expecting {exp_cmd_sn}");
            task.state = TaskState::Pending;
            session.pending_tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    fn execute_and_respond(&self, conn: &mut Connection, mut task: IscsiTask) -> Result<()> {
        let session = conn.session.clone().ok_or(Error::NoSession)?;
        let target = session.target.clone().ok_or(Error::NoSession)?;
        task.state = TaskState::Scsi;
        {
            // The task was built with a SCSI command by the dispatch path.
            let scsi_command = task.scsi_command.as_mut().unwrap();
            target.scsi_target.perform_command(scsi_command);
        }

        let scsi_command = task.scsi_command.as_ref().unwrap();
        let opcode = if scsi_command.direction == DataDirection::Read
            && scsi_command.sense_buffer.is_none()
            && task.pdu.expected_data_length != 0
        {
            OpCode::ScsiDataIn
        } else {
            OpCode::ScsiResponse
        };
        let mut response = conn.build_response(opcode, &task.pdu.clone(), Some(&task));
        conn.transmit_response(&mut response)?;
        Ok(())
    }

    fn handle_data_out(&self, conn: &mut Connection, pdu: IscsiCommand) -> Result<()> {
        let session = conn.session.clone().ok_or(Error::NoSession)?;

        let mut r2t_response = None;
        {
            let mut outstanding = session.outstanding_tasks.lock().unwrap();
            let task = outstanding
                .get_mut(&pdu.task_tag)
                .ok_or(Error::UnknownTask(pdu.task_tag))?;

            // The command was built with an out buffer by the write path.
            let out_buffer = task
                .scsi_command
                .as_mut()
                .unwrap()
                .out_buffer
                .as_mut()
                .unwrap();
            let end = (task.offset + pdu.raw_data.len()).min(out_buffer.buffer.len());
            let n = end.saturating_sub(task.offset);
            out_buffer.buffer[task.offset..end].copy_from_slice(&pdu.raw_data[..n]);
            task.offset += pdu.raw_data.len();
            task.r2t_count -= pdu.raw_data.len() as i64;
            debug!(
                "data-out: final {}, remaining r2t count {}",
                pdu.final_bit, task.r2t_count
            );

            if !pdu.final_bit {
                return Ok(());
            }
            if task.r2t_count > 0 {
                if task.unsol_count == 0 {
                    task.r2t_sn += 1;
                } else {
                    task.r2t_sn = 0;
                    task.unsol_count = 0;
                }
                r2t_response = Some(conn.build_response(OpCode::Ready, &pdu, Some(&*task)));
            }
        }
        if let Some(mut response) = r2t_response {
            conn.transmit_response(&mut response)?;
            return Ok(());
        }

        // All data arrived: run the write and answer it.
        let mut task = session
            .outstanding_tasks
            .lock()
            .unwrap()
            .remove(&pdu.task_tag)
            .ok_or(Error::UnknownTask(pdu.task_tag))?;
        task.offset = 0;
        let target = session.target.clone().ok_or(Error::NoSession)?;
        {
            let scsi_command = task.scsi_command.as_mut().unwrap();
            target.scsi_target.perform_command(scsi_command);
        }
        let mut response = conn.build_response(OpCode::ScsiResponse, &pdu, Some(&task));
        conn.transmit_response(&mut response)?;
        Ok(())
    }

    fn handle_task_management(&self, conn: &mut Connection, pdu: IscsiCommand) -> Result<()> {
        let session = conn.session.clone().ok_or(Error::NoSession)?;
        let mut task = IscsiTask::new(pdu.clone(), None);

        match pdu.task_function {
            tmf::ABORT_TASK => {
                let aborted = {
                    let mut pending = session.pending_tasks.lock().unwrap();
                    pending.remove_by_tag(pdu.referenced_task_tag)
                }
                .or_else(|| {
                    session
                        .outstanding_tasks
                        .lock()
                        .unwrap()
                        .remove(&pdu.referenced_task_tag)
                });
                match aborted {
                    None => task.result = tmf::RSP_NO_TASK,
                    Some(mut aborted) => {
                        debug!("aborting task {:#x}", aborted.tag);
                        let mut scsi_command = aborted.scsi_command.take().unwrap_or_else(|| {
                            ScsiCommand::new(vec![0u8; 16], 0, u64::from(aborted.tag))
                        });
                        scsi_command.result = SAM_STAT_TASK_ABORTED.0;
                        aborted.scsi_command = Some(scsi_command);
                        let mut response =
                            conn.build_response(OpCode::ScsiResponse, &aborted.pdu.clone(), Some(&aborted));
                        conn.transmit_response(&mut response)?;
                        task.result = tmf::RSP_COMPLETE;
                    }
                }
            }
            tmf::ABORT_TASK_SET
            | tmf::CLEAR_ACA
            | tmf::CLEAR_TASK_SET
            | tmf::LOGICAL_UNIT_RESET
            | tmf::TARGET_WARM_RESET
            | tmf::TARGET_COLD_RESET
            | tmf::TASK_REASSIGN => task.result = tmf::RSP_NOT_SUPPORTED,
            _ => task.result = tmf::RSP_REJECTED,
        }

        let mut response = conn.build_response(OpCode::ScsiTaskResponse, &pdu, Some(&task));
        conn.transmit_response(&mut response)?;
        Ok(())
    }
}

fn exec_logout(conn: &mut Connection, pdu: &IscsiCommand) -> Result<()> {
    info!("logout request received");
    let mut response = conn.build_response(OpCode::LogoutResponse, pdu, None);
    conn.transmit_response(&mut response)?;
    Ok(())
}

fn build_login_response(
    conn: &mut Connection,
    request: &IscsiCommand,
    keys: Vec<(String, String)>,
) -> IscsiCommand {
    conn.stat_sn = conn.stat_sn.wrapping_add(1);
    IscsiCommand {
        opcode: OpCode::LoginResponse,
        transit: conn.login.tgt_transit,
        current_stage: request.current_stage,
        next_stage: conn.login.tgt_nsg,
        isid: request.isid,
        tsih: conn
            .session
            .as_ref()
            .map(|session| session.tsih)
            .unwrap_or(0),
        task_tag: request.task_tag,
        stat_sn: request.exp_stat_sn,
        exp_cmd_sn: request.cmd_sn,
        max_cmd_sn: request.cmd_sn,
        raw_data: serialize_key_values(&keys),
        ..Default::default()
    }
}

// Keep-alive per accepted socket: idle 60 s, probe every 5 s, give up after
// two missed probes.
fn configure_keepalive(stream: &TcpStream) -> io::Result<()> {
    let fd = stream.as_raw_fd();

    fn set_opt(fd: i32, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        // SAFETY: fd is a valid open socket and value outlives the call.
        let result = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, KEEPALIVE_IDLE_SECS)?;
    set_opt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPINTVL,
        KEEPALIVE_INTERVAL_SECS,
    )?;
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, KEEPALIVE_COUNT)?;
    Ok(())
}
