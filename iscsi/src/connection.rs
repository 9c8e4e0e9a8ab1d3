// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-connection receive and transmit plumbing: PDU framing, response
//! construction, Data-In segmentation, and the NOP-In heartbeat.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scsi::DataDirection;

use crate::login::{param, LoginParams, MAX_BURST_LENGTH, MAX_RECV_DATA_SEGMENT_LENGTH};
use crate::pdu::{
    self, parse_header, IscsiCommand, OpCode, BHS_SIZE, RESERVED_TASK_TAG,
};
use crate::session::{IscsiSession, IscsiTask};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Free,
    Login,
    LoginFull,
    FullFeature,
    Scsi,
    Exit,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NopState {
    NoRequestReceived,
    WaitingForRequest,
    WaitingForPingResponse,
}

// Counters the heartbeat NOP-In is built from, updated under the write lock
// as responses go out.
struct NopCounters {
    stat_sn: u32,
    exp_cmd_sn: u32,
    max_cmd_sn: u32,
    target_transfer_tag: u32,
    last_request: Instant,
    ping_sent: Instant,
    state: NopState,
}

impl NopCounters {
    fn new() -> NopCounters {
        NopCounters {
            stat_sn: 0,
            exp_cmd_sn: 0,
            max_cmd_sn: 0,
            target_transfer_tag: 0,
            last_request: Instant::now(),
            ping_sent: Instant::now(),
            state: NopState::NoRequestReceived,
        }
    }
}

/// The half of a connection shared with the heartbeat thread and the session
/// registry: the socket writer, the ping counters, and liveness flags.
pub struct ConnShared {
    writer: Mutex<TcpStream>,
    nop: Mutex<NopCounters>,
    closed: AtomicBool,
    scsi_active: AtomicBool,
}

impl ConnShared {
    fn new(writer: TcpStream) -> ConnShared {
        ConnShared {
            writer: Mutex::new(writer),
            nop: Mutex::new(NopCounters::new()),
            closed: AtomicBool::new(false),
            scsi_active: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_scsi_active(&self) {
        self.scsi_active.store(true, Ordering::Release);
    }

    fn scsi_active(&self) -> bool {
        self.scsi_active.load(Ordering::Acquire)
    }

    /// Closes the socket; both the receive loop and the heartbeat notice.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let writer = self.writer.lock().unwrap();
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    fn write_pdu(&self, bytes: &[u8], stat_sn: u32, exp_cmd_sn: u32, max_cmd_sn: u32) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        let mut nop = self.nop.lock().unwrap();
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        writer.write_all(bytes)?;
        nop.stat_sn = stat_sn.wrapping_add(1);
        nop.exp_cmd_sn = exp_cmd_sn;
        nop.max_cmd_sn = max_cmd_sn;
        Ok(())
    }

    fn on_received_pdu(&self) {
        let mut nop = self.nop.lock().unwrap();
        nop.last_request = Instant::now();
        nop.state = NopState::WaitingForRequest;
    }

    fn send_nop_ping(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        let mut nop = self.nop.lock().unwrap();
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        let ping = IscsiCommand {
            opcode: OpCode::NopIn,
            task_tag: RESERVED_TASK_TAG,
            stat_sn: nop.stat_sn,
            exp_cmd_sn: nop.exp_cmd_sn,
            max_cmd_sn: nop.max_cmd_sn,
            ..Default::default()
        };
        // The reserved initiator task tag goes out with our transfer tag in
        // its place.
        let mut bytes = ping.bytes();
        bytes[20..24].copy_from_slice(&nop.target_transfer_tag.to_be_bytes());
        writer.write_all(&bytes)?;
        nop.target_transfer_tag = nop.target_transfer_tag.wrapping_add(1);
        nop.state = NopState::WaitingForPingResponse;
        nop.ping_sent = Instant::now();
        Ok(())
    }
}

// Sleep either the poll step or whatever remains of `timeout` measured from
// `since`, whichever is shorter.
fn probe_sleep(timeout: Duration, step: Duration, since: Instant) -> Duration {
    let elapsed = since.elapsed();
    let remaining = timeout.saturating_sub(elapsed);
    remaining.min(step)
}

/// Heartbeat loop: once the connection is in the SCSI state, send a NOP-In
/// after `nop_interval` of silence and give the initiator `nop_timeout` to
/// answer. Returns true when the initiator timed out.
pub(crate) fn probe_initiator(
    shared: &ConnShared,
    nop_interval: Duration,
    nop_timeout: Duration,
) -> bool {
    let step = Duration::from_millis(50);
    loop {
        if shared.is_closed() {
            return false;
        }
        if !shared.scsi_active() {
            thread::sleep(step);
            continue;
        }

        enum Action {
            Sleep(Duration),
            SendPing,
            TimedOut,
        }
        let action = {
            let nop = shared.nop.lock().unwrap();
            match nop.state {
                NopState::NoRequestReceived => Action::Sleep(step),
                NopState::WaitingForRequest => {
                    if nop.last_request.elapsed() < nop_interval {
                        Action::Sleep(probe_sleep(nop_interval, step, nop.last_request))
                    } else {
                        Action::SendPing
                    }
                }
                NopState::WaitingForPingResponse => {
                    if nop.ping_sent.elapsed() < nop_timeout {
                        Action::Sleep(probe_sleep(nop_timeout, step, nop.ping_sent))
                    } else {
                        Action::TimedOut
                    }
                }
            }
        };
        match action {
            Action::Sleep(duration) => thread::sleep(duration),
            Action::SendPing => {
                if shared.send_nop_ping().is_err() {
                    return true;
                }
            }
            Action::TimedOut => return true,
        }
    }
}

/// What one receive-loop turn produced.
pub enum RxEvent {
    Pdu(IscsiCommand),
    /// A NOP-Out carrying the reserved tag: the initiator answering our ping.
    PingReply,
    /// A syntactically whole header with an opcode we don't speak.
    Unknown([u8; BHS_SIZE]),
}

/// One accepted TCP connection.
pub struct Connection {
    stream: TcpStream,
    pub shared: Arc<ConnShared>,
    pub state: ConnectionState,
    pub connection_id: u16,
    pub login: LoginParams,
    pub session: Option<Arc<IscsiSession>>,
    pub local_addr: String,

    // StatSN bookkeeping mirrors what goes out in responses.
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,

    pub max_recv_data_segment_length: u32,
    pub max_burst_length: u32,
    pub max_seq_count: u32,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Connection> {
        let writer = stream.try_clone()?;
        let local_addr = stream
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        Ok(Connection {
            stream,
            shared: Arc::new(ConnShared::new(writer)),
            state: ConnectionState::Free,
            connection_id: 0,
            login: LoginParams::default(),
            session: None,
            local_addr,
            stat_sn: 0,
            exp_cmd_sn: 0,
            max_recv_data_segment_length: MAX_RECV_DATA_SEGMENT_LENGTH,
            max_burst_length: MAX_BURST_LENGTH,
            max_seq_count: MAX_BURST_LENGTH / MAX_RECV_DATA_SEGMENT_LENGTH,
        })
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Close;
        self.shared.close();
    }

    /// Reads one PDU: the basic header segment and, when present, the 4-byte
    /// padded data segment.
    pub fn read_pdu(&mut self) -> io::Result<RxEvent> {
        let mut bhs = [0u8; BHS_SIZE];
        self.stream.read_exact(&mut bhs)?;
        self.shared.on_received_pdu();

        let opcode_byte = bhs[0] & 0x3f;
        let data_length =
            u32::from_be_bytes([0, bhs[5], bhs[6], bhs[7]]) as usize;

        if OpCode::from_u8(opcode_byte).is_none() {
            // Drain the data segment so the stream stays framed.
            let mut padding = vec![0u8; pdu::padded_length(data_length)];
            self.stream.read_exact(&mut padding)?;
            return Ok(RxEvent::Unknown(bhs));
        }

        let mut cmd = parse_header(&bhs).map_err(|e| {
            warn!("dropping connection on malformed header: {e}");
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?;

        // A NOP-Out with the reserved tag is a ping answer, never replied to.
        if cmd.opcode == OpCode::NopOut && cmd.task_tag == RESERVED_TASK_TAG {
            let mut padding = vec![0u8; pdu::padded_length(cmd.data_length)];
            self.stream.read_exact(&mut padding)?;
            return Ok(RxEvent::PingReply);
        }

        if cmd.data_length > 0 {
            let mut data = vec![0u8; pdu::padded_length(cmd.data_length)];
            self.stream.read_exact(&mut data)?;
            data.truncate(cmd.data_length);
            cmd.raw_data = data;
        }
        Ok(RxEvent::Pdu(cmd))
    }

    /// Builds a response PDU of the given opcode for `request`, pulling
    /// status and data from `task` where one is involved.
    pub fn build_response(
        &mut self,
        opcode: OpCode,
        request: &IscsiCommand,
        task: Option<&IscsiTask>,
    ) -> IscsiCommand {
        self.stat_sn = self.stat_sn.wrapping_add(1);
        let mut response = IscsiCommand {
            opcode,
            stat_sn: request.exp_stat_sn,
            task_tag: request.task_tag,
            expected_data_length: request.expected_data_length,
            ..Default::default()
        };
        if let Some(session) = &self.session {
            response.exp_cmd_sn = session.exp_cmd_sn();
            response.max_cmd_sn = session.max_cmd_sn();
        }

        match opcode {
            OpCode::Ready => {
                let task = task.expect("an R2T always solicits for a task");
                response.r2t_sn = task.r2t_sn;
                response.final_bit = true;
                response.buffer_offset = task.offset as u32;
                let max_burst = self.login.value(param::MAX_BURST_LENGTH);
                response.desired_length = (task.r2t_count.max(0) as u64)
                    .min(u64::from(max_burst)) as u32;
            }
            OpCode::ScsiDataIn | OpCode::ScsiResponse => {
                response.scsi_opcode = request.scsi_opcode;
                response.immediate = true;
                response.final_bit = true;
                response.scsi_response = 0x00;
                response.has_status = true;
                if let Some(scsi_command) = task.and_then(|t| t.scsi_command.as_ref()) {
                    response.status = scsi_command.result;
                    if scsi_command.result != 0 && scsi_command.sense_buffer.is_some() {
                        let sense = scsi_command.sense_buffer.as_ref().unwrap();
                        let mut data =
                            (sense.length() as u16).to_be_bytes().to_vec();
                        data.extend_from_slice(&sense.buffer);
                        response.raw_data = data;
                    } else if matches!(
                        scsi_command.direction,
                        DataDirection::Read | DataDirection::Write
                    ) {
                        if let Some(in_buffer) = scsi_command.in_buffer.as_ref() {
                            response.residual = in_buffer.residual;
                            if response.residual != 0 && response.residual < in_buffer.length {
                                response.raw_data =
                                    in_buffer.buffer[..response.residual as usize].to_vec();
                            } else {
                                response.raw_data = in_buffer.buffer.clone();
                            }
                        }
                    }
                }
            }
            OpCode::NopIn | OpCode::Reject => {
                response.final_bit = true;
                response.exp_cmd_sn = request.cmd_sn.wrapping_add(1);
            }
            OpCode::ScsiTaskResponse => {
                response.final_bit = true;
                response.exp_cmd_sn = request.cmd_sn.wrapping_add(1);
                response.tmf_result = task.map(|t| t.result).unwrap_or(0);
            }
            OpCode::LogoutResponse => {
                if self.session.is_none() {
                    response.exp_cmd_sn = request.cmd_sn;
                    response.max_cmd_sn = request.cmd_sn;
                }
            }
            _ => {}
        }
        response
    }

    /// Writes a response, fragmenting Data-In into segments of the
    /// initiator's receive limit with `FinalInSeq` raised at burst
    /// boundaries and `Final` plus status on the last segment.
    pub fn transmit_response(&mut self, response: &mut IscsiCommand) -> io::Result<()> {
        if response.opcode != OpCode::ScsiDataIn {
            return self.write_pdu_bytes(response);
        }

        let transfer_length = response.raw_data.len();
        let segment_length = self.max_recv_data_segment_length as usize;
        let max_count = self.max_seq_count;
        response.data_sn = 0;
        let mut offset = 0usize;
        let mut count = 0u32;
        loop {
            response.buffer_offset = offset as u32;
            let last = offset + segment_length >= transfer_length;
            if !last {
                count += 1;
                if count < max_count {
                    response.final_in_seq = false;
                } else {
                    count = 0;
                    response.final_in_seq = true;
                }
                response.final_bit = false;
                response.data_length = segment_length;
            } else {
                response.final_in_seq = true;
                response.final_bit = true;
                response.data_length = transfer_length - offset;
            }
            self.write_pdu_bytes(response)?;
            if last {
                return Ok(());
            }
            offset += segment_length;
            response.data_sn = response.data_sn.wrapping_add(1);
        }
    }

    fn write_pdu_bytes(&mut self, response: &IscsiCommand) -> io::Result<()> {
        self.shared.write_pdu(
            &response.bytes(),
            response.stat_sn,
            response.exp_cmd_sn,
            response.max_cmd_sn,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_sleep_caps_at_step() {
        let step = Duration::from_millis(50);
        let timeout = Duration::from_secs(5);
        let sleep = probe_sleep(timeout, step, Instant::now());
        assert!(sleep <= step);
    }

    #[test]
    fn probe_sleep_shrinks_near_deadline() {
        let step = Duration::from_millis(50);
        let timeout = Duration::from_millis(1);
        std::thread::sleep(Duration::from_millis(2));
        let since = Instant::now() - Duration::from_millis(5);
        assert_eq!(probe_sleep(timeout, step, since), Duration::ZERO);
    }
}
