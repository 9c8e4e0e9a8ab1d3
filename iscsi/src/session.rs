// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Session state: sequence number bookkeeping, the CmdSN-ordered pending
//! task queue, and the table of write tasks awaiting solicited Data-Out.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use scsi::ScsiCommand;

use crate::connection::ConnShared;
use crate::login::SessionType;
use crate::pdu::IscsiCommand;
use crate::target::IscsiTarget;

/// TSIH values that are never allocated.
pub const TSIH_UNSPECIFIED: u16 = 0;
pub const TSIH_MAX: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Scsi,
}

/// One in-flight command: the request PDU it came from, the SCSI command
/// built from it, and the Data-Out bookkeeping for solicited writes.
#[derive(Debug)]
pub struct IscsiTask {
    pub tag: u32,
    pub pdu: IscsiCommand,
    pub scsi_command: Option<ScsiCommand>,
    pub state: TaskState,
    /// Bytes of write data received so far; the copy offset for Data-Out.
    pub offset: usize,
    /// Bytes of write data still to be solicited.
    pub r2t_count: i64,
    pub unsol_count: u32,
    pub r2t_sn: u32,
    pub expected_data_length: u64,
    /// Task management response code, for TMF tasks.
    pub result: u8,
}

impl IscsiTask {
    pub fn new(pdu: IscsiCommand, scsi_command: Option<ScsiCommand>) -> IscsiTask {
        IscsiTask {
            tag: pdu.task_tag,
            pdu,
            scsi_command,
            state: TaskState::Pending,
            offset: 0,
            r2t_count: 0,
            unsol_count: 0,
            r2t_sn: 0,
            expected_data_length: 0,
            result: 0,
        }
    }

    pub fn cmd_sn(&self) -> u32 {
        self.pdu.cmd_sn
    }
}

// Heap entry ordered by CmdSN only.
struct QueuedTask(IscsiTask);

impl PartialEq for QueuedTask {
    fn eq(&self, other: &QueuedTask) -> bool {
        self.0.cmd_sn() == other.0.cmd_sn()
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &QueuedTask) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &QueuedTask) -> Ordering {
        self.0.cmd_sn().cmp(&other.0.cmd_sn())
    }
}

/// Priority queue of commands that arrived ahead of their turn, popped in
/// CmdSN order, smallest first.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<QueuedTask>>,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue::default()
    }

    pub fn push(&mut self, task: IscsiTask) {
        self.heap.push(Reverse(QueuedTask(task)));
    }

    /// Removes and returns the task with the smallest CmdSN.
    pub fn pop(&mut self) -> Option<IscsiTask> {
        self.heap.pop().map(|Reverse(QueuedTask(task))| task)
    }

    /// CmdSN of the task that would be popped next.
    pub fn next_cmd_sn(&self) -> Option<u32> {
        self.heap.peek().map(|Reverse(QueuedTask(task))| task.cmd_sn())
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes the task with the given initiator task tag, wherever it sits
    /// in the queue.
    pub fn remove_by_tag(&mut self, tag: u32) -> Option<IscsiTask> {
        let mut removed = None;
        let drained = std::mem::take(&mut self.heap);
        for Reverse(QueuedTask(task)) in drained {
            if removed.is_none() && task.tag == tag {
                removed = Some(task);
            } else {
                self.push(task);
            }
        }
        removed
    }
}

// Mutable sequence state shared by a session's connections.
#[derive(Debug)]
pub struct SessionSequence {
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

/// One iSCSI session: the IT nexus between an initiator and a target (or the
/// discovery service), carrying its negotiated parameters and command queue.
pub struct IscsiSession {
    pub initiator: String,
    pub initiator_alias: String,
    pub target: Option<Arc<IscsiTarget>>,
    pub target_name: String,
    pub isid: u64,
    pub tsih: u16,
    pub tpgt: u16,
    pub session_type: SessionType,
    pub max_queue_command: u32,
    pub params: Vec<u32>,
    pub it_nexus_id: Mutex<Option<uuid::Uuid>>,

    pub sequence: Mutex<SessionSequence>,
    pub pending_tasks: Mutex<TaskQueue>,
    /// Write tasks waiting for more Data-Out, keyed by initiator task tag.
    pub outstanding_tasks: Mutex<HashMap<u32, IscsiTask>>,
    pub connections: RwLock<HashMap<u16, Arc<ConnShared>>>,
}

impl IscsiSession {
    pub fn exp_cmd_sn(&self) -> u32 {
        self.sequence.lock().unwrap().exp_cmd_sn
    }

    pub fn max_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn() + self.max_queue_command
    }

    pub fn register_connection(&self, connection_id: u16, shared: Arc<ConnShared>) {
        self.connections
            .write()
            .unwrap()
            .insert(connection_id, shared);
    }

    pub fn connection(&self, connection_id: u16) -> Option<Arc<ConnShared>> {
        self.connections.read().unwrap().get(&connection_id).cloned()
    }

    /// Closes every connection bound to this session.
    pub fn close_connections(&self) {
        let mut connections = self.connections.write().unwrap();
        for shared in connections.values() {
            shared.close();
        }
        connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::OpCode;

    fn task(cmd_sn: u32, tag: u32) -> IscsiTask {
        let pdu = IscsiCommand {
            opcode: OpCode::ScsiCommand,
            cmd_sn,
            task_tag: tag,
            ..Default::default()
        };
        IscsiTask::new(pdu, None)
    }

    #[test]
    fn pops_smallest_cmd_sn_first() {
        let mut queue = TaskQueue::new();
        queue.push(task(7, 1));
        queue.push(task(5, 2));
        queue.push(task(6, 3));
        assert_eq!(queue.next_cmd_sn(), Some(5));
        assert_eq!(queue.pop().unwrap().cmd_sn(), 5);
        assert_eq!(queue.pop().unwrap().cmd_sn(), 6);
        assert_eq!(queue.pop().unwrap().cmd_sn(), 7);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn remove_by_tag_keeps_order() {
        let mut queue = TaskQueue::new();
        queue.push(task(5, 100));
        queue.push(task(6, 101));
        queue.push(task(7, 102));
        let removed = queue.remove_by_tag(101).unwrap();
        assert_eq!(removed.cmd_sn(), 6);
        assert!(queue.remove_by_tag(101).is_none());
        assert_eq!(queue.pop().unwrap().cmd_sn(), 5);
        assert_eq!(queue.pop().unwrap().cmd_sn(), 7);
    }
}
