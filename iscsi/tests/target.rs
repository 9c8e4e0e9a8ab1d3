// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end exercises of the target over a loopback socket, with a scripted
//! initiator: login, capacity read, an R2T-driven write, command reordering,
//! and SendTargets discovery.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use vmm_sys_util::tempdir::TempDir;

use iscsi::IscsiTargetDriver;
use qcow2::ImageFactory;
use scsi::TargetService;

const TARGET_NAME: &str = "iqn.2020-11.io.cloudhypervisor.qcow2:disk0";
const INITIATOR_NAME: &str = "iqn.1993-08.org.debian:01:c0ffee";

struct TestTarget {
    addr: String,
    _dir: TempDir,
}

fn start_target(disk_size: u64) -> TestTarget {
    let dir = TempDir::new().unwrap();
    let image_path = dir.as_path().join("disk0.qcow2");
    ImageFactory::cached()
        .create_image(&image_path, disk_size)
        .unwrap()
        .close()
        .unwrap();

    let service = Arc::new(TargetService::new(ImageFactory::cached()));
    let driver = IscsiTargetDriver::new(service, vec![]);
    driver.new_target(TARGET_NAME).unwrap();
    driver.add_lun(TARGET_NAME, &image_path).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let run_driver = Arc::clone(&driver);
    thread::spawn(move || {
        let _ = run_driver.run(listener);
    });
    TestTarget { addr, _dir: dir }
}

fn key_values(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

fn pad4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

fn send_pdu(stream: &mut TcpStream, mut bhs: [u8; 48], data: &[u8]) {
    let mut dlen = [0u8; 3];
    BigEndian::write_u24(&mut dlen, data.len() as u32);
    bhs[5..8].copy_from_slice(&dlen);
    stream.write_all(&bhs).unwrap();
    let mut padded = data.to_vec();
    padded.resize(pad4(data.len()), 0);
    stream.write_all(&padded).unwrap();
}

fn recv_pdu(stream: &mut TcpStream) -> ([u8; 48], Vec<u8>) {
    let mut bhs = [0u8; 48];
    stream.read_exact(&mut bhs).unwrap();
    let dlen = BigEndian::read_u24(&bhs[5..8]) as usize;
    let mut data = vec![0u8; pad4(dlen)];
    stream.read_exact(&mut data).unwrap();
    data.truncate(dlen);
    (bhs, data)
}

// Logs a normal session in with one operational-stage request, immediate,
// transiting straight to full feature phase.
fn login(stream: &mut TcpStream, cmd_sn: u32) {
    let mut bhs = [0u8; 48];
    bhs[0] = 0x03 | 0x40; // login request, immediate
    bhs[1] = 0x80 | 0x04 | 0x03; // transit, CSG operational, NSG full feature
    bhs[8..14].copy_from_slice(&[0x00, 0x02, 0x3d, 0x00, 0x00, 0x01]); // ISID
    BigEndian::write_u32(&mut bhs[16..20], 1); // ITT
    BigEndian::write_u32(&mut bhs[24..28], cmd_sn);
    let data = key_values(&[
        ("InitiatorName", INITIATOR_NAME),
        ("TargetName", TARGET_NAME),
        ("SessionType", "Normal"),
    ]);
    send_pdu(stream, bhs, &data);

    let (response, _data) = recv_pdu(stream);
    assert_eq!(response[0], 0x23); // login response
    assert_eq!(response[1] & 0x80, 0x80); // transit granted
    assert_eq!(response[1] & 0x03, 0x03); // to full feature phase
    assert_eq!(response[36], 0x00); // status class success
    assert_ne!(BigEndian::read_u16(&response[14..16]), 0); // TSIH assigned
}

fn scsi_command_bhs(itt: u32, cmd_sn: u32, flags: u8, edl: u32, cdb: &[u8]) -> [u8; 48] {
    let mut bhs = [0u8; 48];
    bhs[0] = 0x01;
    bhs[1] = flags;
    bhs[9] = 0; // LUN 0
    BigEndian::write_u32(&mut bhs[16..20], itt);
    BigEndian::write_u32(&mut bhs[20..24], edl);
    BigEndian::write_u32(&mut bhs[24..28], cmd_sn);
    bhs[32..32 + cdb.len()].copy_from_slice(cdb);
    bhs
}

#[test]
fn login_and_read_capacity() {
    // S5: a 1 GiB disk reports last LBA 2097151 and block size 512.
    let target = start_target(1 << 30);
    let mut stream = TcpStream::connect(&target.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    login(&mut stream, 1);

    let mut cdb = [0u8; 10];
    cdb[0] = 0x25; // READ CAPACITY(10)
    let bhs = scsi_command_bhs(2, 1, 0x80 | 0x40, 8, &cdb);
    send_pdu(&mut stream, bhs, &[]);

    let (response, data) = recv_pdu(&mut stream);
    assert_eq!(response[0], 0x25); // Data-In
    assert_eq!(response[1] & 0x80, 0x80); // final
    assert_eq!(response[1] & 0x01, 0x01); // status present
    assert_eq!(response[3], 0x00); // GOOD
    assert_eq!(data.len(), 8);
    assert_eq!(BigEndian::read_u32(&data[0..4]), 2097151);
    assert_eq!(BigEndian::read_u32(&data[4..8]), 512);
}

#[test]
fn r2t_driven_write_then_read_back() {
    // S6: WRITE(10) of 16 blocks with only 8 blocks immediate; the rest is
    // solicited by an R2T.
    let target = start_target(64 << 20);
    let mut stream = TcpStream::connect(&target.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    login(&mut stream, 1);

    let mut cdb = [0u8; 10];
    cdb[0] = 0x2a; // WRITE(10)
    BigEndian::write_u32(&mut cdb[2..6], 0); // LBA 0
    BigEndian::write_u16(&mut cdb[7..9], 16); // 16 blocks
    let bhs = scsi_command_bhs(7, 1, 0x80 | 0x20, 16 * 512, &cdb);
    let immediate = vec![0xabu8; 8 * 512];
    send_pdu(&mut stream, bhs, &immediate);

    // The target solicits the remaining 8 blocks.
    let (r2t, _) = recv_pdu(&mut stream);
    assert_eq!(r2t[0], 0x31);
    assert_eq!(BigEndian::read_u32(&r2t[16..20]), 7); // same task
    assert_eq!(BigEndian::read_u32(&r2t[40..44]), 8 * 512); // buffer offset
    assert_eq!(BigEndian::read_u32(&r2t[44..48]), 8 * 512); // desired length

    let mut data_out = [0u8; 48];
    data_out[0] = 0x05;
    data_out[1] = 0x80; // final
    BigEndian::write_u32(&mut data_out[16..20], 7);
    BigEndian::write_u32(&mut data_out[40..44], 8 * 512);
    let solicited = vec![0xcdu8; 8 * 512];
    send_pdu(&mut stream, data_out, &solicited);

    let (response, _) = recv_pdu(&mut stream);
    assert_eq!(response[0], 0x21); // SCSI response
    assert_eq!(response[3], 0x00); // GOOD

    // Read the 16 blocks back and check both halves.
    let mut cdb = [0u8; 10];
    cdb[0] = 0x28; // READ(10)
    BigEndian::write_u16(&mut cdb[7..9], 16);
    let bhs = scsi_command_bhs(8, 3, 0x80 | 0x40, 16 * 512, &cdb);
    send_pdu(&mut stream, bhs, &[]);
    let (response, data) = recv_pdu(&mut stream);
    assert_eq!(response[0], 0x25);
    assert_eq!(response[3], 0x00);
    assert_eq!(data.len(), 16 * 512);
    assert!(data[..8 * 512].iter().all(|&b| b == 0xab));
    assert!(data[8 * 512..].iter().all(|&b| b == 0xcd));
}

#[test]
fn out_of_order_commands_execute_in_cmd_sn_order() {
    // S7: arrivals 3, 1, 2 (as CmdSN offsets) complete in CmdSN order.
    let target = start_target(16 << 20);
    let mut stream = TcpStream::connect(&target.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    login(&mut stream, 1);

    let tur = [0u8; 10]; // TEST UNIT READY
    // CmdSN 3 arrives first and must wait.
    send_pdu(&mut stream, scsi_command_bhs(0x33, 3, 0x80, 0, &tur), &[]);
    // CmdSN 1 executes immediately.
    send_pdu(&mut stream, scsi_command_bhs(0x11, 1, 0x80, 0, &tur), &[]);
    // CmdSN 2 unblocks 3.
    send_pdu(&mut stream, scsi_command_bhs(0x22, 2, 0x80, 0, &tur), &[]);

    let mut tags = Vec::new();
    for _ in 0..3 {
        let (response, _) = recv_pdu(&mut stream);
        assert_eq!(response[0], 0x21);
        assert_eq!(response[3], 0x00);
        tags.push(BigEndian::read_u32(&response[16..20]));
    }
    assert_eq!(tags, vec![0x11, 0x22, 0x33]);
}

#[test]
fn discovery_send_targets() {
    let target = start_target(16 << 20);
    let mut stream = TcpStream::connect(&target.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Discovery login.
    let mut bhs = [0u8; 48];
    bhs[0] = 0x03 | 0x40;
    bhs[1] = 0x80 | 0x04 | 0x03;
    bhs[8..14].copy_from_slice(&[0x00, 0x02, 0x3d, 0x00, 0x00, 0x02]);
    BigEndian::write_u32(&mut bhs[16..20], 1);
    BigEndian::write_u32(&mut bhs[24..28], 1);
    let data = key_values(&[
        ("InitiatorName", INITIATOR_NAME),
        ("SessionType", "Discovery"),
    ]);
    send_pdu(&mut stream, bhs, &data);
    let (response, _) = recv_pdu(&mut stream);
    assert_eq!(response[0], 0x23);
    assert_eq!(response[36], 0x00);

    // SendTargets=All returns the target and its portal.
    let mut text = [0u8; 48];
    text[0] = 0x04;
    text[1] = 0x80;
    BigEndian::write_u32(&mut text[16..20], 2);
    BigEndian::write_u32(&mut text[24..28], 2);
    send_pdu(&mut stream, text, &key_values(&[("SendTargets", "All")]));

    let (response, data) = recv_pdu(&mut stream);
    assert_eq!(response[0], 0x24); // text response
    let text = String::from_utf8_lossy(&data);
    assert!(text.contains(&format!("TargetName={TARGET_NAME}")));
    assert!(text.contains("TargetAddress="));
    assert!(text.contains(",1")); // portal group tag
}

#[test]
fn abort_unknown_task_reports_no_task() {
    let target = start_target(16 << 20);
    let mut stream = TcpStream::connect(&target.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    login(&mut stream, 1);

    let mut bhs = [0u8; 48];
    bhs[0] = 0x02 | 0x40; // task management, immediate
    bhs[1] = 0x80 | 1; // final, ABORT TASK
    BigEndian::write_u32(&mut bhs[16..20], 9);
    BigEndian::write_u32(&mut bhs[20..24], 0xdead); // referenced task
    BigEndian::write_u32(&mut bhs[24..28], 1);
    send_pdu(&mut stream, bhs, &[]);

    let (response, _) = recv_pdu(&mut stream);
    assert_eq!(response[0], 0x22); // TMF response
    assert_eq!(response[2], 0x01); // no task
}
