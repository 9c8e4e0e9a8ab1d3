// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! qcow2target: exports QCOW2 disk images as iSCSI logical units.

#[macro_use]
extern crate log;

mod api;

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::thread;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use thiserror::Error;

use iscsi::IscsiTargetDriver;
use qcow2::ImageFactory;
use scsi::TargetService;

use crate::api::ApiServer;

#[derive(Error, Debug)]
enum Error {
    #[error("failed to create log file: {0}")]
    LogFileCreation(#[source] std::io::Error),
    #[error("failed to install the logger: {0}")]
    LoggerSetup(#[source] log::SetLoggerError),
    #[error("failed to serve the admin API socket: {0}")]
    ApiSocket(#[source] std::io::Error),
    #[error("failed to serve the iSCSI portal: {0}")]
    Serving(#[source] std::io::Error),
}

struct Logger {
    output: Mutex<Box<dyn std::io::Write + Send>>,
    start: std::time::Instant,
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = std::time::Instant::now();
        let duration = now.duration_since(self.start);

        if record.file().is_some() && record.line().is_some() {
            write!(
                *(*(self.output.lock().unwrap())),
                "qcow2target: {:.6?}: <{}> {}:{}:{} -- {}\r\n",
                duration,
                std::thread::current().name().unwrap_or("anonymous"),
                record.level(),
                record.file().unwrap(),
                record.line().unwrap(),
                record.args()
            )
        } else {
            write!(
                *(*(self.output.lock().unwrap())),
                "qcow2target: {:.6?}: <{}> {}:{} -- {}\r\n",
                duration,
                std::thread::current().name().unwrap_or("anonymous"),
                record.level(),
                record.target(),
                record.args()
            )
        }
        .ok();
    }

    fn flush(&self) {}
}

fn create_app() -> Command {
    Command::new("qcow2target")
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Export QCOW2 disk images as iSCSI logical units.")
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("iSCSI portal address to listen on")
                .default_value("0.0.0.0:3260")
                .num_args(1),
        )
        .arg(
            Arg::new("api-socket")
                .long("api-socket")
                .help("Path of the admin API UNIX socket")
                .num_args(1),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Log file. Standard error is used if not specified")
                .num_args(1),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of debugging output"),
        )
}

fn start_target(cmd_arguments: ArgMatches) -> Result<(), Error> {
    let log_level = match cmd_arguments.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let log_file: Box<dyn std::io::Write + Send> =
        if let Some(ref file) = cmd_arguments.get_one::<String>("log-file") {
            Box::new(
                std::fs::File::create(std::path::Path::new(file)).map_err(Error::LogFileCreation)?,
            )
        } else {
            Box::new(std::io::stderr())
        };

    log::set_boxed_logger(Box::new(Logger {
        output: Mutex::new(log_file),
        start: std::time::Instant::now(),
    }))
    .map(|()| log::set_max_level(log_level))
    .map_err(Error::LoggerSetup)?;

    // The listen address is safe to unwrap: clap supplies the default.
    let listen = cmd_arguments.get_one::<String>("listen").unwrap().clone();

    let service = Arc::new(TargetService::new(ImageFactory::cached()));
    let driver = IscsiTargetDriver::new(service, vec![listen.clone()]);

    if let Some(socket) = cmd_arguments.get_one::<String>("api-socket") {
        let socket_path = PathBuf::from(socket);
        let api_server = ApiServer::new(Arc::clone(&driver));
        thread::Builder::new()
            .name("admin-api".to_string())
            .spawn(move || {
                if let Err(e) = api_server.serve(&socket_path) {
                    error!("admin API server failed: {e}");
                }
            })
            .map_err(Error::ApiSocket)?;
    }

    driver.serve(&listen).map_err(Error::Serving)
}

fn main() {
    let cmd_arguments = create_app().get_matches();
    if let Err(e) = start_target(cmd_arguments) {
        eprintln!("qcow2target: {e}");
        process::exit(1);
    }
}
