// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The admin control plane: newline-delimited JSON requests over a local
//! UNIX socket, serialized by a process-wide admin mutex so every command
//! observes a consistent target registry.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};

use iscsi::IscsiTargetDriver;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum RequestType {
    #[serde(rename = "ATTACH")]
    Attach,
    #[serde(rename = "DETACHLUN")]
    DetachLun,
    #[serde(rename = "ADDTARGET")]
    AddTarget,
    #[serde(rename = "DELETETARGET")]
    DeleteTarget,
    #[serde(rename = "CLEARTARGET")]
    ClearTarget,
    #[serde(rename = "LIST")]
    List,
}

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub request_type: RequestType,
    #[serde(default)]
    pub command: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub error: Option<String>,
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AttachCommand {
    target_name: String,
    disk_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DetachLunCommand {
    target_name: String,
    lun_id: u8,
}

#[derive(Debug, Deserialize)]
struct TargetNameCommand {
    target_name: String,
}

/// The admin socket server. One thread per inbound request stream; a single
/// mutex serializes command execution.
pub struct ApiServer {
    driver: Arc<IscsiTargetDriver>,
    admin_lock: Mutex<()>,
}

impl ApiServer {
    pub fn new(driver: Arc<IscsiTargetDriver>) -> Arc<ApiServer> {
        Arc::new(ApiServer {
            driver,
            admin_lock: Mutex::new(()),
        })
    }

    /// Binds the UNIX socket (replacing a stale one) and serves forever.
    pub fn serve(self: Arc<Self>, socket_path: &Path) -> std::io::Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!("admin API listening on {}", socket_path.display());
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self);
                    thread::spawn(move || server.handle_client(stream));
                }
                Err(e) => warn!("admin accept failed: {e}"),
            }
        }
        Ok(())
    }

    fn handle_client(&self, stream: UnixStream) {
        let mut writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                warn!("admin connection setup failed: {e}");
                return;
            }
        };
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => return,
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch_line(&line);
            let mut serialized = match serde_json::to_vec(&response) {
                Ok(serialized) => serialized,
                Err(e) => {
                    warn!("failed to serialize admin response: {e}");
                    return;
                }
            };
            serialized.push(b'\n');
            if writer.write_all(&serialized).is_err() {
                return;
            }
        }
    }

    fn dispatch_line(&self, line: &str) -> Response {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return Response {
                    request_type: RequestType::List,
                    error: Some(format!("malformed request: {e}")),
                    result: serde_json::Value::Null,
                }
            }
        };
        let request_type = request.request_type;
        // Admin commands run one at a time.
        let _admin = self.admin_lock.lock().unwrap();
        let result = self.execute(request);
        match result {
            Ok(result) => Response {
                request_type,
                error: None,
                result,
            },
            Err(error) => Response {
                request_type,
                error: Some(error),
                result: serde_json::Value::Null,
            },
        }
    }

    fn execute(&self, request: Request) -> Result<serde_json::Value, String> {
        match request.request_type {
            RequestType::Attach => {
                let command: AttachCommand =
                    serde_json::from_value(request.command).map_err(|e| e.to_string())?;
                if !command.disk_path.is_absolute() {
                    return Err(format!(
                        "disk path must be absolute: {}",
                        command.disk_path.display()
                    ));
                }
                let lun_id = self
                    .driver
                    .add_lun(&command.target_name, &command.disk_path)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "lun_id": lun_id }))
            }
            RequestType::DetachLun => {
                let command: DetachLunCommand =
                    serde_json::from_value(request.command).map_err(|e| e.to_string())?;
                let path = self
                    .driver
                    .remove_lun(&command.target_name, command.lun_id)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "disk_path": path }))
            }
            RequestType::AddTarget => {
                let command: TargetNameCommand =
                    serde_json::from_value(request.command).map_err(|e| e.to_string())?;
                self.driver
                    .new_target(&command.target_name)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            }
            RequestType::DeleteTarget => {
                let command: TargetNameCommand =
                    serde_json::from_value(request.command).map_err(|e| e.to_string())?;
                self.driver
                    .delete_target(&command.target_name)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            }
            RequestType::ClearTarget => {
                let command: TargetNameCommand =
                    serde_json::from_value(request.command).map_err(|e| e.to_string())?;
                let paths = self
                    .driver
                    .clear_target(&command.target_name)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "disk_paths": paths }))
            }
            RequestType::List => {
                serde_json::to_value(self.driver.list()).map_err(|e| e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request: Request = serde_json::from_str(
            r#"{"type": "ATTACH", "command": {"target_name": "iqn.test:a", "disk_path": "/var/lib/disk.qcow2"}}"#,
        )
        .unwrap();
        assert_eq!(request.request_type, RequestType::Attach);
        let command: AttachCommand = serde_json::from_value(request.command).unwrap();
        assert_eq!(command.target_name, "iqn.test:a");
        assert_eq!(command.disk_path, PathBuf::from("/var/lib/disk.qcow2"));
    }

    #[test]
    fn response_serializes_with_type_tag() {
        let response = Response {
            request_type: RequestType::List,
            error: None,
            result: serde_json::json!({"targets": []}),
        };
        let serialized = serde_json::to_string(&response).unwrap();
        assert!(serialized.contains(r#""type":"LIST""#));
        assert!(serialized.contains(r#""error":null"#));
    }

    #[test]
    fn detach_lun_id_fits_a_byte() {
        let command: Result<DetachLunCommand, _> = serde_json::from_value(serde_json::json!({
            "target_name": "iqn.test:a",
            "lun_id": 300,
        }));
        assert!(command.is_err());
    }
}
