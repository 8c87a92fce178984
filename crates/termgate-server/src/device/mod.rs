//! Device directory and private key decryption ports.

use crate::config::DeviceEntry;
use std::collections::HashMap;
use parking_lot::RwLock;
use termgate_core::{DeviceStatus, GateError, GateResult};

/// How to reach and log into an appliance.
#[derive(Clone)]
pub struct DeviceCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Key material as stored, decrypted through a [`KeyDecryptor`].
    pub private_key: Option<String>,
}

impl std::fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub status: DeviceStatus,
    pub credentials: DeviceCredentials,
}

/// Read access to the device inventory.
pub trait DeviceDirectory: Send + Sync {
    fn device(&self, id: &str) -> Option<DeviceRecord>;

    /// Current status of every known device.
    fn statuses(&self) -> Vec<(String, DeviceStatus)>;
}

/// Turns stored key material into a usable PEM key.
pub trait KeyDecryptor: Send + Sync {
    fn decrypt(&self, material: &str) -> GateResult<String>;
}

/// Accepts plaintext PEM keys as-is and rejects anything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct PemKeyDecryptor;

impl KeyDecryptor for PemKeyDecryptor {
    fn decrypt(&self, material: &str) -> GateResult<String> {
        let trimmed = material.trim();
        if trimmed.starts_with("-----BEGIN") && trimmed.contains("PRIVATE KEY-----") {
            Ok(format!("{trimmed}\n"))
        } else {
            Err(GateError::KeyDecryption(
                "key material is not a PEM private key".to_string(),
            ))
        }
    }
}

/// Inventory loaded from `[[devices]]`. Status can be changed at runtime.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl StaticDirectory {
    pub fn new(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            devices: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    pub fn from_entries(entries: &[DeviceEntry]) -> Self {
        Self::new(entries.iter().map(|e| DeviceRecord {
            id: e.id.clone(),
            name: e.name.clone().unwrap_or_else(|| e.id.clone()),
            status: parse_status(&e.status),
            credentials: DeviceCredentials {
                host: e.host.clone(),
                port: e.port,
                username: e.username.clone(),
                password: e.password.clone(),
                private_key: e.private_key.clone(),
            },
        }))
    }

    /// Returns true if the status changed.
    pub fn set_status(&self, id: &str, status: DeviceStatus) -> bool {
        let mut devices = self.devices.write();
        match devices.get_mut(id) {
            Some(record) if record.status != status => {
                record.status = status;
                true
            }
            _ => false,
        }
    }
}

impl DeviceDirectory for StaticDirectory {
    fn device(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(id).cloned()
    }

    fn statuses(&self) -> Vec<(String, DeviceStatus)> {
        self.devices
            .read()
            .values()
            .map(|r| (r.id.clone(), r.status))
            .collect()
    }
}

fn parse_status(s: &str) -> DeviceStatus {
    match s.to_ascii_lowercase().as_str() {
        "online" => DeviceStatus::Online,
        "offline" => DeviceStatus::Offline,
        _ => DeviceStatus::Unknown,
    }
}
