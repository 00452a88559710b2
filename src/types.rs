//! Simulator configuration and device data types

use serde::{Deserialize, Serialize};

/// Simulator configuration (constructor parameters for [`crate::Simulator`])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Device comm key; 0 means no password and CONNECT answers OK directly
    #[serde(default)]
    pub password: u32,
    #[serde(default)]
    pub use_udp: bool,
    #[serde(default = "default_firmware")]
    pub firmware_version: String,
    #[serde(default = "default_serial")]
    pub serial_number: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_mac")]
    pub mac_address: String,
    /// Pacing between enrollment event pushes; ordering, not timing, is the
    /// protocol contract, so tests set this to 0
    #[serde(default = "default_enroll_delay")]
    pub enroll_step_delay_ms: u64,
    #[serde(default = "default_users_capacity")]
    pub users_capacity: u32,
    #[serde(default = "default_fingers_capacity")]
    pub fingers_capacity: u32,
    #[serde(default = "default_records_capacity")]
    pub records_capacity: u32,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4370
}

fn default_firmware() -> String {
    "Ver 6.60 Nov 13 2019".to_string()
}

fn default_serial() -> String {
    "DGD9190019050335743".to_string()
}

fn default_platform() -> String {
    "ZEM560".to_string()
}

fn default_device_name() -> String {
    "ZKTeco Device".to_string()
}

fn default_mac() -> String {
    "00:17:61:C8:EC:17".to_string()
}

fn default_enroll_delay() -> u64 {
    300
}

fn default_users_capacity() -> u32 {
    3000
}

fn default_fingers_capacity() -> u32 {
    10000
}

fn default_records_capacity() -> u32 {
    100000
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            password: 0,
            use_udp: false,
            firmware_version: default_firmware(),
            serial_number: default_serial(),
            platform: default_platform(),
            device_name: default_device_name(),
            mac_address: default_mac(),
            enroll_step_delay_ms: default_enroll_delay(),
            users_capacity: default_users_capacity(),
            fingers_capacity: default_fingers_capacity(),
            records_capacity: default_records_capacity(),
        }
    }
}

/// A user record held by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u16,
    /// 0 = user, 14 = admin
    pub privilege: u8,
    /// At most 8 bytes on the wire
    pub password: String,
    /// At most 24 bytes on the wire
    pub name: String,
    pub card: u32,
    /// At most 7 bytes on the wire
    pub group: String,
    /// External user identifier, at most 24 bytes, usually numeric
    pub user_id: String,
}

/// A fingerprint template keyed by `(uid, finger)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerTemplate {
    pub uid: u16,
    /// Finger index 0-9
    pub finger: u8,
    pub valid: u8,
    pub template: Vec<u8>,
}

/// One attendance punch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub uid: u16,
    pub user_id: String,
    /// Packed device timestamp, see [`crate::protocol::encode_time`]
    pub timestamp: u32,
    pub status: u8,
    pub punch: u8,
}
