//! ZKTeco binary protocol: constants, packet encoding/decoding
//!
//! Wire-compatible with pyzk and node-zklib clients.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::types::{AttendanceRecord, User};

/// ZKTeco protocol command codes
#[allow(dead_code)]
pub mod cmd {
    pub const CMD_CONNECT: u16 = 1000;
    pub const CMD_EXIT: u16 = 1001;
    pub const CMD_ENABLEDEVICE: u16 = 1002;
    pub const CMD_DISABLEDEVICE: u16 = 1003;
    pub const CMD_RESTART: u16 = 1004;
    pub const CMD_POWEROFF: u16 = 1005;
    pub const CMD_GET_VERSION: u16 = 1100;
    pub const CMD_AUTH: u16 = 1102;
    pub const CMD_PREPARE_DATA: u16 = 1500;
    pub const CMD_DATA: u16 = 1501;
    pub const CMD_FREE_DATA: u16 = 1502;
    pub const CMD_PREPARE_BUFFER: u16 = 1503;
    pub const CMD_READ_BUFFER: u16 = 1504;
    pub const CMD_DB_RRQ: u16 = 7;
    pub const CMD_USER_WRQ: u16 = 8;
    pub const CMD_USERTEMP_RRQ: u16 = 9;
    pub const CMD_OPTIONS_RRQ: u16 = 11;
    pub const CMD_OPTIONS_WRQ: u16 = 12;
    pub const CMD_ATTLOG_RRQ: u16 = 13;
    pub const CMD_CLEAR_ATTLOG: u16 = 15;
    pub const CMD_DELETE_USER: u16 = 18;
    pub const CMD_DELETE_USERTEMP: u16 = 19;
    pub const CMD_UNLOCK: u16 = 31;
    pub const CMD_GET_FREE_SIZES: u16 = 50;
    pub const CMD_STARTVERIFY: u16 = 60;
    pub const CMD_STARTENROLL: u16 = 61;
    pub const CMD_CANCELCAPTURE: u16 = 62;
    pub const CMD_GET_PINWIDTH: u16 = 69;
    pub const CMD_GET_USERTEMP: u16 = 88;
    pub const CMD_SAVE_USERTEMPS: u16 = 110;
    pub const CMD_GET_TIME: u16 = 201;
    pub const CMD_SET_TIME: u16 = 202;
    pub const CMD_REG_EVENT: u16 = 500;
    pub const CMD_REFRESHDATA: u16 = 1013;
    pub const CMD_TESTVOICE: u16 = 1017;

    // Response codes
    pub const CMD_ACK_OK: u16 = 2000;
    pub const CMD_ACK_ERROR: u16 = 2001;
    pub const CMD_ACK_DATA: u16 = 2002;
    pub const CMD_ACK_UNAUTH: u16 = 2005;
    pub const CMD_ACK_UNKNOWN: u16 = 0xFFFF;
}

/// Function types for PREPARE_BUFFER / SAVE_USERTEMPS
pub const FCT_ATTLOG: u32 = 1;
pub const FCT_FINGERTMP: u32 = 2;
pub const FCT_USER: u32 = 5;

pub const USHRT_MAX: u32 = 65535;
pub const MAX_CHUNK: usize = 65472;

/// TCP stream-envelope prefix bytes
pub const TCP_PREFIX: [u8; 4] = [0x50, 0x50, 0x82, 0x7d];
/// Stream-envelope header size: 4 magic bytes + u32 inner length
pub const TCP_HEADER_LEN: usize = 8;
/// Inner packet header size: cmd + checksum + session + reply, all u16 LE
pub const PACKET_HEADER_LEN: usize = 8;

pub const USER_RECORD_72: usize = 72;
pub const USER_RECORD_28: usize = 28;
pub const ATT_RECORD_40: usize = 40;

/// Compute ZKTeco checksum over a packet buffer
///
/// The buffer must carry zeroes in its checksum field.
pub fn create_checksum(buf: &[u8]) -> u16 {
    let mut chksum: u32 = 0;
    let mut i = 0;
    while i < buf.len() {
        if i == buf.len() - 1 {
            chksum += buf[i] as u32;
        } else {
            chksum += u16::from_le_bytes([buf[i], buf[i + 1]]) as u32;
        }
        chksum %= USHRT_MAX;
        i += 2;
    }
    chksum = USHRT_MAX - chksum - 1;
    chksum as u16
}

/// One inner protocol packet: 8-byte header + payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u16,
    pub checksum: u16,
    pub session_id: u16,
    pub reply_id: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with its checksum filled in
    pub fn new(command: u16, session_id: u16, reply_id: u16, payload: Vec<u8>) -> Self {
        let mut packet = Self {
            command,
            checksum: 0,
            session_id,
            reply_id,
            payload,
        };
        packet.checksum = create_checksum(&packet.encode_with_checksum(0));
        packet
    }

    fn encode_with_checksum(&self, checksum: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.command.to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf.extend_from_slice(&self.session_id.to_le_bytes());
        buf.extend_from_slice(&self.reply_id.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Serialize the packet (header + payload, no stream envelope)
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_checksum(self.checksum)
    }

    /// Parse a packet from raw bytes (header + payload, no stream envelope)
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < PACKET_HEADER_LEN {
            return None;
        }
        Some(Self {
            command: u16::from_le_bytes([data[0], data[1]]),
            checksum: u16::from_le_bytes([data[2], data[3]]),
            session_id: u16::from_le_bytes([data[4], data[5]]),
            reply_id: u16::from_le_bytes([data[6], data[7]]),
            payload: data[PACKET_HEADER_LEN..].to_vec(),
        })
    }

    /// Recompute the checksum and compare against the stored field
    pub fn verify_checksum(&self) -> bool {
        create_checksum(&self.encode_with_checksum(0)) == self.checksum
    }
}

/// Wrap an encoded packet in the TCP stream envelope:
/// `50 50 82 7d <len: u32 LE> <packet>`
pub fn encode_tcp(packet: &Packet) -> Vec<u8> {
    let inner = packet.encode();
    let mut buf = Vec::with_capacity(TCP_HEADER_LEN + inner.len());
    buf.extend_from_slice(&TCP_PREFIX);
    buf.extend_from_slice(&(inner.len() as u32).to_le_bytes());
    buf.extend_from_slice(&inner);
    buf
}

/// Validate a stream-envelope header and return the inner packet length.
/// Returns `None` when the magic bytes mismatch.
pub fn decode_tcp_length(header: &[u8; TCP_HEADER_LEN]) -> Option<usize> {
    if header[0..4] != TCP_PREFIX {
        return None;
    }
    Some(u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize)
}

// ============================================================================
// Timestamp codec
// ============================================================================

/// Encode a datetime to the packed device format
pub fn encode_time(dt: &NaiveDateTime) -> u32 {
    let date = ((dt.year() as u32 % 100) * 12 * 31 + (dt.month() - 1) * 31 + dt.day() - 1)
        * (24 * 60 * 60);
    date + (dt.hour() * 60 + dt.minute()) * 60 + dt.second()
}

/// Decode a packed device timestamp. Returns `None` for byte patterns
/// that name an impossible date (e.g. Feb 31).
pub fn decode_time(mut t: u32) -> Option<NaiveDateTime> {
    let second = t % 60;
    t /= 60;
    let minute = t % 60;
    t /= 60;
    let hour = t % 24;
    t /= 24;
    let day = t % 31 + 1;
    t /= 31;
    let month = t % 12 + 1;
    t /= 12;
    let year = (t + 2000) as i32;

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

// ============================================================================
// Record codecs
// ============================================================================

/// Extract a NUL-terminated ASCII string from a byte slice
pub fn extract_ascii_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_string()
}

/// Copy a string into a fixed-size NUL-padded field, truncating if needed
fn put_ascii(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Encode a user as a 72-byte record:
/// `<uid:2><privilege:1><password:8><name:24><card:4><pad:1><group:7><pad:1><user_id:24>`
pub fn encode_user_72(user: &User) -> [u8; USER_RECORD_72] {
    let mut buf = [0u8; USER_RECORD_72];
    buf[0..2].copy_from_slice(&user.uid.to_le_bytes());
    buf[2] = user.privilege;
    put_ascii(&mut buf[3..11], &user.password);
    put_ascii(&mut buf[11..35], &user.name);
    buf[35..39].copy_from_slice(&user.card.to_le_bytes());
    put_ascii(&mut buf[40..47], &user.group);
    put_ascii(&mut buf[48..72], &user.user_id);
    buf
}

/// Decode a 72-byte user record
pub fn decode_user_72(data: &[u8]) -> User {
    User {
        uid: u16::from_le_bytes([data[0], data[1]]),
        privilege: data[2],
        password: extract_ascii_string(&data[3..11]),
        name: extract_ascii_string(&data[11..35]),
        card: u32::from_le_bytes([data[35], data[36], data[37], data[38]]),
        group: extract_ascii_string(&data[40..47]),
        user_id: extract_ascii_string(&data[48..72]),
    }
}

/// Decode a 28-byte user record:
/// `<uid:2><privilege:1><password:5><name:8><card:4><pad:1><group:1><tz:2><user_id:4>`
pub fn decode_user_28(data: &[u8]) -> User {
    User {
        uid: u16::from_le_bytes([data[0], data[1]]),
        privilege: data[2],
        password: extract_ascii_string(&data[3..8]),
        name: extract_ascii_string(&data[8..16]),
        card: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
        group: data[21].to_string(),
        user_id: u32::from_le_bytes([data[24], data[25], data[26], data[27]]).to_string(),
    }
}

/// Encode an attendance record as 40 bytes:
/// `<uid:2><user_id:24><status:1><timestamp:4><punch:1><pad:8>`
pub fn encode_attendance_40(record: &AttendanceRecord) -> [u8; ATT_RECORD_40] {
    let mut buf = [0u8; ATT_RECORD_40];
    buf[0..2].copy_from_slice(&record.uid.to_le_bytes());
    put_ascii(&mut buf[2..26], &record.user_id);
    buf[26] = record.status;
    buf[27..31].copy_from_slice(&record.timestamp.to_le_bytes());
    buf[31] = record.punch;
    buf
}

/// Encode one template list entry:
/// `<size:2><uid:2><finger:1><valid:1><blob>` where size counts the whole entry
pub fn encode_template_entry(uid: u16, finger: u8, valid: u8, template: &[u8]) -> Vec<u8> {
    let size = (template.len() + 6) as u16;
    let mut buf = Vec::with_capacity(size as usize);
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&uid.to_le_bytes());
    buf.push(finger);
    buf.push(valid);
    buf.extend_from_slice(template);
    buf
}

/// Map an ack command code to its protocol name
pub fn command_name(cmd_id: u16) -> &'static str {
    match cmd_id {
        2000 => "CMD_ACK_OK",
        2001 => "CMD_ACK_ERROR",
        2002 => "CMD_ACK_DATA",
        2003 => "CMD_ACK_RETRY",
        2004 => "CMD_ACK_REPEAT",
        2005 => "CMD_ACK_UNAUTH",
        0xFFFF => "CMD_ACK_UNKNOWN",
        0xFFFD => "CMD_ACK_ERROR_CMD",
        0xFFFC => "CMD_ACK_ERROR_INIT",
        0xFFFB => "CMD_ACK_ERROR_DATA",
        _ => "UNKNOWN_COMMAND",
    }
}
