//! Per-connection session engine
//!
//! The dispatcher itself does no socket IO: the transport layer hands it one
//! [`Packet`] at a time and sends back whatever [`Dispatch`] says. The two
//! multi-packet sub-protocols live here too: the enrollment event stream
//! (pushed on the same connection, ack-gated) and the PREPARE_DATA / DATA /
//! SAVE_USERTEMPS bulk upload.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::device::{CapacitySnapshot, DeviceModel, SharedModel};
use crate::error::SimulatorError;
use crate::protocol::{self, cmd, Packet};
use crate::types::{FingerTemplate, SimulatorConfig, User};

/// Session id handed out when the client connects with session 0
pub const DEFAULT_SESSION_ID: u16 = 1000;

const ENROLL_ATTEMPTS: u32 = 3;
const ENROLL_TEMPLATE_LEN: usize = 512;

/// Target of an active enrollment stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentContext {
    pub uid: u16,
    pub finger: u8,
}

/// Side effect the transport loop must apply after writing the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// EXIT: close the connection
    Close,
    /// STARTENROLL: spawn the enrollment event stream
    StartEnroll(EnrollmentContext),
    /// CANCELCAPTURE: stop any running enrollment stream
    CancelEnroll,
}

/// Outcome of dispatching one inbound packet
#[derive(Debug)]
pub struct Dispatch {
    pub response: Packet,
    pub action: Action,
}

impl Dispatch {
    fn reply(response: Packet) -> Self {
        Self {
            response,
            action: Action::None,
        }
    }
}

/// Command dispatcher plus the per-connection state it mutates
pub struct SessionEngine {
    model: SharedModel,
    config: Arc<SimulatorConfig>,
    session_id: u16,
    authenticated: bool,
    registered_events: u32,
    scratch: Vec<u8>,
}

impl SessionEngine {
    pub fn new(model: SharedModel, config: Arc<SimulatorConfig>) -> Self {
        Self {
            model,
            config,
            session_id: 0,
            authenticated: false,
            registered_events: 0,
            scratch: Vec::new(),
        }
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Whether CONNECT or AUTH has completed. The simulator is permissive
    /// and answers commands either way; deployments that front a real
    /// device may want to check this.
    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// Dispatch one packet. Recoverable faults (unknown command, bad
    /// payload, missing template) become ERROR acks; anything else
    /// propagates and tears the session down.
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<Dispatch, SimulatorError> {
        log::debug!(
            "[sim] command {} (0x{:04x}), session {}, reply {}, {} payload bytes",
            packet.command,
            packet.command,
            packet.session_id,
            packet.reply_id,
            packet.payload.len()
        );
        match self.route(packet) {
            Ok(dispatch) => Ok(dispatch),
            Err(err) if err.is_recoverable() => {
                log::warn!("[sim] {}", err);
                Ok(Dispatch::reply(self.error(packet)))
            }
            Err(err) => Err(err),
        }
    }

    fn route(&mut self, p: &Packet) -> Result<Dispatch, SimulatorError> {
        match p.command {
            cmd::CMD_CONNECT => Ok(self.handle_connect(p)),
            cmd::CMD_AUTH => Ok(self.handle_auth(p)),
            cmd::CMD_EXIT => Ok(Dispatch {
                response: self.ok(p),
                action: Action::Close,
            }),
            cmd::CMD_ENABLEDEVICE
            | cmd::CMD_DISABLEDEVICE
            | cmd::CMD_STARTVERIFY
            | cmd::CMD_REFRESHDATA
            | cmd::CMD_FREE_DATA => Ok(Dispatch::reply(self.ok(p))),
            cmd::CMD_GET_VERSION => Ok(Dispatch::reply(self.handle_get_version(p))),
            cmd::CMD_GET_TIME => Ok(Dispatch::reply(self.handle_get_time(p))),
            cmd::CMD_SET_TIME => self.handle_set_time(p).map(Dispatch::reply),
            cmd::CMD_OPTIONS_RRQ => Ok(Dispatch::reply(self.handle_options_rrq(p))),
            cmd::CMD_OPTIONS_WRQ => Ok(Dispatch::reply(self.handle_options_wrq(p))),
            cmd::CMD_GET_FREE_SIZES => Ok(Dispatch::reply(self.handle_get_free_sizes(p))),
            cmd::CMD_GET_PINWIDTH => Ok(Dispatch::reply(self.ok_with(p, vec![5]))),
            cmd::CMD_USERTEMP_RRQ => Ok(Dispatch::reply(self.handle_usertemp_rrq(p))),
            cmd::CMD_DB_RRQ => Ok(Dispatch::reply(self.handle_db_rrq(p))),
            cmd::CMD_ATTLOG_RRQ => Ok(Dispatch::reply(self.handle_attlog_rrq(p))),
            cmd::CMD_PREPARE_BUFFER => self.handle_prepare_buffer(p).map(Dispatch::reply),
            cmd::CMD_REG_EVENT => self.handle_reg_event(p).map(Dispatch::reply),
            cmd::CMD_UNLOCK => self.handle_unlock(p).map(Dispatch::reply),
            cmd::CMD_TESTVOICE => self.handle_testvoice(p).map(Dispatch::reply),
            cmd::CMD_USER_WRQ => self.handle_user_wrq(p).map(Dispatch::reply),
            cmd::CMD_DELETE_USER => self.handle_delete_user(p).map(Dispatch::reply),
            cmd::CMD_DELETE_USERTEMP => self.handle_delete_usertemp(p).map(Dispatch::reply),
            cmd::CMD_GET_USERTEMP => self.handle_get_usertemp(p).map(Dispatch::reply),
            cmd::CMD_STARTENROLL => self.handle_start_enroll(p),
            cmd::CMD_CANCELCAPTURE => Ok(Dispatch {
                response: self.ok(p),
                action: Action::CancelEnroll,
            }),
            cmd::CMD_PREPARE_DATA => self.handle_prepare_data(p).map(Dispatch::reply),
            cmd::CMD_DATA => Ok(Dispatch::reply(self.handle_data(p))),
            cmd::CMD_SAVE_USERTEMPS => self.handle_save_usertemps(p).map(Dispatch::reply),
            cmd::CMD_READ_BUFFER => self.handle_read_buffer(p).map(Dispatch::reply),
            other => Err(SimulatorError::UnknownCommand(other)),
        }
    }

    // ------------------------------------------------------------------
    // Response constructors
    // ------------------------------------------------------------------

    fn ok(&self, request: &Packet) -> Packet {
        self.ok_with(request, Vec::new())
    }

    fn ok_with(&self, request: &Packet, payload: Vec<u8>) -> Packet {
        Packet::new(cmd::CMD_ACK_OK, request.session_id, request.reply_id, payload)
    }

    fn error(&self, request: &Packet) -> Packet {
        Packet::new(
            cmd::CMD_ACK_ERROR,
            request.session_id,
            request.reply_id,
            Vec::new(),
        )
    }

    /// DATA frame with the 4-byte total-size prefix used by list responses
    fn data_with_size(&self, request: &Packet, body: Vec<u8>) -> Packet {
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
        payload.extend_from_slice(&body);
        Packet::new(cmd::CMD_DATA, request.session_id, request.reply_id, payload)
    }

    fn model(&self) -> std::sync::MutexGuard<'_, DeviceModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bad_payload(&self, p: &Packet, expected: &'static str) -> SimulatorError {
        SimulatorError::BadPayload {
            command: p.command,
            expected,
            got: p.payload.len(),
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    fn handle_connect(&mut self, p: &Packet) -> Dispatch {
        self.session_id = if p.session_id != 0 {
            p.session_id
        } else {
            DEFAULT_SESSION_ID
        };

        let code = if self.config.password == 0 {
            self.authenticated = true;
            cmd::CMD_ACK_OK
        } else {
            cmd::CMD_ACK_UNAUTH
        };
        log::info!(
            "[sim] connect: session {} ({})",
            self.session_id,
            protocol::command_name(code)
        );
        Dispatch::reply(Packet::new(code, self.session_id, p.reply_id, Vec::new()))
    }

    fn handle_auth(&mut self, p: &Packet) -> Dispatch {
        // Accept any comm key
        self.authenticated = true;
        self.session_id = p.session_id;
        log::info!("[sim] auth accepted for session {}", self.session_id);
        Dispatch::reply(Packet::new(
            cmd::CMD_ACK_OK,
            self.session_id,
            p.reply_id,
            Vec::new(),
        ))
    }

    // ------------------------------------------------------------------
    // Metadata queries
    // ------------------------------------------------------------------

    fn handle_get_version(&self, p: &Packet) -> Packet {
        let mut payload = self.config.firmware_version.as_bytes().to_vec();
        payload.push(0);
        self.ok_with(p, payload)
    }

    fn handle_get_time(&self, p: &Packet) -> Packet {
        let now = Local::now().naive_local();
        self.ok_with(p, protocol::encode_time(&now).to_le_bytes().to_vec())
    }

    fn handle_set_time(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 4 {
            return Err(self.bad_payload(p, "4-byte packed time"));
        }
        let packed = u32::from_le_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]]);
        match protocol::decode_time(packed) {
            // Accepted but not persisted
            Some(dt) => log::info!("[sim] set time to {}", dt),
            None => log::warn!("[sim] set time with undecodable value {}", packed),
        }
        Ok(self.ok(p))
    }

    fn handle_options_rrq(&self, p: &Packet) -> Packet {
        let key = protocol::extract_ascii_string(&p.payload);
        let value = match key.as_str() {
            "~SerialNumber" => Some(self.config.serial_number.clone()),
            "~Platform" => Some(self.config.platform.clone()),
            "~DeviceName" => Some(self.config.device_name.clone()),
            "MAC" => Some(self.config.mac_address.clone()),
            "IPAddress" => Some(self.config.ip.clone()),
            "ZKFaceVersion" => Some("0".to_string()),
            "~ZKFPVersion" => Some("10".to_string()),
            "NetMask" => Some("255.255.255.0".to_string()),
            "GATEIPAddress" => Some("192.168.1.1".to_string()),
            "~ExtendFmt" => Some("0".to_string()),
            "~UserExtFmt" => Some("0".to_string()),
            "FaceFunOn" => Some("0".to_string()),
            "CompatOldFirmware" => Some("0".to_string()),
            _ => None,
        };
        log::debug!("[sim] options rrq {:?} -> {:?}", key, value);
        let payload = match value {
            Some(value) => format!("{}={}\0", key, value).into_bytes(),
            None => Vec::new(),
        };
        self.ok_with(p, payload)
    }

    fn handle_options_wrq(&self, p: &Packet) -> Packet {
        let option = protocol::extract_ascii_string(&p.payload);
        log::debug!("[sim] options wrq {:?} (ignored)", option);
        self.ok(p)
    }

    fn handle_get_free_sizes(&self, p: &Packet) -> Packet {
        let cap = self.model().capacity();
        self.ok_with(p, free_sizes_payload(&cap))
    }

    // ------------------------------------------------------------------
    // List reads
    // ------------------------------------------------------------------

    fn users_body(&self) -> Vec<u8> {
        let model = self.model();
        let mut body = Vec::with_capacity(model.users().len() * protocol::USER_RECORD_72);
        for user in model.users() {
            body.extend_from_slice(&protocol::encode_user_72(user));
        }
        body
    }

    fn templates_body(&self) -> Vec<u8> {
        let model = self.model();
        let mut body = Vec::new();
        for t in model.templates() {
            body.extend_from_slice(&protocol::encode_template_entry(
                t.uid, t.finger, t.valid, &t.template,
            ));
        }
        body
    }

    fn attendance_body(&self) -> Vec<u8> {
        let model = self.model();
        let mut body = Vec::with_capacity(model.attendance().len() * protocol::ATT_RECORD_40);
        for record in model.attendance() {
            body.extend_from_slice(&protocol::encode_attendance_40(record));
        }
        body
    }

    fn handle_usertemp_rrq(&self, p: &Packet) -> Packet {
        let body = self.users_body();
        self.data_with_size(p, body)
    }

    fn handle_db_rrq(&self, p: &Packet) -> Packet {
        let body = self.templates_body();
        self.data_with_size(p, body)
    }

    fn handle_attlog_rrq(&self, p: &Packet) -> Packet {
        let body = self.attendance_body();
        self.data_with_size(p, body)
    }

    fn handle_prepare_buffer(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 11 {
            return Err(self.bad_payload(p, "11-byte buffer request"));
        }
        let fct = u32::from_le_bytes([p.payload[3], p.payload[4], p.payload[5], p.payload[6]]);
        log::debug!("[sim] prepare buffer fct={}", fct);
        let body = match fct {
            protocol::FCT_USER => self.users_body(),
            protocol::FCT_FINGERTMP => self.templates_body(),
            protocol::FCT_ATTLOG => self.attendance_body(),
            _ => Vec::new(),
        };
        Ok(self.data_with_size(p, body))
    }

    fn handle_read_buffer(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 8 {
            return Err(self.bad_payload(p, "8-byte read request"));
        }
        Ok(self.data_with_size(p, Vec::new()))
    }

    // ------------------------------------------------------------------
    // Device controls
    // ------------------------------------------------------------------

    fn handle_reg_event(&mut self, p: &Packet) -> Result<Packet, SimulatorError> {
        self.registered_events = match p.payload.len() {
            0 => 0,
            n if n >= 4 => {
                u32::from_le_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]])
            }
            _ => return Err(self.bad_payload(p, "empty or 4-byte flags")),
        };
        log::debug!("[sim] registered events mask {:#x}", self.registered_events);
        Ok(self.ok(p))
    }

    fn handle_unlock(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 4 {
            return Err(self.bad_payload(p, "4-byte unlock time"));
        }
        let deci = u32::from_le_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]]);
        log::info!("[sim] unlock for {}.{}s", deci / 10, deci % 10);
        Ok(self.ok(p))
    }

    fn handle_testvoice(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 4 {
            return Err(self.bad_payload(p, "4-byte voice index"));
        }
        let index = u32::from_le_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]]);
        log::info!("[sim] test voice index {}", index);
        Ok(self.ok(p))
    }

    // ------------------------------------------------------------------
    // User and template mutation
    // ------------------------------------------------------------------

    fn handle_user_wrq(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        let user = match p.payload.len() {
            protocol::USER_RECORD_72 => protocol::decode_user_72(&p.payload),
            protocol::USER_RECORD_28 => protocol::decode_user_28(&p.payload),
            _ => return Err(self.bad_payload(p, "28- or 72-byte user record")),
        };
        log::info!("[sim] set user uid={} name={:?}", user.uid, user.name);
        self.model().set_user(user);
        Ok(self.ok(p))
    }

    fn handle_delete_user(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 2 {
            return Err(self.bad_payload(p, "2-byte uid"));
        }
        let uid = u16::from_le_bytes([p.payload[0], p.payload[1]]);
        log::info!("[sim] delete user uid={}", uid);
        self.model().delete_user(uid);
        Ok(self.ok(p))
    }

    fn handle_delete_usertemp(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 3 {
            return Err(self.bad_payload(p, "uid plus finger index"));
        }
        let uid = u16::from_le_bytes([p.payload[0], p.payload[1]]);
        let finger = p.payload[2];
        log::info!("[sim] delete template uid={} finger={}", uid, finger);
        self.model().delete_template(uid, finger);
        Ok(self.ok(p))
    }

    fn handle_get_usertemp(&self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 3 {
            return Err(self.bad_payload(p, "uid plus finger index"));
        }
        let uid = u16::from_le_bytes([p.payload[0], p.payload[1]]);
        let finger = p.payload[2];
        let model = self.model();
        let template = model
            .template(uid, finger)
            .ok_or(SimulatorError::TemplateNotFound { uid, finger })?;
        let mut payload = template.template.clone();
        payload.extend_from_slice(&[0u8; 6]);
        Ok(Packet::new(
            cmd::CMD_DATA,
            p.session_id,
            p.reply_id,
            payload,
        ))
    }

    // ------------------------------------------------------------------
    // Enrollment
    // ------------------------------------------------------------------

    fn handle_start_enroll(&mut self, p: &Packet) -> Result<Dispatch, SimulatorError> {
        let (user_id, finger) = if p.payload.len() >= 26 {
            let user_id = protocol::extract_ascii_string(&p.payload[0..24]);
            (user_id, p.payload[24])
        } else if p.payload.len() >= 5 {
            let numeric =
                u32::from_le_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]]);
            (numeric.to_string(), p.payload[4])
        } else {
            return Err(self.bad_payload(p, "26-byte or 5-byte enroll request"));
        };

        let uid = self
            .model()
            .find_uid_by_user_id(&user_id)
            .or_else(|| user_id.parse::<u16>().ok())
            .unwrap_or(1);
        log::info!(
            "[sim] start enroll user_id={:?} resolved uid={} finger={}",
            user_id,
            uid,
            finger
        );
        Ok(Dispatch {
            response: self.ok(p),
            action: Action::StartEnroll(EnrollmentContext { uid, finger }),
        })
    }

    // ------------------------------------------------------------------
    // Bulk upload
    // ------------------------------------------------------------------

    fn handle_prepare_data(&mut self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() < 4 {
            return Err(self.bad_payload(p, "4-byte total size"));
        }
        let declared =
            u32::from_le_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]]);
        log::debug!("[sim] prepare data, client announces {} bytes", declared);
        self.scratch.clear();
        Ok(self.ok(p))
    }

    fn handle_data(&mut self, p: &Packet) -> Packet {
        log::debug!("[sim] data chunk of {} bytes", p.payload.len());
        self.scratch.extend_from_slice(&p.payload);
        self.ok(p)
    }

    fn handle_save_usertemps(&mut self, p: &Packet) -> Result<Packet, SimulatorError> {
        if p.payload.len() >= 10 {
            let size1 =
                u32::from_le_bytes([p.payload[0], p.payload[1], p.payload[2], p.payload[3]]);
            let fct = u32::from_le_bytes([p.payload[6], p.payload[7], p.payload[8], p.payload[9]]);
            log::debug!("[sim] save usertemps size1={} fct={}", size1, fct);
        }

        let parsed = parse_upload(&self.scratch);
        self.scratch.clear();
        let (users, templates) = parsed?;

        let mut model = self.model();
        log::info!(
            "[sim] bulk upload merging {} users, {} templates",
            users.len(),
            templates.len()
        );
        for user in users {
            model.set_user(user);
        }
        for template in templates {
            model.set_template(template);
        }
        drop(model);
        Ok(self.ok(p))
    }
}

/// GET_FREE_SIZES payload: 20 u32 fields plus 12 face-subsystem zeros
fn free_sizes_payload(cap: &CapacitySnapshot) -> Vec<u8> {
    let mut fields = [0u32; 20];
    fields[4] = cap.users;
    fields[6] = cap.fingers;
    fields[8] = cap.records;
    fields[14] = cap.fingers_capacity;
    fields[15] = cap.users_capacity;
    fields[16] = cap.records_capacity;
    fields[17] = cap.fingers_capacity.saturating_sub(cap.fingers);
    fields[18] = cap.users_capacity.saturating_sub(cap.users);
    fields[19] = cap.records_capacity.saturating_sub(cap.records);

    let mut buf = Vec::with_capacity(92);
    for field in fields {
        buf.extend_from_slice(&field.to_le_bytes());
    }
    buf.extend_from_slice(&[0u8; 12]);
    buf
}

/// Parse the upload scratch accumulated between PREPARE_DATA and
/// SAVE_USERTEMPS: `{user_block: u32, table: u32, template_block: u32}`
/// followed by the three blobs in that order. The declared sizes must
/// exactly partition the buffer.
fn parse_upload(scratch: &[u8]) -> Result<(Vec<User>, Vec<FingerTemplate>), SimulatorError> {
    let bad = |expected| SimulatorError::BadPayload {
        command: cmd::CMD_SAVE_USERTEMPS,
        expected,
        got: scratch.len(),
    };

    if scratch.len() < 12 {
        return Err(bad("12-byte block-size header"));
    }
    let user_block = u32::from_le_bytes([scratch[0], scratch[1], scratch[2], scratch[3]]) as usize;
    let table_size = u32::from_le_bytes([scratch[4], scratch[5], scratch[6], scratch[7]]) as usize;
    let template_block =
        u32::from_le_bytes([scratch[8], scratch[9], scratch[10], scratch[11]]) as usize;

    let expected_len = 12usize
        .checked_add(user_block)
        .and_then(|n| n.checked_add(table_size))
        .and_then(|n| n.checked_add(template_block));
    if expected_len != Some(scratch.len()) {
        return Err(bad("block sizes partitioning the buffer"));
    }

    let user_bytes = &scratch[12..12 + user_block];
    let table_bytes = &scratch[12 + user_block..12 + user_block + table_size];
    let template_bytes = &scratch[12 + user_block + table_size..];

    // 72-byte records when the block divides evenly, 28-byte otherwise
    let record_size = if user_block % protocol::USER_RECORD_72 == 0 {
        protocol::USER_RECORD_72
    } else {
        protocol::USER_RECORD_28
    };
    if user_block % record_size != 0 {
        return Err(bad("whole number of user records"));
    }
    let users: Vec<User> = user_bytes
        .chunks_exact(record_size)
        .map(|chunk| {
            if record_size == protocol::USER_RECORD_72 {
                protocol::decode_user_72(chunk)
            } else {
                protocol::decode_user_28(chunk)
            }
        })
        .collect();

    if table_size % 8 != 0 {
        return Err(bad("whole number of 8-byte table entries"));
    }
    struct TableEntry {
        entry_type: u8,
        uid: u16,
        finger_num: u8,
        template_start: usize,
    }
    let entries: Vec<TableEntry> = table_bytes
        .chunks_exact(8)
        .map(|e| TableEntry {
            entry_type: e[0],
            uid: u16::from_le_bytes([e[1], e[2]]),
            finger_num: e[3],
            template_start: u32::from_le_bytes([e[4], e[5], e[6], e[7]]) as usize,
        })
        .collect();

    let mut templates = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        // type 2 = fingerprint template
        if entry.entry_type != 2 {
            continue;
        }
        let end = entries
            .get(i + 1)
            .map(|next| next.template_start)
            .unwrap_or(template_bytes.len());
        if entry.template_start > end || end > template_bytes.len() {
            return Err(bad("template spans inside the template block"));
        }
        templates.push(FingerTemplate {
            uid: entry.uid,
            finger: entry.finger_num.wrapping_sub(0x10),
            valid: 1,
            template: template_bytes[entry.template_start..end].to_vec(),
        });
    }

    Ok((users, templates))
}

// ----------------------------------------------------------------------
// Enrollment event stream
// ----------------------------------------------------------------------

/// Serialize one framed packet onto the shared TCP write half
pub(crate) async fn write_frame<W>(writer: &Mutex<W>, packet: &Packet) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = protocol::encode_tcp(packet);
    let mut w = writer.lock().await;
    w.write_all(&buf).await
}

/// Drive the interactive enrollment sequence on an established connection.
///
/// Three simulated finger presentations (events 1 and 100, each ack-gated),
/// then the success event carrying `{result, template size, finger}`, then
/// the synthesized template is stored. Runs as its own task; the connection
/// loop feeds client acks through `acks` and aborts the task on
/// CANCELCAPTURE or disconnect.
pub(crate) async fn run_enrollment<W>(
    ctx: EnrollmentContext,
    session_id: u16,
    step_delay: Duration,
    writer: Arc<Mutex<W>>,
    mut acks: mpsc::Receiver<Packet>,
    model: SharedModel,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    log::info!(
        "[sim] enrollment stream started for uid={} finger={}",
        ctx.uid,
        ctx.finger
    );
    sleep(step_delay).await;

    for attempt in 1..=ENROLL_ATTEMPTS {
        log::debug!("[sim] finger scan attempt {}/{}", attempt, ENROLL_ATTEMPTS);
        // 1 = finger placed
        if !push_event(&writer, session_id, 1u16.to_le_bytes().to_vec(), &mut acks).await {
            return;
        }
        sleep(step_delay).await;
        // 100 = place finger again
        if !push_event(&writer, session_id, 100u16.to_le_bytes().to_vec(), &mut acks).await {
            return;
        }
        sleep(step_delay).await;
    }

    let mut success = Vec::with_capacity(6);
    success.extend_from_slice(&0u16.to_le_bytes());
    success.extend_from_slice(&(ENROLL_TEMPLATE_LEN as u16).to_le_bytes());
    success.extend_from_slice(&(ctx.finger as u16).to_le_bytes());
    if !push_event(&writer, session_id, success, &mut acks).await {
        return;
    }

    model
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .set_template(FingerTemplate {
            uid: ctx.uid,
            finger: ctx.finger,
            valid: 1,
            template: vec![0u8; ENROLL_TEMPLATE_LEN],
        });
    log::info!(
        "[sim] enrollment complete, template stored for uid={} finger={}",
        ctx.uid,
        ctx.finger
    );
}

/// Push one unsolicited REG_EVENT frame and wait for the client ack.
/// Returns false when the stream should abort.
async fn push_event<W>(
    writer: &Mutex<W>,
    session_id: u16,
    payload: Vec<u8>,
    acks: &mut mpsc::Receiver<Packet>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let event = Packet::new(cmd::CMD_REG_EVENT, session_id, 0, payload);
    if let Err(err) = write_frame(writer, &event).await {
        log::warn!("[sim] enrollment event push failed: {}", err);
        return false;
    }
    match acks.recv().await {
        Some(_) => true,
        None => {
            log::debug!("[sim] enrollment ack source closed, aborting stream");
            false
        }
    }
}
