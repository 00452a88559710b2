//! End-to-end tests: a raw socket client speaking literal protocol bytes
//! against a running simulator.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use zk_simulator::protocol::{self, cmd, Packet};
use zk_simulator::{SharedModel, Simulator, SimulatorConfig};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> SimulatorConfig {
    SimulatorConfig {
        ip: "127.0.0.1".to_string(),
        // tests drive the enrollment stream event-to-event, not wall-clock
        enroll_step_delay_ms: 0,
        ..SimulatorConfig::default()
    }
}

async fn start_tcp() -> (SocketAddr, SharedModel) {
    let sim = Simulator::new(test_config());
    let model = sim.model();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = sim.serve_tcp(listener).await;
    });
    (addr, model)
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

struct TestClient {
    stream: TcpStream,
    session_id: u16,
    reply_id: u16,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .unwrap()
            .unwrap();
        Self {
            stream,
            session_id: 0,
            reply_id: 0,
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn read_packet(&mut self) -> Packet {
        let mut top = [0u8; protocol::TCP_HEADER_LEN];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut top))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&top[0..4], &protocol::TCP_PREFIX);
        let len = u32::from_le_bytes([top[4], top[5], top[6], top[7]]) as usize;
        let mut inner = vec![0u8; len];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut inner))
            .await
            .unwrap()
            .unwrap();
        Packet::decode(&inner).unwrap()
    }

    /// Send one command and read its response, tracking ids the way real
    /// clients do
    async fn execute(&mut self, command: u16, payload: &[u8]) -> Packet {
        if command == cmd::CMD_CONNECT {
            self.session_id = 0;
            self.reply_id = 0;
        } else {
            self.reply_id = self.reply_id.wrapping_add(1);
        }
        let packet = Packet::new(command, self.session_id, self.reply_id, payload.to_vec());
        self.send_raw(&protocol::encode_tcp(&packet)).await;
        let reply = self.read_packet().await;
        assert_eq!(reply.reply_id, self.reply_id);
        if command == cmd::CMD_CONNECT {
            self.session_id = reply.session_id;
        }
        reply
    }

    /// Acknowledge an unsolicited event frame
    async fn ack(&mut self) {
        let packet = Packet::new(cmd::CMD_ACK_OK, self.session_id, 0, Vec::new());
        self.send_raw(&protocol::encode_tcp(&packet)).await;
    }

    async fn expect_closed(mut self) {
        let mut byte = [0u8; 1];
        let n = timeout(IO_TIMEOUT, self.stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "expected the server to close the connection");
    }
}

fn decode_data_body(reply: &Packet) -> &[u8] {
    assert_eq!(reply.command, cmd::CMD_DATA);
    let total = u32::from_le_bytes([
        reply.payload[0],
        reply.payload[1],
        reply.payload[2],
        reply.payload[3],
    ]) as usize;
    assert_eq!(reply.payload.len(), 4 + total);
    &reply.payload[4..]
}

#[tokio::test]
async fn connect_then_get_version() {
    let (addr, _model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;

    // Literal opening frame: command 1000 with zeroed checksum, session and
    // reply ids. The zero checksum is intentionally wrong; inbound
    // mismatches are tolerated.
    client
        .send_raw(&[
            0x50, 0x50, 0x82, 0x7d, 0x08, 0x00, 0x00, 0x00, 0xe8, 0x03, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ])
        .await;
    let reply = client.read_packet().await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);
    assert_ne!(reply.session_id, 0);
    assert!(reply.verify_checksum());
    client.session_id = reply.session_id;

    let reply = client.execute(cmd::CMD_GET_VERSION, &[]).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);
    assert_eq!(reply.payload, b"Ver 6.60 Nov 13 2019\0".to_vec());
}

#[tokio::test]
async fn list_users_after_fresh_start() {
    let (addr, _model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;
    client.execute(cmd::CMD_CONNECT, &[]).await;

    let reply = client.execute(cmd::CMD_USERTEMP_RRQ, &[]).await;
    let body = decode_data_body(&reply);
    assert_eq!(body.len(), 3 * protocol::USER_RECORD_72);

    let names: Vec<String> = body
        .chunks_exact(protocol::USER_RECORD_72)
        .map(|chunk| protocol::decode_user_72(chunk).name)
        .collect();
    assert_eq!(names, ["Admin", "User001", "User002"]);
}

#[tokio::test]
async fn delete_then_re_add_appends_at_end() {
    let (addr, _model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;
    client.execute(cmd::CMD_CONNECT, &[]).await;

    let reply = client
        .execute(cmd::CMD_DELETE_USER, &2u16.to_le_bytes())
        .await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);

    let reply = client.execute(cmd::CMD_USERTEMP_RRQ, &[]).await;
    assert_eq!(
        decode_data_body(&reply).len(),
        2 * protocol::USER_RECORD_72
    );

    let user = zk_simulator::types::User {
        uid: 2,
        privilege: 0,
        password: "12345".to_string(),
        name: "User001".to_string(),
        card: 123456,
        group: "0".to_string(),
        user_id: "2".to_string(),
    };
    let reply = client
        .execute(cmd::CMD_USER_WRQ, &protocol::encode_user_72(&user))
        .await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);

    let reply = client.execute(cmd::CMD_USERTEMP_RRQ, &[]).await;
    let body = decode_data_body(&reply);
    let uids: Vec<u16> = body
        .chunks_exact(protocol::USER_RECORD_72)
        .map(|chunk| protocol::decode_user_72(chunk).uid)
        .collect();
    assert_eq!(uids, [1, 3, 2]);
}

#[tokio::test]
async fn enrollment_happy_path() {
    let (addr, model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;
    client.execute(cmd::CMD_CONNECT, &[]).await;

    let mut payload = vec![0u8; 26];
    payload[0] = b'1'; // user id "1" -> seeded uid 1
    payload[24] = 0; // finger
    payload[25] = 1; // flag
    let reply = client.execute(cmd::CMD_STARTENROLL, &payload).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);

    for _ in 0..3 {
        let event = client.read_packet().await;
        assert_eq!(event.command, cmd::CMD_REG_EVENT);
        assert_eq!(event.payload, 1u16.to_le_bytes().to_vec());
        client.ack().await;

        let event = client.read_packet().await;
        assert_eq!(event.command, cmd::CMD_REG_EVENT);
        assert_eq!(event.payload, 100u16.to_le_bytes().to_vec());
        client.ack().await;
    }

    let event = client.read_packet().await;
    assert_eq!(event.command, cmd::CMD_REG_EVENT);
    assert_eq!(event.payload.len(), 6);
    assert_eq!(&event.payload[0..2], &0u16.to_le_bytes());
    assert_eq!(
        u16::from_le_bytes([event.payload[2], event.payload[3]]),
        512
    );
    assert_eq!(u16::from_le_bytes([event.payload[4], event.payload[5]]), 0);
    client.ack().await;

    wait_for(|| model.lock().unwrap().template(1, 0).is_some()).await;

    let reply = client.execute(cmd::CMD_DB_RRQ, &[]).await;
    let body = decode_data_body(&reply);
    assert_eq!(body.len(), 518);
    assert_eq!(u16::from_le_bytes([body[0], body[1]]), 518);
    assert_eq!(u16::from_le_bytes([body[2], body[3]]), 1); // uid
    assert_eq!(body[4], 0); // finger
    assert_eq!(body[5], 1); // valid
}

#[tokio::test]
async fn bulk_upload_adds_user() {
    let (addr, _model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;
    client.execute(cmd::CMD_CONNECT, &[]).await;

    let user = zk_simulator::types::User {
        uid: 9,
        privilege: 0,
        password: String::new(),
        name: "Bulk".to_string(),
        card: 0,
        group: "0".to_string(),
        user_id: "9".to_string(),
    };
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&72u32.to_le_bytes());
    buffer.extend_from_slice(&0u32.to_le_bytes());
    buffer.extend_from_slice(&0u32.to_le_bytes());
    buffer.extend_from_slice(&protocol::encode_user_72(&user));

    let reply = client
        .execute(
            cmd::CMD_PREPARE_DATA,
            &(buffer.len() as u32).to_le_bytes(),
        )
        .await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);

    let reply = client.execute(cmd::CMD_DATA, &buffer).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);

    let mut params = Vec::new();
    params.extend_from_slice(&(buffer.len() as u32).to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes());
    params.extend_from_slice(&protocol::FCT_USER.to_le_bytes());
    let reply = client.execute(cmd::CMD_SAVE_USERTEMPS, &params).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);

    let reply = client.execute(cmd::CMD_USERTEMP_RRQ, &[]).await;
    let body = decode_data_body(&reply);
    let last = protocol::decode_user_72(&body[body.len() - protocol::USER_RECORD_72..]);
    assert_eq!(last.uid, 9);
    assert_eq!(last.name, "Bulk");
}

#[tokio::test]
async fn attendance_log_read_returns_packed_records() {
    let (addr, model) = start_tcp().await;
    model
        .lock()
        .unwrap()
        .add_attendance(zk_simulator::types::AttendanceRecord {
            uid: 1,
            user_id: "1".to_string(),
            timestamp: 638_541_296,
            status: 1,
            punch: 0,
        });

    let mut client = TestClient::connect(addr).await;
    client.execute(cmd::CMD_CONNECT, &[]).await;

    let reply = client.execute(cmd::CMD_ATTLOG_RRQ, &[]).await;
    let body = decode_data_body(&reply);
    assert_eq!(body.len(), 40);
    assert_eq!(u16::from_le_bytes([body[0], body[1]]), 1);
    assert_eq!(
        u32::from_le_bytes([body[27], body[28], body[29], body[30]]),
        638_541_296
    );
}

#[tokio::test]
async fn unknown_command_keeps_connection_usable() {
    let (addr, _model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;

    let reply = client.execute(9999, &[]).await;
    assert_eq!(reply.command, cmd::CMD_ACK_ERROR);

    let reply = client.execute(cmd::CMD_CONNECT, &[]).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);
    assert_ne!(reply.session_id, 0);
}

#[tokio::test]
async fn exit_closes_the_connection() {
    let (addr, _model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;
    client.execute(cmd::CMD_CONNECT, &[]).await;

    let reply = client.execute(cmd::CMD_EXIT, &[]).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);
    client.expect_closed().await;
}

#[tokio::test]
async fn bad_envelope_magic_drops_the_connection() {
    let (addr, _model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send_raw(&[
            0x82, 0x7d, 0x50, 0x50, 0x08, 0x00, 0x00, 0x00, 0xe8, 0x03, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ])
        .await;
    client.expect_closed().await;
}

#[tokio::test]
async fn cancel_capture_stops_the_event_stream() {
    let (addr, model) = start_tcp().await;
    let mut client = TestClient::connect(addr).await;
    client.execute(cmd::CMD_CONNECT, &[]).await;

    let mut payload = vec![0u8; 26];
    payload[0] = b'3';
    payload[24] = 2;
    payload[25] = 1;
    client.execute(cmd::CMD_STARTENROLL, &payload).await;

    // First presentation arrives, then the capture is cancelled mid-stream
    let event = client.read_packet().await;
    assert_eq!(event.command, cmd::CMD_REG_EVENT);
    let reply = client.execute(cmd::CMD_CANCELCAPTURE, &[]).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);

    // The session keeps answering ordinary requests and no template was
    // stored for the aborted enrollment
    let reply = client.execute(cmd::CMD_GET_VERSION, &[]).await;
    assert_eq!(reply.command, cmd::CMD_ACK_OK);
    assert!(model.lock().unwrap().template(3, 2).is_none());
}

#[tokio::test]
async fn udp_connect_and_version() {
    let mut config = test_config();
    config.use_udp = true;
    let sim = Simulator::new(config);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = sim.serve_udp(socket).await;
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();

    let mut buf = [0u8; 2048];
    client
        .send(&Packet::new(cmd::CMD_CONNECT, 0, 0, Vec::new()).encode())
        .await
        .unwrap();
    let n = timeout(IO_TIMEOUT, client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = Packet::decode(&buf[..n]).unwrap();
    assert_eq!(reply.command, cmd::CMD_ACK_OK);
    assert_ne!(reply.session_id, 0);

    client
        .send(&Packet::new(cmd::CMD_GET_VERSION, reply.session_id, 1, Vec::new()).encode())
        .await
        .unwrap();
    let n = timeout(IO_TIMEOUT, client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = Packet::decode(&buf[..n]).unwrap();
    assert_eq!(reply.command, cmd::CMD_ACK_OK);
    assert_eq!(reply.payload, b"Ver 6.60 Nov 13 2019\0".to_vec());
}
