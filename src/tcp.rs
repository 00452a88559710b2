//! ZKTeco TCP transport, server side
//!
//! Stream-envelope framing on port 4370: every message is
//! `50 50 82 7d <len: u32 LE>` followed by one inner packet. One task per
//! accepted connection; the connection's write half sits behind a mutex so
//! enrollment event pushes never interleave with request responses.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::device::SharedModel;
use crate::error::SimulatorError;
use crate::protocol::{
    self, cmd, Packet, MAX_CHUNK, PACKET_HEADER_LEN, TCP_HEADER_LEN,
};
use crate::session::{self, Action, SessionEngine};
use crate::types::SimulatorConfig;

/// An in-flight enrollment stream attached to one connection
struct EnrollJob {
    handle: JoinHandle<()>,
    ack_tx: mpsc::Sender<Packet>,
}

impl EnrollJob {
    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Accept loop: one session task per client
pub async fn serve(
    listener: TcpListener,
    model: SharedModel,
    config: Arc<SimulatorConfig>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        log::info!("[sim] connection from {}", peer);
        let model = model.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match handle_connection(stream, model, config).await {
                Ok(()) => log::info!("[sim] connection from {} closed", peer),
                Err(err) => log::warn!("[sim] connection from {} dropped: {}", peer, err),
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    model: SharedModel,
    config: Arc<SimulatorConfig>,
) -> Result<(), SimulatorError> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut engine = SessionEngine::new(model.clone(), config.clone());
    let mut enroll: Option<EnrollJob> = None;

    let result = loop {
        let packet = match read_frame(&mut reader).await {
            Ok(Some(packet)) => packet,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };

        // During enrollment the event stream owns inbound OK frames: they
        // are the client's acks and are consumed, never dispatched.
        if packet.command == cmd::CMD_ACK_OK {
            if let Some(job) = enroll.as_ref().filter(|job| job.is_active()) {
                let _ = job.ack_tx.send(packet).await;
                continue;
            }
        }

        let dispatch = match engine.handle_packet(&packet) {
            Ok(dispatch) => dispatch,
            Err(err) => break Err(err),
        };
        if let Err(err) = session::write_frame(&writer, &dispatch.response).await {
            break Err(err.into());
        }

        match dispatch.action {
            Action::None => {}
            Action::Close => break Ok(()),
            Action::CancelEnroll => {
                if let Some(job) = enroll.take() {
                    log::info!("[sim] enrollment cancelled");
                    job.handle.abort();
                }
            }
            Action::StartEnroll(ctx) => {
                if let Some(job) = enroll.take() {
                    job.handle.abort();
                }
                let (ack_tx, ack_rx) = mpsc::channel(4);
                let handle = tokio::spawn(session::run_enrollment(
                    ctx,
                    engine.session_id(),
                    Duration::from_millis(config.enroll_step_delay_ms),
                    writer.clone(),
                    ack_rx,
                    model.clone(),
                ));
                enroll = Some(EnrollJob { handle, ack_tx });
            }
        }
    };

    // Connection gone: any still-running enrollment stream dies with it
    if let Some(job) = enroll.take() {
        job.handle.abort();
    }
    result
}

/// Read one enveloped packet. `Ok(None)` is a clean end of stream; malformed
/// envelopes are errors that drop the connection.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Packet>, SimulatorError>
where
    R: AsyncRead + Unpin,
{
    let mut top = [0u8; TCP_HEADER_LEN];
    match reader.read_exact(&mut top).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = protocol::decode_tcp_length(&top)
        .ok_or(SimulatorError::MalformedFrame("bad envelope magic"))?;
    if len < PACKET_HEADER_LEN {
        return Err(SimulatorError::MalformedFrame("inner packet too short"));
    }
    if len > MAX_CHUNK + PACKET_HEADER_LEN {
        return Err(SimulatorError::MalformedFrame("inner packet too large"));
    }

    let mut inner = vec![0u8; len];
    reader.read_exact(&mut inner).await?;
    let packet = Packet::decode(&inner)
        .ok_or(SimulatorError::MalformedFrame("truncated packet header"))?;
    if !packet.verify_checksum() {
        // Tolerated: some clients send sloppy checksums
        log::debug!(
            "[sim] inbound checksum mismatch on command {}",
            packet.command
        );
    }
    Ok(Some(packet))
}
