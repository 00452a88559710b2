//! ZKTeco UDP transport, server side
//!
//! Datagram mode carries bare inner packets, no stream envelope. Sessions
//! are keyed by peer address; the enrollment event stream is TCP-only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::device::SharedModel;
use crate::protocol::Packet;
use crate::session::{Action, SessionEngine};
use crate::types::SimulatorConfig;

pub async fn serve(
    socket: UdpSocket,
    model: SharedModel,
    config: Arc<SimulatorConfig>,
) -> std::io::Result<()> {
    let mut sessions: HashMap<SocketAddr, SessionEngine> = HashMap::new();
    let mut buf = vec![0u8; 65536];

    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let Some(packet) = Packet::decode(&buf[..n]) else {
            log::debug!("[sim] dropped {}-byte runt datagram from {}", n, peer);
            continue;
        };

        let engine = sessions
            .entry(peer)
            .or_insert_with(|| SessionEngine::new(model.clone(), config.clone()));

        match engine.handle_packet(&packet) {
            Ok(dispatch) => {
                socket.send_to(&dispatch.response.encode(), peer).await?;
                match dispatch.action {
                    Action::Close => {
                        sessions.remove(&peer);
                    }
                    Action::StartEnroll(_) => {
                        log::warn!("[sim] enrollment stream is not supported over UDP");
                    }
                    Action::CancelEnroll | Action::None => {}
                }
            }
            Err(err) => {
                log::warn!("[sim] session for {} failed: {}", peer, err);
                sessions.remove(&peer);
            }
        }
    }
}
