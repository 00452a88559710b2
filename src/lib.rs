//! ZKTeco attendance device simulator
//!
//! Impersonates a ZKTeco biometric attendance terminal over TCP (stream
//! envelope on port 4370) or UDP, closely enough that unmodified pyzk /
//! node-zklib clients can connect, query metadata and capacity, manage
//! users, enroll a fingerprint interactively, upload bulk user/template
//! bundles and read attendance logs.
//!
//! State is in-memory only and shared between all client sessions; nothing
//! survives a restart.

pub mod device;
pub mod error;
pub mod protocol;
pub mod session;
pub mod tcp;
pub mod types;
pub mod udp;

pub use device::{DeviceModel, SharedModel};
pub use error::SimulatorError;
pub use types::SimulatorConfig;

use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, UdpSocket};

/// A simulated device: configuration plus the model shared by all sessions
pub struct Simulator {
    config: Arc<SimulatorConfig>,
    model: SharedModel,
}

impl Simulator {
    /// Build a simulator pre-loaded with the stock demo users
    pub fn new(config: SimulatorConfig) -> Self {
        let model = Arc::new(Mutex::new(DeviceModel::with_seed_users(&config)));
        Self {
            config: Arc::new(config),
            model,
        }
    }

    /// Handle to the shared device model
    pub fn model(&self) -> SharedModel {
        self.model.clone()
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Bind the configured address and serve until the process exits
    pub async fn run(&self) -> Result<(), SimulatorError> {
        let addr = format!("{}:{}", self.config.ip, self.config.port);
        if self.config.use_udp {
            let socket = UdpSocket::bind(&addr).await?;
            log::info!("[sim] listening on {} (UDP)", socket.local_addr()?);
            self.serve_udp(socket).await
        } else {
            let listener = TcpListener::bind(&addr).await?;
            log::info!("[sim] listening on {} (TCP)", listener.local_addr()?);
            self.serve_tcp(listener).await
        }
    }

    /// Serve connections on an already-bound TCP listener
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<(), SimulatorError> {
        tcp::serve(listener, self.model.clone(), self.config.clone())
            .await
            .map_err(Into::into)
    }

    /// Serve datagrams on an already-bound UDP socket
    pub async fn serve_udp(&self, socket: UdpSocket) -> Result<(), SimulatorError> {
        udp::serve(socket, self.model.clone(), self.config.clone())
            .await
            .map_err(Into::into)
    }
}
