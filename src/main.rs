//! Command-line entry point for the device simulator

use clap::Parser;

use zk_simulator::{Simulator, SimulatorConfig, SimulatorError};

#[derive(Debug, Parser)]
#[command(
    name = "zk-simulator",
    about = "ZKTeco attendance device simulator",
    version
)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,

    /// Port to bind
    #[arg(long, default_value_t = 4370)]
    port: u16,

    /// Device comm key; 0 disables authentication
    #[arg(long, default_value_t = 0)]
    password: u32,

    /// Serve UDP datagrams instead of TCP
    #[arg(long)]
    udp: bool,
}

#[tokio::main]
async fn main() -> Result<(), SimulatorError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = SimulatorConfig {
        ip: args.ip,
        port: args.port,
        password: args.password,
        use_udp: args.udp,
        ..SimulatorConfig::default()
    };

    log::info!(
        "[sim] starting with password={} transport={}",
        config.password,
        if config.use_udp { "udp" } else { "tcp" }
    );
    Simulator::new(config).run().await
}
