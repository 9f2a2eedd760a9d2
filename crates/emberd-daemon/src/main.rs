//! emberd daemon binary.
//!
//! Hosts build sessions on a loopback socket. The embedded engine is
//! supplied by the deployment; this binary wires up the scripted
//! simulation engine, which is what local testing and the client's
//! integration suite run against.
//!
//! ```bash
//! emberd-daemon --bind 127.0.0.1:7699
//! ```

use clap::Parser;
use emberd_daemon::{session, SimulatedEngine};
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// emberd build daemon
#[derive(Parser, Debug)]
#[command(name = "emberd-daemon")]
#[command(about = "Resident build daemon serving emberd clients")]
#[command(version)]
struct Args {
    /// Address to bind to (loopback only; the protocol trusts local
    /// peers)
    #[arg(long, default_value = "127.0.0.1:7699")]
    bind: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("emberd daemon starting");
    let listener = TcpListener::bind(&args.bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    session::serve(listener, SimulatedEngine::demo).await?;
    Ok(())
}
