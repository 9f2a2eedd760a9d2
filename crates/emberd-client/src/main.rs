//! emberd client binary.
//!
//! Forwards the invocation's argument vector to the resident daemon and
//! renders the resulting build event stream. The process exit code is
//! the daemon's `BuildFinished` exit code, or 1 when the build was
//! canceled, died on an exception, or the connection failed.
//!
//! ```bash
//! # run a build through the daemon
//! emberd -- install -DskipTests
//!
//! # write the build log to a file instead of the terminal
//! emberd --log-file build.log -- verify
//! ```

use std::{
    io::{self, IsTerminal},
    path::PathBuf,
};

use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use emberd_client::{
    connection,
    display::LiveDisplay,
    input,
    output::{OutputConfig, TerminalOutput},
    sink::{ClientLog, FileLog, MessageCollector},
    ClientError,
};
use emberd_proto::Message;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// emberd build client
#[derive(Parser, Debug)]
#[command(name = "emberd")]
#[command(about = "Run builds through the resident emberd daemon")]
#[command(version)]
struct Args {
    /// Daemon address (loopback host:port)
    #[arg(long, env = "EMBERD_ADDR", default_value = "127.0.0.1:7699")]
    daemon: String,

    /// Write the build log to this file instead of the terminal
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Initial rolling window height per project
    #[arg(long, default_value_t = 0)]
    window: usize,

    /// Stream output without per-project buffering
    #[arg(long)]
    batch: bool,

    /// Build tool arguments, forwarded verbatim
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Raw-mode guard: acquired once, released on every exit path.
struct RawMode {
    active: bool,
}

impl RawMode {
    fn acquire(dumb: bool) -> Self {
        if dumb {
            return Self { active: false };
        }
        match enable_raw_mode() {
            Ok(()) => Self { active: true },
            Err(error) => {
                tracing::warn!(%error, "raw mode unavailable; degrading to dumb output");
                Self { active: false }
            },
        }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.active {
            let _ = disable_raw_mode();
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_env("EMBERD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let args = Args::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("emberd: failed to start runtime: {error}");
            std::process::exit(1);
        },
    };

    let code = runtime.block_on(run(args));
    drop(runtime);
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    match drive(args).await {
        Ok(code) => code,
        Err(error) => {
            // single bold-red line describing the cause
            eprintln!("\x1b[1;31m{error}\x1b[0m");
            1
        },
    }
}

async fn drive(args: Args) -> Result<i32, ClientError> {
    let dumb = is_dumb_terminal();
    let raw_mode = RawMode::acquire(dumb);
    let dumb = dumb || !raw_mode.active;

    // the render queue merges socket traffic with input-handler messages
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    let mut conn = connection::connect(&args.daemon, inbound_tx.clone()).await?;

    input::spawn(request_rx, inbound_tx.clone(), conn.to_daemon.clone(), dumb);
    spawn_signal_handler(inbound_tx.clone(), conn.to_daemon.clone());

    let sink: Box<dyn ClientLog> = match &args.log_file {
        Some(path) => Box::new(FileLog::create(path)?),
        None => Box::new(MessageCollector::new()),
    };

    let mut output = TerminalOutput::new(
        OutputConfig {
            daemon_id: args.daemon.clone(),
            rolling_window: args.window,
            no_buffering: args.batch,
            dumb,
        },
        LiveDisplay::new(io::stderr(), !dumb),
        sink,
        Box::new(|| crossterm::terminal::size().unwrap_or((80, 24))),
        request_tx,
        conn.to_daemon.clone(),
    );
    output.describe_terminal()?;

    conn.to_daemon
        .send(build_request(&args))
        .map_err(|_| ClientError::Connection("daemon connection closed".into()))?;

    // biased: a terminator already queued must win over the EOF that
    // follows it on the error channel
    let outcome = tokio::select! {
        biased;
        outcome = output.run(&mut inbound_rx) => outcome?,
        error = conn.errors.recv() => {
            return Err(error.unwrap_or_else(|| {
                ClientError::Connection("daemon connection closed".into())
            }));
        },
    };

    // polite shutdown: signal intent to end, then let the tasks drop
    let _ = conn.to_daemon.send(Message::Stop);

    drop(raw_mode);
    Ok(outcome.process_exit_code())
}

/// Assemble the `BuildRequest` for this invocation.
fn build_request(args: &Args) -> Message {
    let working_dir = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| String::from("."));
    Message::BuildRequest {
        args: args.args.clone(),
        project_dir: project_root(&working_dir),
        working_dir,
        env: std::env::vars().collect(),
    }
}

/// Nearest ancestor carrying a `.git` directory, else the working dir.
fn project_root(working_dir: &str) -> String {
    let mut dir = PathBuf::from(working_dir);
    loop {
        if dir.join(".git").is_dir() {
            return dir.display().to_string();
        }
        if !dir.pop() {
            return working_dir.to_string();
        }
    }
}

fn is_dumb_terminal() -> bool {
    let term_is_dumb =
        std::env::var("TERM").map(|t| t.starts_with("dumb")).unwrap_or(false);
    term_is_dumb || !io::stderr().is_terminal()
}

/// SIGINT outside raw mode (dumb terminals) also cancels the build.
fn spawn_signal_handler(
    render_queue: mpsc::UnboundedSender<Message>,
    daemon_dispatch: mpsc::UnboundedSender<Message>,
) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = daemon_dispatch.send(Message::CancelBuild);
            let _ = render_queue.send(Message::CancelBuild);
        }
    });
}
