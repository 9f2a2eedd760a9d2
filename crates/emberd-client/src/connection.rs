//! Socket transport between the client and a daemon.
//!
//! [`connect`] bridges a loopback TCP stream onto channels: a spawned
//! reader task decodes records into the caller's inbound queue, a
//! spawned writer task drains the outbound queue and serializes records,
//! one `write_all` per message so writes stay atomic. The writer injects
//! a `KeepAlive` after one second of idleness; the reader declares the
//! connection dead after ten seconds of silence.
//!
//! The inbound queue is supplied by the caller because it is shared: the
//! input handler enqueues `KeyboardInput` and `CancelBuild` onto the
//! same queue the reader fills, and the render loop consumes them in
//! arrival order. End of stream is therefore reported on the error
//! channel, not by closing the queue.

use std::time::Duration;

use bytes::BytesMut;
use emberd_proto::{encode_message, read_message, Message};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    task::AbortHandle,
};

use crate::error::ClientError;

/// Idle interval after which the writer enqueues a `KeepAlive`.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Inbound silence after which the connection is considered dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a connected daemon.
///
/// Outbound messages go through `to_daemon`; inbound records arrive on
/// the queue given to [`connect`]. Receiving on `errors` means the
/// connection is gone, including a clean close (only ordinary
/// after the terminator has already been delivered).
pub struct DaemonConnection {
    /// Send messages to the daemon.
    pub to_daemon: mpsc::UnboundedSender<Message>,
    /// Fatal transport/protocol errors and end-of-stream.
    pub errors: mpsc::Receiver<ClientError>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl DaemonConnection {
    /// Abort both socket tasks.
    pub fn stop(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Connect to the daemon at `addr` (host:port on the loopback),
/// delivering inbound records to `inbound`.
///
/// # Errors
///
/// [`ClientError::Connection`] when the socket cannot be established.
pub async fn connect(
    addr: &str,
    inbound: mpsc::UnboundedSender<Message>,
) -> Result<DaemonConnection, ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClientError::Connection(format!("connect to {addr} failed: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| ClientError::Connection(format!("socket setup failed: {e}")))?;

    Ok(spawn_io(stream, inbound))
}

/// Bridge an established stream onto channels.
///
/// Split out of [`connect`] so tests and in-process peers can drive the
/// same I/O tasks over any `TcpStream`.
pub fn spawn_io(stream: TcpStream, inbound: mpsc::UnboundedSender<Message>) -> DaemonConnection {
    let (read_half, write_half) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = mpsc::channel(1);

    let reader = tokio::spawn(read_loop(read_half, inbound, error_tx.clone()));
    let writer = tokio::spawn(write_loop(write_half, outbound_rx, error_tx));

    DaemonConnection {
        to_daemon: outbound_tx,
        errors: error_rx,
        reader: reader.abort_handle(),
        writer: writer.abort_handle(),
    }
}

/// Decode records until EOF, error, or liveness timeout.
///
/// Every exit reports on the error channel; the inbound queue itself
/// stays open for the other producers.
async fn read_loop(
    read_half: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Message>,
    errors: mpsc::Sender<ClientError>,
) {
    let mut reader = BufReader::new(read_half);

    loop {
        let next = tokio::time::timeout(LIVENESS_TIMEOUT, read_message(&mut reader)).await;
        match next {
            Ok(Ok(Some(message))) => {
                if inbound.send(message).is_err() {
                    return;
                }
            },
            Ok(Ok(None)) => {
                let _ = errors
                    .try_send(ClientError::Connection("daemon closed the connection".into()));
                return;
            },
            Ok(Err(error)) => {
                let _ = errors.try_send(ClientError::Protocol(error));
                return;
            },
            Err(_) => {
                let _ = errors.try_send(ClientError::Connection(format!(
                    "no traffic from daemon for {LIVENESS_TIMEOUT:?}"
                )));
                return;
            },
        }
    }
}

/// Serialize outbound records; inject `KeepAlive` when idle.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    errors: mpsc::Sender<ClientError>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            () = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => Message::KeepAlive,
        };

        buf.clear();
        encode_message(&message, &mut buf);
        if let Err(error) = write_half.write_all(&buf).await {
            let _ = errors.try_send(ClientError::Connection(format!("write failed: {error}")));
            return;
        }
        if let Err(error) = write_half.flush().await {
            let _ = errors.try_send(ClientError::Connection(format!("flush failed: {error}")));
            return;
        }
    }

    let _ = write_half.shutdown().await;
}
