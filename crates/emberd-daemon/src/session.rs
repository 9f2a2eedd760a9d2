//! Per-connection session host.
//!
//! One session owns one client connection for the duration of one build:
//! read the leading `BuildRequest`, apply resumption data, run the
//! engine, and pump its event stream back to the client. Engine events
//! are drained in bursts and stably sorted into canonical replay order
//! before dispatch; cancel, prompt-response and input traffic from the
//! client is routed to the engine while it runs.
//!
//! A `CancelBuild` interrupts the engine but keeps the channel open: the
//! usual termination sequence (final log drains, then `BuildFinished` or
//! `BuildException`) still reaches the client.

use std::{path::Path, time::Duration};

use bytes::BytesMut;
use emberd_proto::{encode_message, read_message, Message, Sequenced};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
};

use crate::{
    engine::{BuildEngine, EngineRequest},
    error::DaemonError,
    resume,
};

/// Idle interval after which the writer enqueues a `KeepAlive`.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Inbound silence after which the client is considered gone.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept clients forever, one session task per connection.
///
/// `factory` produces a fresh engine per session.
pub async fn serve<E, F>(listener: TcpListener, factory: F) -> std::io::Result<()>
where
    E: BuildEngine,
    F: Fn() -> E + Send + Sync + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "client connected");
        let engine = factory();
        tokio::spawn(async move {
            if let Err(error) = session(stream, engine).await {
                tracing::warn!(%peer, %error, "session ended with error");
            } else {
                tracing::info!(%peer, "session finished");
            }
        });
    }
}

/// Run one client session to completion.
///
/// # Errors
///
/// Fails on socket errors, codec errors, or a session that does not open
/// with a `BuildRequest`.
pub async fn session<E: BuildEngine>(stream: TcpStream, engine: E) -> Result<(), DaemonError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_loop(read_half, inbound_tx));
    let writer = tokio::spawn(write_loop(write_half, outbound_rx));

    let result = drive_build(&mut inbound_rx, &outbound_tx, engine).await;

    // let the writer drain the termination sequence, then stop the reader
    drop(outbound_tx);
    let _ = writer.await;
    reader.abort();
    result
}

async fn drive_build<E: BuildEngine>(
    inbound: &mut mpsc::UnboundedReceiver<Message>,
    outbound: &mpsc::UnboundedSender<Message>,
    engine: E,
) -> Result<(), DaemonError> {
    let mut request = opening_request(inbound).await?;

    let resume_dir = Path::new(&request.project_dir).join("target");
    resume::apply(&mut request, &resume_dir);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let engine_task = tokio::spawn(engine.run(request, events_tx, commands_rx));

    let mut client_gone = false;
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(first) => {
                    // burst-drain, then canonical replay order
                    let mut batch = vec![Sequenced::new(first)];
                    while let Ok(next) = events_rx.try_recv() {
                        batch.push(Sequenced::new(next));
                    }
                    batch.sort();
                    for event in batch {
                        if outbound.send(event.into_message()).is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                },
                // engine dropped its sender: the build is over
                None => break,
            },
            message = inbound.recv(), if !client_gone => match message {
                Some(Message::KeepAlive) => {},
                Some(Message::CancelBuild) | Some(Message::Stop) => {
                    let _ = commands_tx.send(Message::CancelBuild);
                },
                Some(message @ (Message::PromptResponse { .. } | Message::InputData { .. })) => {
                    let _ = commands_tx.send(message);
                },
                Some(other) => {
                    tracing::warn!(tag = other.tag(), "unexpected message mid-session");
                },
                None => {
                    client_gone = true;
                    let _ = commands_tx.send(Message::CancelBuild);
                },
            },
        }
    }

    let terminator = match engine_task.await {
        Ok(Ok(outcome)) => {
            if outcome.exit_code == 0 {
                resume::remove(&resume_dir);
            } else if !outcome.remaining_projects.is_empty() {
                if let Err(error) = resume::persist(&resume_dir, &outcome.remaining_projects) {
                    tracing::warn!(%error, "could not persist resumption data");
                }
            }
            Message::BuildFinished { exit_code: outcome.exit_code }
        },
        Ok(Err(failure)) => failure.into_message(),
        Err(join_error) => Message::BuildException {
            message: join_error.to_string(),
            class_name: "emberd.daemon.EngineCrash".into(),
            stack_trace: String::new(),
        },
    };
    let _ = outbound.send(terminator);

    if client_gone {
        return Err(DaemonError::ClientGone);
    }
    Ok(())
}

/// Wait for the leading `BuildRequest`, skipping keep-alives.
async fn opening_request(
    inbound: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<EngineRequest, DaemonError> {
    loop {
        let message = tokio::time::timeout(LIVENESS_TIMEOUT, inbound.recv())
            .await
            .map_err(|_| DaemonError::ClientTimeout)?
            .ok_or(DaemonError::ClientGone)?;
        match message {
            Message::KeepAlive => {},
            opening @ Message::BuildRequest { .. } => {
                let tag = opening.tag();
                return EngineRequest::from_message(&opening)
                    .ok_or(DaemonError::UnexpectedOpening(tag));
            },
            other => return Err(DaemonError::UnexpectedOpening(other.tag())),
        }
    }
}

/// Decode client records until EOF, error, or liveness timeout.
async fn read_loop(read_half: OwnedReadHalf, inbound: mpsc::UnboundedSender<Message>) {
    let mut reader = BufReader::new(read_half);
    loop {
        match tokio::time::timeout(LIVENESS_TIMEOUT, read_message(&mut reader)).await {
            Ok(Ok(Some(message))) => {
                if inbound.send(message).is_err() {
                    return;
                }
            },
            Ok(Ok(None)) => return,
            Ok(Err(error)) => {
                tracing::warn!(%error, "client stream failed");
                return;
            },
            Err(_) => {
                tracing::warn!("client silent past the liveness timeout");
                return;
            },
        }
    }
}

/// Serialize outbound records; inject `KeepAlive` when idle.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
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
        if write_half.write_all(&buf).await.is_err() || write_half.flush().await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt as _;

    use super::*;
    use crate::engine::{EngineFailure, SimulatedEngine};

    async fn start<E: BuildEngine>(engine: E) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let _ = session(stream, engine).await;
        });
        addr
    }

    async fn open_client(addr: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half), write_half)
    }

    async fn send(write_half: &mut OwnedWriteHalf, message: &Message) {
        let mut buf = BytesMut::new();
        encode_message(message, &mut buf);
        write_half.write_all(&buf).await.expect("write");
    }

    fn build_request(project_dir: &str) -> Message {
        Message::BuildRequest {
            args: vec!["verify".into()],
            working_dir: project_dir.into(),
            project_dir: project_dir.into(),
            env: vec![],
        }
    }

    /// Read until a terminator, collecting tags (keep-alives skipped).
    async fn collect_session(reader: &mut BufReader<OwnedReadHalf>) -> Vec<Message> {
        let mut seen = Vec::new();
        while let Some(message) = read_message(reader).await.expect("decode") {
            if message == Message::KeepAlive {
                continue;
            }
            let done = matches!(
                message,
                Message::BuildFinished { .. } | Message::BuildException { .. }
            );
            seen.push(message);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn scripted_build_reaches_the_client_in_replay_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let addr = start(SimulatedEngine::demo()).await;
        let (mut reader, mut writer) = open_client(&addr).await;

        send(&mut writer, &build_request(&dir.path().display().to_string())).await;
        let seen = collect_session(&mut reader).await;

        assert!(matches!(seen.first(), Some(Message::BuildStarted { .. })));
        assert_eq!(seen.last(), Some(&Message::BuildFinished { exit_code: 0 }));

        // replay order puts both project logs before any ProjectStopped
        let first_stop = seen
            .iter()
            .position(|m| matches!(m, Message::ProjectStopped { .. }))
            .expect("stops present");
        let last_log = seen
            .iter()
            .rposition(|m| matches!(m, Message::ProjectLogMessage { .. }))
            .expect("logs present");
        assert!(last_log < first_stop, "logs must replay before stops");
    }

    /// Engine that idles until a command arrives, so cancellation tests
    /// are deterministic.
    struct WaitingEngine;

    impl BuildEngine for WaitingEngine {
        async fn run(
            self,
            _request: EngineRequest,
            events: mpsc::UnboundedSender<Message>,
            mut commands: mpsc::UnboundedReceiver<Message>,
        ) -> Result<crate::engine::BuildOutcome, EngineFailure> {
            let _ = events.send(Message::log("waiting for input"));
            while let Some(command) = commands.recv().await {
                if command == Message::CancelBuild {
                    return Ok(crate::engine::BuildOutcome {
                        exit_code: 130,
                        remaining_projects: Vec::new(),
                    });
                }
            }
            Ok(crate::engine::BuildOutcome::success())
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_but_still_terminates_normally() {
        let dir = tempfile::tempdir().expect("tempdir");
        let addr = start(WaitingEngine).await;
        let (mut reader, mut writer) = open_client(&addr).await;

        send(&mut writer, &build_request(&dir.path().display().to_string())).await;
        send(&mut writer, &Message::CancelBuild).await;

        let seen = collect_session(&mut reader).await;
        assert_eq!(seen.last(), Some(&Message::BuildFinished { exit_code: 130 }));
    }

    #[tokio::test]
    async fn engine_failure_becomes_a_build_exception() {
        let dir = tempfile::tempdir().expect("tempdir");
        let addr = start(SimulatedEngine {
            script: vec![],
            failure: Some(EngineFailure {
                message: "plugin resolution failed".into(),
                class_name: "org.example.ResolutionException".into(),
                stack_trace: "at org.example...".into(),
            }),
            ..SimulatedEngine::default()
        })
        .await;
        let (mut reader, mut writer) = open_client(&addr).await;

        send(&mut writer, &build_request(&dir.path().display().to_string())).await;
        let seen = collect_session(&mut reader).await;

        match seen.last() {
            Some(Message::BuildException { class_name, .. }) => {
                assert_eq!(class_name, "org.example.ResolutionException");
            },
            other => panic!("expected BuildException, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_build_persists_resumption_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let addr = start(SimulatedEngine {
            script: vec![],
            exit_code: 1,
            remaining_projects: vec!["cli".into(), "docs".into()],
            failure: None,
        })
        .await;
        let (mut reader, mut writer) = open_client(&addr).await;

        send(&mut writer, &build_request(&dir.path().display().to_string())).await;
        let seen = collect_session(&mut reader).await;
        assert_eq!(seen.last(), Some(&Message::BuildFinished { exit_code: 1 }));

        let stored =
            std::fs::read_to_string(dir.path().join("target").join(resume::RESUME_PROPERTIES))
                .expect("resume file");
        assert!(stored.contains("remainingProjects = cli, docs"));
    }

    #[tokio::test]
    async fn wrong_opening_message_fails_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            session(stream, SimulatedEngine::demo()).await
        });

        let (_reader, mut writer) = open_client(&addr).await;
        send(&mut writer, &Message::CancelBuild).await;

        let result = handle.await.expect("join");
        assert!(matches!(result, Err(DaemonError::UnexpectedOpening(tag)) if tag == Message::CANCEL_BUILD));
    }
}
