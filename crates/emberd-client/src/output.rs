//! The render loop: a state machine consuming the daemon's event stream.
//!
//! [`TerminalOutput`] owns every piece of render state and is driven from
//! exactly one task; the reader and input handler only ever talk to it
//! through channels. Each accepted message mutates the model per the
//! protocol's reaction table, then the layout is recomposed and handed to
//! the display driver.
//!
//! Two modes exist: in buffering mode per-project log lines accumulate in
//! rolling windows while the project is active; in no-buffering mode (or
//! on a dumb terminal) lines stream straight to the sink, prefixed with
//! their project id when the build is parallel.

use std::{
    io::Write,
    time::Instant,
};

use emberd_proto::Message;
use tokio::sync::mpsc;

use crate::{
    display::LiveDisplay,
    error::ClientError,
    layout,
    model::RenderState,
    sink::ClientLog,
    styled::{bold_fg, Line},
};

/// Keystrokes understood by the render loop.
mod key {
    /// Grow the per-project rolling window.
    pub const PLUS: char = '+';
    /// Shrink the per-project rolling window.
    pub const MINUS: char = '-';
    /// Toggle no-buffering mode.
    pub const CTRL_B: char = '\u{2}';
    /// Force a full redraw.
    pub const CTRL_L: char = '\u{c}';
    /// Toggle flush-on-project-completion.
    pub const CTRL_M: char = '\u{d}';
}

/// Exception class rewritten into a friendlier message.
const UNRECOGNIZED_OPTION: &str = "org.apache.commons.cli.UnrecognizedOptionException";

/// Terminal failures must not masquerade as sink failures; only genuine
/// sink I/O goes through the blanket `io::Error` conversion.
fn terminal_err(error: std::io::Error) -> ClientError {
    ClientError::Terminal(error.to_string())
}

/// Modal request handed to the input handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRequest {
    /// Read one line (masked when `password`) and answer the daemon.
    Prompt {
        /// Project the prompt belongs to.
        project_id: String,
        /// Correlation id echoed in the response.
        uid: String,
        /// Prompt text to present.
        message: String,
        /// Mask the typed reply.
        password: bool,
    },
    /// Read up to `bytes_to_read` bytes and stream them as `InputData`.
    ProjectInput {
        /// Requesting project.
        project_id: String,
        /// Upper bound on bytes to read.
        bytes_to_read: i32,
    },
}

/// How the render loop ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Exit code from `BuildFinished`, when one arrived.
    pub exit_code: Option<i32>,
    /// The build was canceled by the user.
    pub canceled: bool,
    /// The build died on a `BuildException`.
    pub exception: bool,
}

impl Outcome {
    /// Process exit code for the client: the daemon's exit code on a
    /// finished build, 1 otherwise.
    #[must_use]
    pub fn process_exit_code(&self) -> i32 {
        if self.canceled || self.exception {
            return 1;
        }
        self.exit_code.unwrap_or(1)
    }
}

/// Static configuration for the render loop.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Identifier shown in the status line.
    pub daemon_id: String,
    /// Initial rolling window height.
    pub rolling_window: usize,
    /// Start in no-buffering mode.
    pub no_buffering: bool,
    /// Terminal cannot address the cursor; degrade to append-only.
    pub dumb: bool,
}

/// The render loop and its state.
pub struct TerminalOutput<W: Write> {
    state: RenderState,
    display: LiveDisplay<W>,
    sink: Box<dyn ClientLog>,
    dumb: bool,
    start: Instant,
    size: Box<dyn Fn() -> (u16, u16) + Send>,
    input_requests: mpsc::UnboundedSender<InputRequest>,
    daemon_dispatch: mpsc::UnboundedSender<Message>,
    outcome: Outcome,
}

impl<W: Write> TerminalOutput<W> {
    /// Wire up a render loop.
    ///
    /// `size` supplies the terminal dimensions per repaint; production
    /// passes a `crossterm::terminal::size` adapter, tests a constant.
    pub fn new(
        config: OutputConfig,
        display: LiveDisplay<W>,
        sink: Box<dyn ClientLog>,
        size: Box<dyn Fn() -> (u16, u16) + Send>,
        input_requests: mpsc::UnboundedSender<InputRequest>,
        daemon_dispatch: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            state: RenderState::new(config.daemon_id, config.rolling_window, config.no_buffering),
            display,
            sink,
            dumb: config.dumb,
            start: Instant::now(),
            size,
            input_requests,
            daemon_dispatch,
            outcome: Outcome::default(),
        }
    }

    /// Render state, for inspection.
    #[must_use]
    pub fn state(&self) -> &RenderState {
        &self.state
    }

    /// Display driver, for inspection.
    #[must_use]
    pub fn display(&self) -> &LiveDisplay<W> {
        &self.display
    }

    /// How the loop ended.
    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Emit a diagnostic line describing the acquired terminal through
    /// the normal sink path.
    pub fn describe_terminal(&mut self) -> Result<(), ClientError> {
        let (cols, rows) = (self.size)();
        let kind = if self.dumb { "dumb" } else { "interactive" };
        let described = Message::log(format!("Terminal: {kind} ({cols}x{rows})"));
        self.accept(&described)?;
        Ok(())
    }

    /// Drive the loop from an inbound queue until a terminator arrives or
    /// the queue closes.
    ///
    /// Messages already queued behind the first one are drained and
    /// consumed as a batch, left to right, before a single repaint.
    pub async fn run(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Result<Outcome, ClientError> {
        while let Some(first) = inbound.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = inbound.try_recv() {
                batch.push(next);
            }
            if !self.accept_batch(&batch)? {
                return Ok(self.outcome.clone());
            }
        }
        Err(ClientError::Connection("event stream closed before the build finished".into()))
    }

    /// Consume one message and repaint. Returns `false` when the loop
    /// must stop.
    pub fn accept(&mut self, message: &Message) -> Result<bool, ClientError> {
        if !self.consume(message)? {
            return Ok(false);
        }
        self.update()?;
        Ok(true)
    }

    /// Consume a batch left-to-right with one repaint at the end.
    pub fn accept_batch(&mut self, batch: &[Message]) -> Result<bool, ClientError> {
        for message in batch {
            if !self.consume(message)? {
                return Ok(false);
            }
        }
        self.update()?;
        Ok(true)
    }

    /// Apply one message to the model. Returns `false` on terminators.
    fn consume(&mut self, message: &Message) -> Result<bool, ClientError> {
        match message {
            Message::BuildStarted {
                project_id,
                project_count,
                max_threads,
                artifact_id_display_length,
            } => {
                self.state.name = Some(project_id.clone());
                self.state.total_projects = *project_count;
                self.state.max_threads = *max_threads;
                self.state.artifact_width =
                    usize::try_from(*artifact_id_display_length).unwrap_or(0);
                if *max_threads <= 1 || *project_count <= 1 {
                    self.state.no_buffering = true;
                    self.display.clear().map_err(terminal_err)?;
                    self.apply_no_buffering()?;
                }
            },
            Message::CancelBuild => {
                self.drain_project_logs()?;
                self.display.clear().map_err(terminal_err)?;
                self.close_sink()?;
                self.display
                    .print_above(&Line::styled(
                        "The build was canceled",
                        bold_fg(crossterm::style::Color::Red),
                    ))
                    .map_err(terminal_err)?;
                self.outcome.canceled = true;
                return Ok(false);
            },
            Message::BuildException { message, class_name, .. } => {
                let text = if class_name == UNRECOGNIZED_OPTION {
                    format!("Unable to parse command line options: {message}")
                } else {
                    format!("{class_name}: {message}")
                };
                self.drain_project_logs()?;
                self.display.clear().map_err(terminal_err)?;
                self.close_sink()?;
                self.display
                    .print_above(&Line::styled(text, bold_fg(crossterm::style::Color::Red)))
                    .map_err(terminal_err)?;
                self.outcome.exception = true;
                return Ok(false);
            },
            Message::ProjectStarted { project_id } => {
                self.state.insert_project(project_id);
            },
            Message::MojoStarted(execution) => {
                self.state.project_or_insert(&execution.artifact_id).running_execution =
                    Some(execution.clone());
            },
            Message::ProjectStopped { project_id } => {
                if let Some(project) = self.state.remove_project(project_id) {
                    for line in &project.log {
                        self.sink.accept(line)?;
                    }
                } else {
                    tracing::debug!(%project_id, "stop for unknown project");
                }
                self.state.done_projects += 1;
                if self.state.display_done {
                    self.flush_sink()?;
                }
            },
            Message::BuildStatus { message } => {
                self.state.build_status = Some(message.clone());
            },
            Message::BuildFinished { exit_code } => {
                self.drain_project_logs()?;
                self.display.clear().map_err(terminal_err)?;
                self.close_sink()?;
                self.outcome.exit_code = Some(*exit_code);
                return Ok(false);
            },
            Message::KeepAlive => {},
            Message::Display { project_id, message } => {
                self.display
                    .print_above(&Line::plain(format!("[{project_id}] {message}")))
                    .map_err(terminal_err)?;
            },
            Message::PrintOut { message } => {
                if self.sink.is_file_backed() {
                    self.sink.accept(message)?;
                } else {
                    self.display.clear().map_err(terminal_err)?;
                    println!("{message}");
                }
            },
            Message::PrintErr { message } => {
                if self.sink.is_file_backed() {
                    self.sink.accept(message)?;
                } else {
                    self.display.clear().map_err(terminal_err)?;
                    eprintln!("{message}");
                }
            },
            Message::Prompt { project_id, uid, message, password } => {
                if self.dumb {
                    self.display.writer().write_all(b"\n").map_err(terminal_err)?;
                    return Ok(true);
                }
                self.display.clear().map_err(terminal_err)?;
                let request = InputRequest::Prompt {
                    project_id: project_id.clone(),
                    uid: uid.clone(),
                    message: message.clone(),
                    password: *password,
                };
                if self.input_requests.send(request).is_err() {
                    tracing::warn!("input handler gone; prompt dropped");
                }
            },
            Message::BuildLogMessage { message } => {
                self.sink.accept(message)?;
            },
            Message::ProjectLogMessage { project_id, message } => {
                let parallel = self.state.max_threads > 1;
                let streaming = self.state.no_buffering || self.dumb;
                match self.state.project_mut(project_id) {
                    Some(project) if !streaming => project.log.push(message.clone()),
                    // unknown project, no-buffering, or dumb: write now
                    _ => {
                        if parallel {
                            self.sink.accept(&format!("[{project_id}] {message}"))?;
                        } else {
                            self.sink.accept(message)?;
                        }
                    },
                }
            },
            Message::KeyboardInput { key } => self.keystroke(*key)?,
            Message::Transfer { phase, event } => {
                self.state.transfers.record(*phase, event.clone());
            },
            Message::ExecutionFailure { .. } => {
                self.state.record_failure(message);
            },
            Message::RequestInput { project_id, bytes_to_read } => {
                let request = InputRequest::ProjectInput {
                    project_id: project_id.clone(),
                    bytes_to_read: *bytes_to_read,
                };
                if self.input_requests.send(request).is_err() {
                    tracing::warn!("input handler gone; input request dropped");
                }
            },
            Message::InputData { .. } => {
                if self.daemon_dispatch.send(message.clone()).is_err() {
                    tracing::warn!("daemon dispatch closed; input data dropped");
                }
            },
            // Client-bound streams never carry these; tolerate and log.
            Message::BuildRequest { .. } | Message::PromptResponse { .. } | Message::Stop => {
                tracing::warn!(tag = message.tag(), "unexpected message on render queue");
            },
        }
        Ok(true)
    }

    fn keystroke(&mut self, keystroke: char) -> Result<(), ClientError> {
        match keystroke {
            key::PLUS => {
                self.state.lines_per_project = (self.state.lines_per_project + 1).min(10);
            },
            key::MINUS => {
                self.state.lines_per_project = self.state.lines_per_project.saturating_sub(1);
            },
            key::CTRL_B => {
                self.state.no_buffering = !self.state.no_buffering;
                if self.state.no_buffering {
                    self.apply_no_buffering()?;
                } else {
                    self.display.clear().map_err(terminal_err)?;
                }
            },
            key::CTRL_L => self.display.clear().map_err(terminal_err)?,
            key::CTRL_M => {
                self.state.display_done = !self.state.display_done;
                if self.state.display_done {
                    self.flush_sink()?;
                }
            },
            other => tracing::debug!(?other, "ignored keystroke"),
        }
        Ok(())
    }

    /// Flush all project buffers to the sink and drop the rolling
    /// windows.
    fn apply_no_buffering(&mut self) -> Result<(), ClientError> {
        self.drain_project_logs()?;
        self.state.projects.clear();
        Ok(())
    }

    fn drain_project_logs(&mut self) -> Result<(), ClientError> {
        for project in &self.state.projects {
            for line in &project.log {
                self.sink.accept(line)?;
            }
        }
        for project in &mut self.state.projects {
            project.log.clear();
        }
        Ok(())
    }

    /// Flush the sink; lines handed back (collector mode) go to stdout
    /// after the live display is cleared.
    fn flush_sink(&mut self) -> Result<(), ClientError> {
        let lines = self.sink.flush()?;
        self.print_collected(lines)
    }

    fn close_sink(&mut self) -> Result<(), ClientError> {
        let lines = self.sink.close()?;
        self.print_collected(lines)
    }

    fn print_collected(&mut self, lines: Vec<String>) -> Result<(), ClientError> {
        if lines.is_empty() {
            return Ok(());
        }
        self.display.clear().map_err(terminal_err)?;
        for line in lines {
            println!("{line}");
        }
        Ok(())
    }

    /// Repaint after a message or batch.
    fn update(&mut self) -> Result<(), ClientError> {
        if self.state.no_buffering || self.dumb {
            self.flush_sink()?;
            return Ok(());
        }
        let (cols, rows) = (self.size)();
        if rows == 0 {
            self.display.clear().map_err(terminal_err)?;
            return Ok(());
        }
        let frame = layout::compose_frame(&self.state, rows, cols, self.start.elapsed());
        // a failed repaint is skipped; the next frame tries again
        if let Err(error) = self.display.update(&frame) {
            tracing::warn!(%error, "repaint failed; skipping frame");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Sink recording accepted lines behind a shared handle.
    #[derive(Clone, Default)]
    struct RecordingSink {
        lines: Arc<Mutex<Vec<String>>>,
        file_backed: bool,
    }

    impl RecordingSink {
        fn file_backed() -> Self {
            Self { file_backed: true, ..Self::default() }
        }

        fn recorded(&self) -> Vec<String> {
            self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }
    }

    impl ClientLog for RecordingSink {
        fn accept(&mut self, line: &str) -> std::io::Result<()> {
            self.lines.lock().unwrap_or_else(|p| p.into_inner()).push(line.to_owned());
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn close(&mut self) -> std::io::Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn is_file_backed(&self) -> bool {
            self.file_backed
        }
    }

    struct Harness {
        output: TerminalOutput<Vec<u8>>,
        sink: RecordingSink,
        input_requests: mpsc::UnboundedReceiver<InputRequest>,
        daemon_dispatch: mpsc::UnboundedReceiver<Message>,
    }

    fn harness() -> Harness {
        let sink = RecordingSink::file_backed();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let output = TerminalOutput::new(
            OutputConfig {
                daemon_id: "d-1".into(),
                rolling_window: 3,
                no_buffering: false,
                dumb: false,
            },
            LiveDisplay::new(Vec::new(), true),
            Box::new(sink.clone()),
            Box::new(|| (80, 24)),
            input_tx,
            dispatch_tx,
        );
        Harness { output, sink, input_requests: input_rx, daemon_dispatch: dispatch_rx }
    }

    fn build_started(count: i32, threads: i32) -> Message {
        Message::BuildStarted {
            project_id: "root".into(),
            project_count: count,
            max_threads: threads,
            artifact_id_display_length: 10,
        }
    }

    #[test]
    fn serial_build_streams_lines_straight_through() {
        let mut h = harness();
        let sequence = [
            build_started(1, 1),
            Message::project_started("a"),
            Message::project_log("a", "L1"),
            Message::project_stopped("a"),
        ];
        for message in &sequence {
            assert!(h.output.accept(message).unwrap());
        }
        assert!(!h.output.accept(&Message::BuildFinished { exit_code: 0 }).unwrap());

        assert_eq!(h.sink.recorded(), vec!["L1"]);
        assert!(h.output.state().projects.is_empty());
        assert_eq!(h.output.outcome().exit_code, Some(0));
        assert_eq!(h.output.outcome().process_exit_code(), 0);
    }

    #[test]
    fn parallel_build_buffers_until_project_stops() {
        let mut h = harness();
        h.output.accept(&build_started(3, 2)).unwrap();
        h.output.accept(&Message::project_started("a")).unwrap();
        h.output.accept(&Message::project_log("a", "first")).unwrap();
        h.output.accept(&Message::project_log("a", "second")).unwrap();

        assert!(h.sink.recorded().is_empty(), "buffering mode must not write yet");

        h.output.accept(&Message::project_stopped("a")).unwrap();
        assert_eq!(h.sink.recorded(), vec!["first", "second"]);
        assert_eq!(h.output.state().done_projects, 1);
    }

    #[test]
    fn unknown_project_lines_fall_through_to_the_sink() {
        let mut h = harness();
        h.output.accept(&build_started(3, 2)).unwrap();
        h.output.accept(&Message::project_log("ghost", "orphan")).unwrap();
        assert_eq!(h.sink.recorded(), vec!["[ghost] orphan"]);
    }

    #[test]
    fn no_buffering_prefixes_parallel_lines() {
        let mut h = harness();
        h.output.accept(&build_started(3, 2)).unwrap();
        h.output.accept(&Message::project_started("a")).unwrap();
        h.output.accept(&Message::keyboard_input('\u{2}')).unwrap();
        h.output.accept(&Message::project_log("a", "line")).unwrap();
        assert_eq!(h.sink.recorded(), vec!["[a] line"]);
    }

    #[test]
    fn finish_clears_the_live_display_even_with_a_file_backed_sink() {
        let mut h = harness();
        h.output.accept(&build_started(3, 2)).unwrap();
        h.output.accept(&Message::project_started("a")).unwrap();
        assert!(!h.output.display().drawn().is_empty(), "frame drawn while building");

        // the file-backed sink hands nothing back to print on close; the
        // region must be erased regardless
        assert!(!h.output.accept(&Message::BuildFinished { exit_code: 0 }).unwrap());
        assert!(h.output.display().drawn().is_empty(), "region erased on finish");
    }

    #[test]
    fn cancel_prints_one_bold_red_line_and_stops() {
        let mut h = harness();
        h.output.accept(&build_started(3, 2)).unwrap();
        assert!(!h.output.accept(&Message::CancelBuild).unwrap());

        let written = String::from_utf8_lossy(h.output.display().writer_ref()).to_string();
        assert_eq!(written.matches("The build was canceled").count(), 1);
        assert!(h.output.outcome().canceled);
        assert_eq!(h.output.outcome().process_exit_code(), 1);
    }

    #[test]
    fn unrecognized_option_exception_gets_a_friendly_prefix() {
        let mut h = harness();
        let exception = Message::BuildException {
            message: "--bogus".into(),
            class_name: "org.apache.commons.cli.UnrecognizedOptionException".into(),
            stack_trace: String::new(),
        };
        assert!(!h.output.accept(&exception).unwrap());
        let written = String::from_utf8_lossy(h.output.display().writer_ref()).to_string();
        assert!(written.contains("Unable to parse command line options: --bogus"));
        assert!(h.output.outcome().exception);
    }

    #[test]
    fn other_exception_classes_pass_through_verbatim() {
        let mut h = harness();
        let exception = Message::BuildException {
            message: "boom".into(),
            class_name: "java.lang.IllegalStateException".into(),
            stack_trace: String::new(),
        };
        h.output.accept(&exception).unwrap();
        let written = String::from_utf8_lossy(h.output.display().writer_ref()).to_string();
        assert!(written.contains("java.lang.IllegalStateException: boom"));
    }

    #[test]
    fn prompt_routes_to_the_input_handler() {
        let mut h = harness();
        let prompt = Message::Prompt {
            project_id: "a".into(),
            uid: "u1".into(),
            message: "Token:".into(),
            password: true,
        };
        h.output.accept(&prompt).unwrap();
        assert_eq!(
            h.input_requests.try_recv().unwrap(),
            InputRequest::Prompt {
                project_id: "a".into(),
                uid: "u1".into(),
                message: "Token:".into(),
                password: true,
            }
        );
    }

    #[test]
    fn input_data_forwards_to_the_daemon() {
        let mut h = harness();
        h.output.accept(&Message::input_data("abc")).unwrap();
        h.output.accept(&Message::input_eof()).unwrap();
        assert_eq!(h.daemon_dispatch.try_recv().unwrap(), Message::input_data("abc"));
        assert_eq!(h.daemon_dispatch.try_recv().unwrap(), Message::input_eof());
    }

    #[test]
    fn window_keys_clamp_between_zero_and_ten() {
        let mut h = harness();
        for _ in 0..20 {
            h.output.accept(&Message::keyboard_input('+')).unwrap();
        }
        assert_eq!(h.output.state().lines_per_project, 10);
        for _ in 0..20 {
            h.output.accept(&Message::keyboard_input('-')).unwrap();
        }
        assert_eq!(h.output.state().lines_per_project, 0);
    }

    #[test]
    fn ctrl_b_flushes_buffers_and_clears_projects() {
        let mut h = harness();
        h.output.accept(&build_started(3, 2)).unwrap();
        h.output.accept(&Message::project_started("a")).unwrap();
        h.output.accept(&Message::project_log("a", "pending")).unwrap();

        h.output.accept(&Message::keyboard_input('\u{2}')).unwrap();
        assert!(h.output.state().no_buffering);
        assert!(h.output.state().projects.is_empty());
        assert_eq!(h.sink.recorded(), vec!["pending"]);
    }

    #[test]
    fn batch_stops_at_the_terminator() {
        let mut h = harness();
        let batch = vec![
            build_started(2, 2),
            Message::project_started("a"),
            Message::BuildFinished { exit_code: 3 },
            Message::project_started("never-seen"),
        ];
        assert!(!h.output.accept_batch(&batch).unwrap());
        assert_eq!(h.output.outcome().exit_code, Some(3));
        assert_eq!(h.output.outcome().process_exit_code(), 3);
    }

    #[tokio::test]
    async fn run_drains_the_queue_until_finished() {
        let mut h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(build_started(2, 2)).unwrap();
        tx.send(Message::project_started("a")).unwrap();
        tx.send(Message::project_stopped("a")).unwrap();
        tx.send(Message::BuildFinished { exit_code: 0 }).unwrap();

        let outcome = h.output.run(&mut rx).await.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn closed_queue_is_a_connection_error() {
        let mut h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        drop(tx);
        assert!(matches!(h.output.run(&mut rx).await, Err(ClientError::Connection(_))));
    }
}
