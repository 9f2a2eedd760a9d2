//! The message model: a closed tagged union of every record the client
//! and daemon exchange.
//!
//! Each variant corresponds to exactly one wire tag (1..=28). Modelling
//! the set as a closed sum keeps dispatch exhaustive: adding a variant
//! breaks compilation in [`Message::tag`], the codec, and the replay
//! comparator rather than falling into an "unexpected type" branch at
//! runtime.
//!
//! `KeepAlive`, `Stop` and `CancelBuild` carry no payload and compare by
//! tag alone; they are the protocol's control constants.

/// Direction of a repository transfer request.
///
/// Stored as a raw `u8` on [`TransferEvent`] because the engine forwards
/// values it does not originate.
pub mod request_type {
    /// Artifact download.
    pub const GET: u8 = 0;
    /// Existence probe (HEAD-style).
    pub const GET_EXISTENCE: u8 = 1;
    /// Artifact upload.
    pub const PUT: u8 = 2;
}

/// Lifecycle phase of a repository transfer.
///
/// Phases map onto wire tags 18..=23 in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Transfer queued by the resolver.
    Initiated,
    /// First bytes on the wire.
    Started,
    /// Progress update; replaces the previous event for the resource.
    Progressed,
    /// Checksum mismatch after completion.
    Corrupted,
    /// Completed successfully.
    Succeeded,
    /// Aborted with an error.
    Failed,
}

impl TransferPhase {
    /// Whether this phase ends the transfer (removes it from live
    /// transfer tables).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Corrupted | Self::Succeeded | Self::Failed)
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            Message::TRANSFER_INITIATED => Some(Self::Initiated),
            Message::TRANSFER_STARTED => Some(Self::Started),
            Message::TRANSFER_PROGRESSED => Some(Self::Progressed),
            Message::TRANSFER_CORRUPTED => Some(Self::Corrupted),
            Message::TRANSFER_SUCCEEDED => Some(Self::Succeeded),
            Message::TRANSFER_FAILED => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Payload shared by the six transfer message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    /// Owning project, or empty for resolver-global transfers.
    pub project_id: String,
    /// One of the [`request_type`] constants.
    pub request_type: u8,
    /// Repository identifier (settings id).
    pub repository_id: String,
    /// Repository base URL.
    pub repository_url: String,
    /// Repository-relative resource path.
    pub resource_name: String,
    /// Total size in bytes, or -1 when unknown.
    pub content_length: i64,
    /// Bytes moved so far, or -1 when unknown.
    pub transferred_bytes: i64,
    /// Failure description for `Corrupted`/`Failed` phases.
    pub exception: Option<String>,
}

/// Payload of [`Message::MojoStarted`]: the plugin goal now executing
/// against a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MojoStarted {
    /// Project the goal runs against.
    pub artifact_id: String,
    /// Plugin group id.
    pub plugin_group_id: String,
    /// Plugin artifact id.
    pub plugin_artifact_id: String,
    /// Short goal prefix, possibly empty.
    pub plugin_goal_prefix: String,
    /// Plugin version.
    pub plugin_version: String,
    /// Goal name.
    pub mojo: String,
    /// Execution id within the build plan.
    pub execution_id: String,
}

/// A single record on the wire.
///
/// The payload layout of each variant is fixed by the protocol; see the
/// codec for the byte-level encoding. String fields are non-null unless
/// typed `Option<String>`; [`Message::InputData`] with `data == None` is
/// the EOF marker and the only place where a null string is meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client → daemon: run a build with these arguments.
    BuildRequest {
        /// Build-tool argument vector, forwarded verbatim.
        args: Vec<String>,
        /// Client working directory.
        working_dir: String,
        /// Detected project root directory.
        project_dir: String,
        /// Client environment, insertion-ordered.
        env: Vec<(String, String)>,
    },
    /// Daemon → client: the build plan is known, rendering can begin.
    BuildStarted {
        /// Root project id.
        project_id: String,
        /// Number of projects in the plan.
        project_count: i32,
        /// Degree of parallelism.
        max_threads: i32,
        /// Column width for aligned project ids.
        artifact_id_display_length: i32,
    },
    /// Daemon → client: terminal record of a completed build.
    BuildFinished {
        /// Process-style exit code.
        exit_code: i32,
    },
    /// Daemon → client: a project's build began.
    ProjectStarted {
        /// Project id.
        project_id: String,
    },
    /// Daemon → client: a project's build ended.
    ProjectStopped {
        /// Project id.
        project_id: String,
    },
    /// Daemon → client: a plugin goal started executing.
    MojoStarted(MojoStarted),
    /// Daemon → client: one log line attributed to a project.
    ProjectLogMessage {
        /// Project id.
        project_id: String,
        /// Log line, may carry ANSI escapes.
        message: String,
    },
    /// Daemon → client: one log line not attributed to any project.
    BuildLogMessage {
        /// Log line.
        message: String,
    },
    /// Daemon → client: terminal record of a build that died on an
    /// exception rather than completing.
    BuildException {
        /// Exception message.
        message: String,
        /// Fully-qualified exception class name (opaque except for the
        /// command-line-parse special case handled by the renderer).
        class_name: String,
        /// Rendered stack trace, opaque.
        stack_trace: String,
    },
    /// Both directions: traffic pacing during silence.
    KeepAlive,
    /// Both directions: end the session after the in-flight drain.
    Stop,
    /// Daemon → client: write a line through the display immediately.
    Display {
        /// Project id.
        project_id: String,
        /// Line to show.
        message: String,
    },
    /// Daemon → client: ask the user a question.
    Prompt {
        /// Project id.
        project_id: String,
        /// Correlation id echoed in the response.
        uid: String,
        /// Prompt text.
        message: String,
        /// Mask the typed reply.
        password: bool,
    },
    /// Client → daemon: the user's reply to a [`Message::Prompt`].
    PromptResponse {
        /// Project id from the prompt.
        project_id: String,
        /// Correlation id from the prompt.
        uid: String,
        /// Typed reply.
        message: String,
    },
    /// Daemon → client: replace the idle status-line text.
    BuildStatus {
        /// Status text.
        message: String,
    },
    /// Client-internal: one raw keystroke from the input handler.
    KeyboardInput {
        /// The key, a single character.
        key: char,
    },
    /// Client → daemon: interrupt the running build, keep the session.
    CancelBuild,
    /// Daemon → client: repository transfer lifecycle.
    Transfer {
        /// Which lifecycle edge this is.
        phase: TransferPhase,
        /// Transfer details.
        event: TransferEvent,
    },
    /// Daemon → client: a project failed (the build may continue).
    ExecutionFailure {
        /// Failed project id.
        project_id: String,
        /// Whether the failure halts the whole build.
        halted: bool,
        /// Failure description.
        exception: Option<String>,
    },
    /// Daemon → client: program output for stdout.
    PrintOut {
        /// Output line.
        message: String,
    },
    /// Daemon → client: program output for stderr.
    PrintErr {
        /// Output line.
        message: String,
    },
    /// Daemon → client: the build wants keyboard bytes.
    RequestInput {
        /// Project requesting input.
        project_id: String,
        /// Upper bound on bytes to read.
        bytes_to_read: i32,
    },
    /// Client → daemon: keyboard bytes, `None` meaning EOF.
    InputData {
        /// Chunk of input, or `None` to close the stream.
        data: Option<String>,
    },
}

impl Message {
    /// Wire tag of `BuildRequest`.
    pub const BUILD_REQUEST: u8 = 1;
    /// Wire tag of `BuildStarted`.
    pub const BUILD_STARTED: u8 = 2;
    /// Wire tag of `BuildFinished`.
    pub const BUILD_FINISHED: u8 = 3;
    /// Wire tag of `ProjectStarted`.
    pub const PROJECT_STARTED: u8 = 4;
    /// Wire tag of `ProjectStopped`.
    pub const PROJECT_STOPPED: u8 = 5;
    /// Wire tag of `MojoStarted`.
    pub const MOJO_STARTED: u8 = 6;
    /// Wire tag of `ProjectLogMessage`.
    pub const PROJECT_LOG_MESSAGE: u8 = 7;
    /// Wire tag of `BuildLogMessage`.
    pub const BUILD_LOG_MESSAGE: u8 = 8;
    /// Wire tag of `BuildException`.
    pub const BUILD_EXCEPTION: u8 = 9;
    /// Wire tag of `KeepAlive`.
    pub const KEEP_ALIVE: u8 = 10;
    /// Wire tag of `Stop`.
    pub const STOP: u8 = 11;
    /// Wire tag of `Display`.
    pub const DISPLAY: u8 = 12;
    /// Wire tag of `Prompt`.
    pub const PROMPT: u8 = 13;
    /// Wire tag of `PromptResponse`.
    pub const PROMPT_RESPONSE: u8 = 14;
    /// Wire tag of `BuildStatus`.
    pub const BUILD_STATUS: u8 = 15;
    /// Wire tag of `KeyboardInput`.
    pub const KEYBOARD_INPUT: u8 = 16;
    /// Wire tag of `CancelBuild`.
    pub const CANCEL_BUILD: u8 = 17;
    /// Wire tag of `Transfer` in the `Initiated` phase.
    pub const TRANSFER_INITIATED: u8 = 18;
    /// Wire tag of `Transfer` in the `Started` phase.
    pub const TRANSFER_STARTED: u8 = 19;
    /// Wire tag of `Transfer` in the `Progressed` phase.
    pub const TRANSFER_PROGRESSED: u8 = 20;
    /// Wire tag of `Transfer` in the `Corrupted` phase.
    pub const TRANSFER_CORRUPTED: u8 = 21;
    /// Wire tag of `Transfer` in the `Succeeded` phase.
    pub const TRANSFER_SUCCEEDED: u8 = 22;
    /// Wire tag of `Transfer` in the `Failed` phase.
    pub const TRANSFER_FAILED: u8 = 23;
    /// Wire tag of `ExecutionFailure`.
    pub const EXECUTION_FAILURE: u8 = 24;
    /// Wire tag of `PrintOut`.
    pub const PRINT_OUT: u8 = 25;
    /// Wire tag of `PrintErr`.
    pub const PRINT_ERR: u8 = 26;
    /// Wire tag of `RequestInput`.
    pub const REQUEST_INPUT: u8 = 27;
    /// Wire tag of `InputData`.
    pub const INPUT_DATA: u8 = 28;

    /// The 1-byte wire tag identifying this variant.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::BuildRequest { .. } => Self::BUILD_REQUEST,
            Self::BuildStarted { .. } => Self::BUILD_STARTED,
            Self::BuildFinished { .. } => Self::BUILD_FINISHED,
            Self::ProjectStarted { .. } => Self::PROJECT_STARTED,
            Self::ProjectStopped { .. } => Self::PROJECT_STOPPED,
            Self::MojoStarted(_) => Self::MOJO_STARTED,
            Self::ProjectLogMessage { .. } => Self::PROJECT_LOG_MESSAGE,
            Self::BuildLogMessage { .. } => Self::BUILD_LOG_MESSAGE,
            Self::BuildException { .. } => Self::BUILD_EXCEPTION,
            Self::KeepAlive => Self::KEEP_ALIVE,
            Self::Stop => Self::STOP,
            Self::Display { .. } => Self::DISPLAY,
            Self::Prompt { .. } => Self::PROMPT,
            Self::PromptResponse { .. } => Self::PROMPT_RESPONSE,
            Self::BuildStatus { .. } => Self::BUILD_STATUS,
            Self::KeyboardInput { .. } => Self::KEYBOARD_INPUT,
            Self::CancelBuild => Self::CANCEL_BUILD,
            Self::Transfer { phase, .. } => match phase {
                TransferPhase::Initiated => Self::TRANSFER_INITIATED,
                TransferPhase::Started => Self::TRANSFER_STARTED,
                TransferPhase::Progressed => Self::TRANSFER_PROGRESSED,
                TransferPhase::Corrupted => Self::TRANSFER_CORRUPTED,
                TransferPhase::Succeeded => Self::TRANSFER_SUCCEEDED,
                TransferPhase::Failed => Self::TRANSFER_FAILED,
            },
            Self::ExecutionFailure { .. } => Self::EXECUTION_FAILURE,
            Self::PrintOut { .. } => Self::PRINT_OUT,
            Self::PrintErr { .. } => Self::PRINT_ERR,
            Self::RequestInput { .. } => Self::REQUEST_INPUT,
            Self::InputData { .. } => Self::INPUT_DATA,
        }
    }

    /// Transfer phase for a transfer tag, `None` for any other tag.
    pub(crate) fn transfer_phase(tag: u8) -> Option<TransferPhase> {
        TransferPhase::from_tag(tag)
    }

    /// A build-global log line.
    pub fn log(message: impl Into<String>) -> Self {
        Self::BuildLogMessage { message: message.into() }
    }

    /// A log line attributed to `project_id`.
    pub fn project_log(project_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProjectLogMessage { project_id: project_id.into(), message: message.into() }
    }

    /// An immediate display line for `project_id`.
    pub fn display(project_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Display { project_id: project_id.into(), message: message.into() }
    }

    /// A `ProjectStarted` event.
    pub fn project_started(project_id: impl Into<String>) -> Self {
        Self::ProjectStarted { project_id: project_id.into() }
    }

    /// A `ProjectStopped` event.
    pub fn project_stopped(project_id: impl Into<String>) -> Self {
        Self::ProjectStopped { project_id: project_id.into() }
    }

    /// A status-line replacement.
    pub fn build_status(message: impl Into<String>) -> Self {
        Self::BuildStatus { message: message.into() }
    }

    /// Program output destined for stdout.
    pub fn out(message: impl Into<String>) -> Self {
        Self::PrintOut { message: message.into() }
    }

    /// Program output destined for stderr.
    pub fn err(message: impl Into<String>) -> Self {
        Self::PrintErr { message: message.into() }
    }

    /// A single keystroke wrapped for the render loop.
    pub fn keyboard_input(key: char) -> Self {
        Self::KeyboardInput { key }
    }

    /// A project failure event.
    pub fn execution_failure(
        project_id: impl Into<String>,
        halted: bool,
        exception: Option<String>,
    ) -> Self {
        Self::ExecutionFailure { project_id: project_id.into(), halted, exception }
    }

    /// A request for up to `bytes_to_read` bytes of keyboard input.
    pub fn request_input(project_id: impl Into<String>, bytes_to_read: i32) -> Self {
        Self::RequestInput { project_id: project_id.into(), bytes_to_read }
    }

    /// A chunk of keyboard input.
    pub fn input_data(data: impl Into<String>) -> Self {
        Self::InputData { data: Some(data.into()) }
    }

    /// The end-of-input marker.
    pub fn input_eof() -> Self {
        Self::InputData { data: None }
    }

    /// The reply to a prompt.
    pub fn prompt_response(
        project_id: impl Into<String>,
        uid: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PromptResponse {
            project_id: project_id.into(),
            uid: uid.into(),
            message: message.into(),
        }
    }

    /// A transfer lifecycle event.
    ///
    /// Debug builds assert the progress invariant: when both sizes are
    /// known, `transferred_bytes` never exceeds `content_length`.
    pub fn transfer(phase: TransferPhase, event: TransferEvent) -> Self {
        debug_assert!(
            event.content_length < 0
                || event.transferred_bytes < 0
                || event.transferred_bytes <= event.content_length,
            "transferred {} bytes of {}",
            event.transferred_bytes,
            event.content_length,
        );
        Self::Transfer { phase, event }
    }
}
