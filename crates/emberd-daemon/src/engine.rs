//! The build-engine seam.
//!
//! The daemon embeds an unmodified upstream build tool; this module
//! defines the narrow interface the session host drives it through. The
//! engine emits the daemon→client message stream while it runs and
//! receives cancel/prompt/input traffic back through a command channel.
//!
//! [`SimulatedEngine`] is a scripted stand-in used by the tests and the
//! binary's local-testing mode; a production deployment supplies a real
//! engine behind the same trait.

use std::future::Future;

use emberd_proto::Message;
use tokio::sync::mpsc;

/// Parsed form of a client's `BuildRequest` as the engine consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    /// Build-tool argument vector, verbatim from the client.
    pub args: Vec<String>,
    /// Client working directory.
    pub working_dir: String,
    /// Detected project root directory.
    pub project_dir: String,
    /// Client environment, insertion-ordered.
    pub env: Vec<(String, String)>,
    /// Value of the resume-from argument, when the invocation carries
    /// one.
    pub resume_from: Option<String>,
    /// Projects selected for this run (resumption may add to these).
    pub selected_projects: Vec<String>,
}

impl EngineRequest {
    /// Build an engine request from the wire message. Returns `None` for
    /// any other variant.
    #[must_use]
    pub fn from_message(message: &Message) -> Option<Self> {
        let Message::BuildRequest { args, working_dir, project_dir, env } = message else {
            return None;
        };
        Some(Self {
            resume_from: resume_from_args(args),
            args: args.clone(),
            working_dir: working_dir.clone(),
            project_dir: project_dir.clone(),
            env: env.clone(),
            selected_projects: Vec::new(),
        })
    }
}

/// Extract the value following `-rf` / `--resume-from`, if present.
fn resume_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-rf" || arg == "--resume-from" {
            return iter.next().cloned();
        }
        if let Some(value) = arg.strip_prefix("--resume-from=") {
            return Some(value.to_string());
        }
    }
    None
}

/// Result of a completed engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Process-style exit code for the client.
    pub exit_code: i32,
    /// Projects left unbuilt after a failure, in build order.
    pub remaining_projects: Vec<String>,
}

impl BuildOutcome {
    /// A clean, fully built outcome.
    #[must_use]
    pub fn success() -> Self {
        Self { exit_code: 0, remaining_projects: Vec::new() }
    }
}

/// An engine run that died on an exception rather than completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    /// Exception message.
    pub message: String,
    /// Fully-qualified exception class name.
    pub class_name: String,
    /// Rendered stack trace.
    pub stack_trace: String,
}

impl EngineFailure {
    /// Convert into the wire terminator.
    #[must_use]
    pub fn into_message(self) -> Message {
        Message::BuildException {
            message: self.message,
            class_name: self.class_name,
            stack_trace: self.stack_trace,
        }
    }
}

/// A resident build engine.
///
/// `run` drives one build: events go out through `events` (everything
/// except the final `BuildFinished`/`BuildException`, which the session
/// derives from the return value), commands come in through `commands`
/// (`CancelBuild`, `PromptResponse`, `InputData`).
pub trait BuildEngine: Send + Sized + 'static {
    /// Run one build to completion or cancellation.
    fn run(
        self,
        request: EngineRequest,
        events: mpsc::UnboundedSender<Message>,
        commands: mpsc::UnboundedReceiver<Message>,
    ) -> impl Future<Output = Result<BuildOutcome, EngineFailure>> + Send;
}

/// Scripted engine for tests and local-testing mode.
///
/// Plays back a fixed event sequence, answering any prompt with its
/// canned reply and cutting the run short on `CancelBuild`.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngine {
    /// Events emitted in order.
    pub script: Vec<Message>,
    /// Exit code reported after the script completes.
    pub exit_code: i32,
    /// Remaining projects reported after the script completes.
    pub remaining_projects: Vec<String>,
    /// Failure reported instead of an outcome, when set.
    pub failure: Option<EngineFailure>,
}

impl SimulatedEngine {
    /// A small two-project demo build.
    #[must_use]
    pub fn demo() -> Self {
        Self {
            script: vec![
                Message::BuildStarted {
                    project_id: "demo".into(),
                    project_count: 2,
                    max_threads: 2,
                    artifact_id_display_length: 10,
                },
                Message::project_started("demo-core"),
                Message::project_started("demo-cli"),
                Message::project_log("demo-core", "compiling 14 sources"),
                Message::project_log("demo-cli", "compiling 3 sources"),
                Message::project_stopped("demo-core"),
                Message::project_stopped("demo-cli"),
                Message::log("BUILD SUCCESS"),
            ],
            exit_code: 0,
            remaining_projects: Vec::new(),
            failure: None,
        }
    }
}

impl BuildEngine for SimulatedEngine {
    async fn run(
        self,
        _request: EngineRequest,
        events: mpsc::UnboundedSender<Message>,
        mut commands: mpsc::UnboundedReceiver<Message>,
    ) -> Result<BuildOutcome, EngineFailure> {
        for message in self.script {
            // commands preempt the script between events
            while let Ok(command) = commands.try_recv() {
                if command == Message::CancelBuild {
                    return Ok(BuildOutcome {
                        exit_code: 130,
                        remaining_projects: self.remaining_projects,
                    });
                }
            }
            if events.send(message).is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }

        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(BuildOutcome {
                exit_code: self.exit_code,
                remaining_projects: self.remaining_projects,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_from_is_parsed_in_both_spellings() {
        let short = vec!["-rf".to_string(), ":core".to_string()];
        assert_eq!(resume_from_args(&short), Some(":core".into()));

        let long = vec!["--resume-from".to_string(), ":core".to_string()];
        assert_eq!(resume_from_args(&long), Some(":core".into()));

        let inline = vec!["--resume-from=:core".to_string()];
        assert_eq!(resume_from_args(&inline), Some(":core".into()));

        let absent = vec!["install".to_string()];
        assert_eq!(resume_from_args(&absent), None);
    }

    #[test]
    fn engine_request_only_accepts_build_requests() {
        let request = Message::BuildRequest {
            args: vec!["verify".into()],
            working_dir: "/w".into(),
            project_dir: "/w".into(),
            env: vec![],
        };
        let parsed = EngineRequest::from_message(&request).expect("build request");
        assert_eq!(parsed.args, vec!["verify"]);
        assert!(parsed.resume_from.is_none());

        assert!(EngineRequest::from_message(&Message::KeepAlive).is_none());
    }

    #[tokio::test]
    async fn simulated_engine_plays_its_script() {
        let engine = SimulatedEngine::demo();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();

        let request = EngineRequest {
            args: vec![],
            working_dir: String::new(),
            project_dir: String::new(),
            env: vec![],
            resume_from: None,
            selected_projects: vec![],
        };
        let outcome = engine.run(request, events_tx, commands_rx).await.expect("outcome");
        assert_eq!(outcome, BuildOutcome::success());

        let mut seen = Vec::new();
        while let Ok(message) = events_rx.try_recv() {
            seen.push(message.tag());
        }
        assert_eq!(seen.first(), Some(&Message::BUILD_STARTED));
        assert_eq!(seen.last(), Some(&Message::BUILD_LOG_MESSAGE));
    }

    #[tokio::test]
    async fn cancel_cuts_the_script_short() {
        let engine = SimulatedEngine::demo();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        commands_tx.send(Message::CancelBuild).expect("send cancel");

        let request = EngineRequest {
            args: vec![],
            working_dir: String::new(),
            project_dir: String::new(),
            env: vec![],
            resume_from: None,
            selected_projects: vec![],
        };
        let outcome = engine.run(request, events_tx, commands_rx).await.expect("outcome");
        assert_eq!(outcome.exit_code, 130);
    }
}
