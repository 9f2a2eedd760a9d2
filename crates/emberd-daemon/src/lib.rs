//! Session host for the resident emberd build engine.
//!
//! The daemon keeps a build engine warm across invocations. Each client
//! connection becomes one [`session`](session::session): the leading
//! `BuildRequest` is handed to the engine, the engine's event stream is
//! forwarded back in canonical replay order, and cancel/prompt/input
//! traffic is routed to the engine while the build runs.
//!
//! The engine itself is external; [`engine::BuildEngine`] is the seam.
//! [`resume`] persists which projects remain after a failed build so the
//! next invocation can pick up where the last one stopped.

pub mod engine;
pub mod error;
pub mod resume;
pub mod session;

pub use engine::{BuildEngine, BuildOutcome, EngineFailure, EngineRequest, SimulatedEngine};
pub use error::DaemonError;
