//! In-memory render model: projects, transfers and failures.
//!
//! All of this state is owned by the render loop and mutated only through
//! `&mut self` there; nothing in this module is shared across tasks.
//! Collections that must preserve insertion order (projects, transfer
//! groups) are plain vectors; the working set is bounded by the build's
//! parallelism, so linear lookups are fine.

use emberd_proto::{Message, MojoStarted, TransferEvent, TransferPhase};

/// One active project in the build.
///
/// Created on the first `ProjectStarted`/`MojoStarted` for its id and
/// dropped on `ProjectStopped`.
#[derive(Debug)]
pub struct Project {
    /// Project id (artifact id).
    pub id: String,
    /// Goal currently executing, if any.
    pub running_execution: Option<MojoStarted>,
    /// Buffered log lines not yet flushed to the sink.
    pub log: Vec<String>,
}

impl Project {
    /// A fresh project with an empty log buffer.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), running_execution: None, log: Vec::new() }
    }
}

/// A recorded project failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Failed project id.
    pub project_id: String,
    /// Whether the failure halts the whole build.
    pub halted: bool,
    /// Failure description.
    pub exception: Option<String>,
}

/// Live transfers keyed by project, then by resource name.
///
/// The table stores only the latest event per resource, which is what
/// bounds the render model under a flood of progress events. An empty
/// project id is the bucket for resolver-global transfers.
#[derive(Debug, Default)]
pub struct TransferTable {
    groups: Vec<(String, Vec<(String, TransferEvent)>)>,
}

impl TransferTable {
    /// Apply a transfer event: non-terminal phases insert or replace the
    /// entry for the resource, terminal phases remove it.
    pub fn record(&mut self, phase: TransferPhase, event: TransferEvent) {
        let at = match self.groups.iter().position(|(id, _)| *id == event.project_id) {
            Some(at) => at,
            None => {
                self.groups.push((event.project_id.clone(), Vec::new()));
                self.groups.len() - 1
            },
        };
        let group = &mut self.groups[at].1;

        if phase.is_terminal() {
            group.retain(|(resource, _)| *resource != event.resource_name);
        } else {
            match group.iter_mut().find(|(resource, _)| *resource == event.resource_name) {
                Some((_, slot)) => *slot = event,
                None => group.push((event.resource_name.clone(), event)),
            }
        }
    }

    /// Live transfers for `project_id` (empty string for the global
    /// bucket).
    #[must_use]
    pub fn for_project(&self, project_id: &str) -> &[(String, TransferEvent)] {
        self.groups
            .iter()
            .find(|(id, _)| id == project_id)
            .map(|(_, group)| group.as_slice())
            .unwrap_or(&[])
    }
}

/// Everything the layout procedure reads.
#[derive(Debug)]
pub struct RenderState {
    /// Root project name from `BuildStarted`.
    pub name: Option<String>,
    /// Identifier of the daemon serving this invocation.
    pub daemon_id: String,
    /// Project count from `BuildStarted`.
    pub total_projects: i32,
    /// Projects finished so far.
    pub done_projects: i32,
    /// Build parallelism from `BuildStarted`.
    pub max_threads: i32,
    /// Column width for aligned project ids.
    pub artifact_width: usize,
    /// Latest `BuildStatus` text, shown when no build is active.
    pub build_status: Option<String>,
    /// Rolling window height per project.
    pub lines_per_project: usize,
    /// Flush the sink on every project completion.
    pub display_done: bool,
    /// Stream lines straight to the sink, no rolling windows.
    pub no_buffering: bool,
    /// Active projects in start order.
    pub projects: Vec<Project>,
    /// Live transfer table.
    pub transfers: TransferTable,
    /// Failures in arrival order, never pruned during a build.
    pub failures: Vec<Failure>,
}

impl RenderState {
    /// Initial state before `BuildStarted` arrives.
    pub fn new(daemon_id: impl Into<String>, lines_per_project: usize, no_buffering: bool) -> Self {
        Self {
            name: None,
            daemon_id: daemon_id.into(),
            total_projects: 0,
            done_projects: 0,
            max_threads: 0,
            artifact_width: 0,
            build_status: None,
            lines_per_project,
            display_done: false,
            no_buffering,
            projects: Vec::new(),
            transfers: TransferTable::default(),
            failures: Vec::new(),
        }
    }

    /// Look up a project by id.
    pub fn project_mut(&mut self, id: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.id == id)
    }

    /// Insert a project, replacing any stale entry with the same id.
    pub fn insert_project(&mut self, id: &str) {
        self.projects.retain(|p| p.id != id);
        self.projects.push(Project::new(id));
    }

    /// Find a project or create it in start order.
    pub fn project_or_insert(&mut self, id: &str) -> &mut Project {
        if let Some(at) = self.projects.iter().position(|p| p.id == id) {
            &mut self.projects[at]
        } else {
            self.projects.push(Project::new(id));
            // the project was just pushed
            self.projects.last_mut().unwrap_or_else(|| unreachable!())
        }
    }

    /// Remove a project, handing back its buffered log.
    pub fn remove_project(&mut self, id: &str) -> Option<Project> {
        let at = self.projects.iter().position(|p| p.id == id)?;
        Some(self.projects.remove(at))
    }

    /// Record an execution failure; arrival order is kept and never pruned.
    pub fn record_failure(&mut self, message: &Message) {
        if let Message::ExecutionFailure { project_id, halted, exception } = message {
            self.failures.push(Failure {
                project_id: project_id.clone(),
                halted: *halted,
                exception: exception.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_proto::message::request_type;

    fn event(project: &str, resource: &str, transferred: i64) -> TransferEvent {
        TransferEvent {
            project_id: project.into(),
            request_type: request_type::GET,
            repository_id: "central".into(),
            repository_url: "https://repo".into(),
            resource_name: resource.into(),
            content_length: 100,
            transferred_bytes: transferred,
            exception: None,
        }
    }

    #[test]
    fn progress_replaces_rather_than_appends() {
        let mut table = TransferTable::default();
        table.record(TransferPhase::Initiated, event("a", "r1", 0));
        table.record(TransferPhase::Progressed, event("a", "r1", 50));
        table.record(TransferPhase::Progressed, event("a", "r1", 80));

        let live = table.for_project("a");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1.transferred_bytes, 80);
    }

    #[test]
    fn terminal_phase_removes_the_entry() {
        let mut table = TransferTable::default();
        table.record(TransferPhase::Started, event("a", "r1", 0));
        table.record(TransferPhase::Succeeded, event("a", "r1", 100));
        assert!(table.for_project("a").is_empty());
    }

    #[test]
    fn empty_project_id_is_the_global_bucket() {
        let mut table = TransferTable::default();
        table.record(TransferPhase::Started, event("", "r1", 0));
        assert_eq!(table.for_project("").len(), 1);
        assert!(table.for_project("a").is_empty());
    }

    #[test]
    fn projects_keep_start_order() {
        let mut state = RenderState::new("d", 0, false);
        state.insert_project("b");
        state.insert_project("a");
        state.project_or_insert("c").running_execution = None;
        let ids: Vec<&str> = state.projects.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        state.remove_project("a");
        let ids: Vec<&str> = state.projects.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
