//! Frame composition: the pure half of the renderer.
//!
//! Given the render state and a terminal size, [`compose_frame`] builds
//! the complete list of styled lines for one repaint. Nothing here
//! touches the terminal; the display driver diffs the result against the
//! previous frame.

use std::time::Duration;

use crossterm::style::Color;
use emberd_proto::{message::request_type, TransferEvent};

use crate::{
    model::{Failure, Project, RenderState},
    styled::{bold, bold_fg, fg, Line},
};

/// Exception prefix stripped from single-failure summaries.
const LIFECYCLE_PREFIX: &str = "org.apache.maven.lifecycle.LifecycleExecutionException: ";

/// Compose the full frame for one repaint.
///
/// The bottom two rows of the terminal are reserved: one for the status
/// line and one as a cursor safety margin. When active projects outnumber
/// the remaining rows, the earliest-started projects are omitted and
/// surface in the status line's `hidden` count.
#[must_use]
pub fn compose_frame(state: &RenderState, rows: u16, cols: u16, elapsed: Duration) -> Vec<Line> {
    let rows = rows as usize;
    let cols = cols as usize;
    if rows == 0 {
        return Vec::new();
    }

    let projects_count = state.projects.len();
    let disp_lines = rows.saturating_sub(2);
    let mut lines = Vec::with_capacity(rows);

    if let Some(status) = status_line(state, disp_lines, projects_count, elapsed) {
        lines.push(status);
    }
    if let Some(failure) = failure_line(&state.failures, cols) {
        lines.push(failure);
    }
    if let Some(transfer) = transfer_line(state.transfers.for_project("")) {
        lines.push(transfer);
    }

    if projects_count <= disp_lines {
        let mut rem_log = disp_lines - projects_count;
        for project in &state.projects {
            lines.push(project_line(state, project));
            let budget = rem_log.min(state.lines_per_project);
            let window = log_window(&project.log, budget, cols);
            rem_log -= window.len();
            lines.extend(window);
        }
        // keep the region from visually collapsing between repaints
        let floor = usize::try_from(state.max_threads).unwrap_or(0) + 1;
        while rem_log > 0 && lines.len() <= floor {
            lines.push(Line::new());
            rem_log -= 1;
        }
    } else {
        let mut skip = projects_count - disp_lines;
        for project in &state.projects {
            if skip == 0 {
                lines.push(project_line(state, project));
            } else {
                skip -= 1;
            }
        }
    }

    lines.truncate(rows);
    lines.iter().map(|line| line.truncate(cols)).collect()
}

/// The status line, or `None` before any build state exists.
#[must_use]
pub fn status_line(
    state: &RenderState,
    disp_lines: usize,
    projects_count: usize,
    elapsed: Duration,
) -> Option<Line> {
    if state.name.is_none() && state.build_status.is_none() {
        return None;
    }

    let mut line = Line::new();
    if let Some(name) = &state.name {
        line.push("Building ", Default::default());
        line.push(name, bold());

        line.push("  daemon: ", Default::default());
        line.push(&state.daemon_id, bold());

        let max_threads = state.max_threads.max(0);
        let hidden = projects_count.saturating_sub(disp_lines);
        let triple = format!("{projects_count}/{hidden}/{max_threads}");
        let width = digits(max_threads) * 3 + 2;
        line.push("  threads used/hidden/max: ", Default::default());
        line.push(format!("{triple:>width$}"), bold());

        let total = state.total_projects.max(1);
        let done_width = digits(total);
        let pct = state.done_projects.max(0) * 100 / total;
        line.push("  progress: ", Default::default());
        line.push(
            format!("{done:>done_width$}/{total} {pct:>3}%", done = state.done_projects),
            bold(),
        );
    } else if let Some(status) = &state.build_status {
        line.push(status, bold());
    }

    let sec = elapsed.as_secs();
    line.push("  time: ", Default::default());
    line.push(format!("{:02}:{:02}", sec / 60, sec % 60), bold());

    Some(line)
}

/// The failure summary line, or `None` without failures.
#[must_use]
pub fn failure_line(failures: &[Failure], cols: usize) -> Option<Line> {
    let first = failures.first()?;

    let mut line = Line::new();
    let heading = if failures.iter().any(|f| f.halted) { "ABORTING FAILURE: " } else { "FAILURE: " };
    line.push(heading, bold_fg(Color::Red));

    if failures.len() == 1 {
        line.push(&first.project_id, fg(Color::Red));
        if let Some(exception) = first.exception.as_deref() {
            let exception = exception.strip_prefix(LIFECYCLE_PREFIX).unwrap_or(exception);
            line.push(": ", fg(Color::Red));
            line.push(exception, fg(Color::Red));
        }
    } else {
        let ids: Vec<&str> = failures.iter().map(|f| f.project_id.as_str()).collect();
        line.push(format!("{} projects failed: ", failures.len()), fg(Color::Red));
        line.push(ids.join(", "), fg(Color::Red));
    }

    if cols > 1 && line.width() >= cols - 1 {
        let mut truncated = line.truncate(cols.saturating_sub(2));
        truncated.push("…", Default::default());
        return Some(truncated);
    }
    Some(line)
}

/// One line describing the live transfers of a group, or `None` when the
/// group is idle.
#[must_use]
pub fn transfer_line(entries: &[(String, TransferEvent)]) -> Option<Line> {
    let (_, first) = entries.first()?;
    let action = if first.request_type == request_type::PUT { "Uploading" } else { "Downloading" };

    if entries.len() > 1 {
        return Some(Line::plain(format!("{action} {} files...", entries.len())));
    }

    let direction = if first.request_type == request_type::PUT { "to" } else { "from" };
    let mut line = Line::new();
    line.push(format!("{action} "), Default::default());
    line.push(path_to_coords(&first.resource_name), bold());
    line.push(format!(" {direction} "), Default::default());
    line.push(&first.repository_id, Default::default());

    let cur = first.transferred_bytes;
    let max = first.content_length;
    if cur > 0 && cur < max {
        line.push(format!(" [{}/{}]", bytes_human(cur), bytes_human(max)), Default::default());
    }
    Some(line)
}

/// One project row: cyan id, green execution coordinates, or the
/// project's transfer description while a fetch is in flight.
#[must_use]
pub fn project_line(state: &RenderState, project: &Project) -> Line {
    let mut line = Line::new();
    line.push(":", Default::default());

    let width = state.artifact_width;
    if let Some(transfer) = transfer_line(state.transfers.for_project(&project.id)) {
        line.push(format!("{:<width$} ", project.id), fg(Color::Cyan));
        for span in transfer.spans() {
            line.push(span.text.clone(), span.style);
        }
        return line;
    }

    let Some(execution) = &project.running_execution else {
        line.push(&project.id, fg(Color::Cyan));
        return line;
    };

    line.push(format!("{:<width$} ", project.id), fg(Color::Cyan));
    let green = fg(Color::Green);
    if execution.plugin_goal_prefix.is_empty() {
        line.push(&execution.plugin_group_id, green);
        line.push(":", green);
        line.push(&execution.plugin_artifact_id, green);
    } else {
        line.push(&execution.plugin_goal_prefix, green);
    }
    line.push(":", green);
    line.push(&execution.plugin_version, green);
    line.push(":", green);
    line.push(&execution.mojo, green);
    line.push(" ", green);
    line.push("(", Default::default());
    line.push(&execution.execution_id, Default::default());
    line.push(")", Default::default());
    line
}

/// The rolling window under a project line: the last `budget` rows after
/// ANSI-aware column-splitting, each indented three spaces.
fn log_window(log: &[String], budget: usize, cols: usize) -> Vec<Line> {
    if budget == 0 {
        return Vec::new();
    }
    let start = log.len().saturating_sub(budget);
    let mut rows = Vec::new();
    for raw in &log[start..] {
        for piece in Line::from_ansi(raw).split_columns(cols.saturating_sub(3)) {
            let mut row = Line::plain("   ");
            for span in piece.spans() {
                row.push(span.text.clone(), span.style);
            }
            rows.push(row);
        }
    }
    if rows.len() > budget {
        rows.drain(..rows.len() - budget);
    }
    rows
}

/// Best-effort rewrite of a repository-relative path into artifact
/// coordinates (`group:artifact:version[:type[:classifier]]`).
///
/// Returns the path unchanged whenever its shape does not match the
/// standard repository layout; this is cosmetic rendering, never an
/// error.
#[must_use]
pub fn path_to_coords(location: &str) -> String {
    let p: Vec<&str> = location.split('/').collect();
    if p.len() < 4 {
        return location.to_string();
    }

    let artifact_id = p[p.len() - 3];
    let version = p[p.len() - 2];
    let file_name = p[p.len() - 1];
    let av_len = artifact_id.len() + 1 + version.len();
    if file_name.len() <= av_len {
        return location.to_string();
    }
    let Some(dot) = file_name.rfind('.') else {
        return location.to_string();
    };

    let classifier = if file_name.as_bytes().get(av_len) == Some(&b'-') {
        match file_name.get(av_len + 1..dot) {
            Some(c) => Some(c),
            None => return location.to_string(),
        }
    } else {
        None
    };
    let Some(kind) = file_name.get(dot + 1..) else {
        return location.to_string();
    };

    let mut out = p[..p.len() - 3].join(".");
    out.push(':');
    out.push_str(artifact_id);
    out.push(':');
    out.push_str(version);
    if kind != "jar" || classifier.is_some() {
        out.push(':');
        if kind != "jar" {
            out.push_str(kind);
        }
        if let Some(classifier) = classifier {
            out.push(':');
            out.push_str(classifier);
        }
    }
    out
}

/// Human-readable byte count with a binary ladder.
#[must_use]
pub fn bytes_human(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} {}", UNITS[0]);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn digits(n: i32) -> usize {
    n.max(1).to_string().len()
}
