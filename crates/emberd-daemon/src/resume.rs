//! Resumption store: which projects remain after a failed build.
//!
//! A failed build leaves a `resume.properties` file in the build-output
//! root with a single `remainingProjects` key. The next invocation picks
//! it up when the user did not pass an explicit resume-from argument. A
//! missing or corrupt file degrades the feature with a warning; it is
//! never an error.

use std::{fs, io, path::Path};

use crate::engine::EngineRequest;

/// File name inside the build-output root.
pub const RESUME_PROPERTIES: &str = "resume.properties";

const REMAINING_PROJECTS: &str = "remainingProjects";
const DELIMITER: &str = ", ";

/// Persist the remaining project ids under `dir`.
///
/// # Errors
///
/// Propagates I/O errors; the caller decides whether persistence failure
/// matters (the session only logs it).
pub fn persist(dir: &Path, remaining: &[String]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let value = remaining.join(DELIMITER);
    fs::write(dir.join(RESUME_PROPERTIES), format!("{REMAINING_PROJECTS} = {value}\n"))
}

/// Apply recorded resumption data to `request`.
///
/// No-op when the request already carries a resume-from argument or when
/// no usable data exists (the latter logs a warning, mirroring the
/// degrade-only policy).
pub fn apply(request: &mut EngineRequest, dir: &Path) {
    if request.resume_from.as_deref().is_some_and(|v| !v.is_empty()) {
        return;
    }

    let Some(remaining) = load(dir) else {
        return;
    };
    if remaining.is_empty() {
        return;
    }
    tracing::info!(projects = %remaining.join(", "), "resuming from previous failed build");
    request.selected_projects.extend(remaining);
}

/// Remove recorded resumption data (after a successful build).
pub fn remove(dir: &Path) {
    let path = dir.join(RESUME_PROPERTIES);
    if let Err(error) = fs::remove_file(&path) {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %error, "could not delete resumption data");
        }
    }
}

/// Load remaining project ids, or `None` with a warning when the file is
/// missing or unreadable.
fn load(dir: &Path) -> Option<Vec<String>> {
    let path = dir.join(RESUME_PROPERTIES);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                %error,
                "resumption data unavailable; the resume feature will not work"
            );
            return None;
        },
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() == REMAINING_PROJECTS {
            return Some(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
    }
    tracing::warn!(path = %path.display(), "resumption data has no {REMAINING_PROJECTS} key");
    None
}
