//! Structured frontmatter headers for unit and task spec files.
//!
//! Each spec file begins with a `---`-delimited YAML header followed by a
//! markdown body. The header is the source of truth for scheduling and
//! worker state; it is re-read after every coding-agent invocation rather
//! than trusted from memory, and the body is preserved byte-for-byte across
//! rewrites. A malformed header is a load error, never a silent default.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TaskStatus;

#[derive(Debug, Error)]
pub enum SpecHeaderError {
    #[error("spec file is missing a frontmatter header: {0}")]
    MissingHeader(String),
    #[error("frontmatter header is not closed with a second '---': {0}")]
    UnterminatedHeader(String),
    #[error("failed to parse frontmatter header: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Header carried by a unit spec file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitHeader {
    /// Stable identifier referenced by other units' `depends_on`.
    pub unit: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Task spec file paths, relative to the unit spec file's directory,
    /// in declaration order.
    pub tasks: Vec<String>,
}

/// Header carried by a task spec file (one per task within a unit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeader {
    pub task: u32,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    /// The backpressure command that must exit zero for this task to count
    /// as done.
    pub validation: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A parsed spec file: its header and the untouched markdown body that
/// followed the closing `---`.
#[derive(Debug, Clone)]
pub struct SpecFile<H> {
    pub header: H,
    pub body: String,
}

fn split_header(content: &str, path_label: &str) -> Result<(&str, &str), SpecHeaderError> {
    let content = content.strip_prefix('\n').unwrap_or(content);
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
        .ok_or_else(|| SpecHeaderError::MissingHeader(path_label.to_string()))?;

    let end = rest
        .find("\n---\n")
        .or_else(|| rest.find("\n---\r\n"))
        .ok_or_else(|| SpecHeaderError::UnterminatedHeader(path_label.to_string()))?;

    let header_str = &rest[..end];
    let after_marker = &rest[end + 1..];
    let body_start = after_marker
        .find('\n')
        .map_or(after_marker.len(), |n| n + 1);
    let body = &after_marker[body_start..];
    Ok((header_str, body))
}

fn parse_spec_file<H>(content: &str, path_label: &str) -> Result<SpecFile<H>, SpecHeaderError>
where
    H: for<'de> Deserialize<'de>,
{
    let (header_str, body) = split_header(content, path_label)?;
    let header: H = serde_yaml::from_str(header_str)?;
    Ok(SpecFile {
        header,
        body: body.to_string(),
    })
}

fn render_spec_file<H>(spec: &SpecFile<H>) -> Result<String, SpecHeaderError>
where
    H: Serialize,
{
    let header_yaml = serde_yaml::to_string(&spec.header)?;
    Ok(format!("---\n{header_yaml}---\n{}", spec.body))
}

/// Parse a unit spec file from its full file content.
pub fn parse_unit(content: &str, path_label: &str) -> Result<SpecFile<UnitHeader>, SpecHeaderError> {
    parse_spec_file(content, path_label)
}

/// Parse a task spec file from its full file content.
pub fn parse_task(content: &str, path_label: &str) -> Result<SpecFile<TaskHeader>, SpecHeaderError> {
    parse_spec_file(content, path_label)
}

/// Parse a spec file's frontmatter header as a raw YAML value, without
/// committing to `UnitHeader` or `TaskHeader` shape. Used by discovery to
/// tell unit spec files apart from task spec files before knowing which is
/// which.
pub fn peek_header(content: &str, path_label: &str) -> Result<serde_yaml::Value, SpecHeaderError> {
    let (header_str, _) = split_header(content, path_label)?;
    Ok(serde_yaml::from_str(header_str)?)
}

/// Read and parse a unit spec file from disk.
pub fn load_unit(path: &std::path::Path) -> Result<SpecFile<UnitHeader>, SpecHeaderError> {
    let content = std::fs::read_to_string(path)?;
    parse_unit(&content, &path.display().to_string())
}

/// Read and parse a task spec file from disk.
pub fn load_task(path: &std::path::Path) -> Result<SpecFile<TaskHeader>, SpecHeaderError> {
    let content = std::fs::read_to_string(path)?;
    parse_task(&content, &path.display().to_string())
}

/// Rewrite a task spec file in place, preserving the body byte-for-byte and
/// updating only the header.
pub fn write_task(path: &std::path::Path, spec: &SpecFile<TaskHeader>) -> Result<(), SpecHeaderError> {
    let rendered = render_spec_file(spec)?;
    std::fs::write(path, rendered)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT_SAMPLE: &str = "---\nunit: add-auth\ntitle: Add authentication\ndepends_on:\n  - scaffold-db\ntasks:\n  - 01-login.md\n---\n# Add authentication\n\nDo the thing.\n";

    const TASK_SAMPLE: &str = "---\ntask: 1\ntitle: Write login handler\nvalidation: \"cargo test login\"\nstatus: pending\n---\n# Write login handler\n\nBody text.\n";

    #[test]
    fn parses_unit_header_and_preserves_body() {
        let parsed = parse_unit(UNIT_SAMPLE, "unit.md").unwrap();
        assert_eq!(parsed.header.unit, "add-auth");
        assert_eq!(parsed.header.depends_on, vec!["scaffold-db"]);
        assert_eq!(parsed.body, "# Add authentication\n\nDo the thing.\n");
    }

    #[test]
    fn parses_task_header_default_status() {
        let parsed = parse_task(TASK_SAMPLE, "task.md").unwrap();
        assert_eq!(parsed.header.task, 1);
        assert_eq!(parsed.header.status, TaskStatus::Pending);
    }

    #[test]
    fn missing_header_is_an_error() {
        let err = parse_unit("# just a heading\n", "bad.md").unwrap_err();
        assert!(matches!(err, SpecHeaderError::MissingHeader(_)));
    }

    #[test]
    fn unterminated_header_is_an_error() {
        let err = parse_unit("---\nunit: x\ntitle: y\n", "bad.md").unwrap_err();
        assert!(matches!(err, SpecHeaderError::UnterminatedHeader(_)));
    }

    #[test]
    fn round_trip_preserves_body_exactly() {
        let parsed = parse_task(TASK_SAMPLE, "task.md").unwrap();
        let mut updated = parsed.clone();
        updated.header.status = TaskStatus::Complete;
        let rendered = render_spec_file(&updated).unwrap();
        let reparsed = parse_task(&rendered, "task.md").unwrap();
        assert_eq!(reparsed.header.status, TaskStatus::Complete);
        assert_eq!(reparsed.body, parsed.body);
    }
}
