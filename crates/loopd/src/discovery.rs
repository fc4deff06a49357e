//! Unit discovery: walks a run's specs directory, parses unit and task spec
//! headers, and builds the records the scheduler persists at run start.
//!
//! A unit spec file is any markdown file under the specs directory whose
//! frontmatter header carries a `unit` key; non-unit files are ignored (a
//! unit's task files are reached only through its own `tasks` list, never by
//! an independent directory walk, so fixtures can freely mix task bodies
//! alongside other markdown in the tree).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use loop_core::{
    spec_header::{self, SpecHeaderError},
    types::{GraphSnapshot, Id, Task, TaskStatus, Unit, UnitStatus},
    dag::{self, DagError},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to walk specs directory {0}: {1}")]
    Walk(String, std::io::Error),
    #[error("spec header error in {0}: {1}")]
    Header(String, SpecHeaderError),
    #[error("duplicate unit id '{0}' declared in {1} and {2}")]
    DuplicateUnit(String, String, String),
    #[error("unit '{0}' references missing task file {1}")]
    MissingTaskFile(String, String),
    #[error("{0}")]
    Dag(#[from] DagError),
    #[error("no unit spec files found under {0}")]
    NoUnits(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Discovered units and their tasks, plus the persisted dependency graph.
pub struct Discovery {
    pub units: Vec<Unit>,
    pub tasks: Vec<Task>,
    pub graph: GraphSnapshot,
}

/// Recursively collect candidate markdown spec files under `dir`.
fn walk_markdown(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| DiscoveryError::Walk(dir.display().to_string(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DiscoveryError::Walk(dir.display().to_string(), e))?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_markdown(&path)?);
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            out.push(path);
        }
    }
    Ok(out)
}

/// Does this spec file's frontmatter declare a `unit` key?
fn is_unit_spec(path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DiscoveryError::Walk(path.display().to_string(), e))?;
    let label = path.display().to_string();
    let value = match spec_header::peek_header(&content, &label) {
        Ok(v) => v,
        Err(_) => return Ok(false),
    };
    Ok(value.get("unit").is_some())
}

/// Discover every unit under `specs_dir`, parse its tasks, and build the
/// validated dependency graph. Discovery failures are fatal to the run.
pub fn discover(run_id: &Id, specs_dir: &Path, now: chrono::DateTime<Utc>) -> Result<Discovery> {
    let candidates = walk_markdown(specs_dir)?;

    let mut unit_files: Vec<PathBuf> = Vec::new();
    for path in candidates {
        if is_unit_spec(&path)? {
            unit_files.push(path);
        }
    }
    unit_files.sort();

    if unit_files.is_empty() {
        return Err(DiscoveryError::NoUnits(specs_dir.display().to_string()));
    }

    let mut units = Vec::new();
    let mut tasks = Vec::new();
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut dep_graph: HashMap<String, Vec<String>> = HashMap::new();

    for unit_path in &unit_files {
        let label = unit_path.display().to_string();
        let spec = spec_header::load_unit(unit_path)
            .map_err(|e| DiscoveryError::Header(label.clone(), e))?;
        let header = spec.header;

        if let Some(prior) = seen.insert(header.unit.clone(), label.clone()) {
            return Err(DiscoveryError::DuplicateUnit(header.unit, prior, label));
        }
        dep_graph.insert(header.unit.clone(), header.depends_on.clone());

        let unit_id = Id::new();
        let unit_dir = unit_path.parent().unwrap_or_else(|| Path::new("."));

        for task_rel in &header.tasks {
            let task_path = unit_dir.join(task_rel);
            if !task_path.exists() {
                return Err(DiscoveryError::MissingTaskFile(
                    header.unit.clone(),
                    task_path.display().to_string(),
                ));
            }
            let task_spec = spec_header::load_task(&task_path)
                .map_err(|e| DiscoveryError::Header(task_path.display().to_string(), e))?;
            let task_header = task_spec.header;

            tasks.push(Task {
                id: Id::new(),
                unit_id: unit_id.clone(),
                task_number: task_header.task,
                title: task_header.title,
                spec_path: task_path.display().to_string(),
                depends_on: task_header.depends_on,
                validation: task_header.validation,
                status: task_header.status,
                agent_retries: 0,
                error: task_header.error,
                created_at: now,
                updated_at: now,
            });
        }

        units.push(Unit {
            id: unit_id,
            run_id: run_id.clone(),
            unit_key: header.unit,
            title: header.title,
            status: UnitStatus::Pending,
            level: 0,
            depends_on: header.depends_on,
            spec_path: label,
            worktree_path: None,
            branch: None,
            agent_retries: 0,
            baseline_retries: 0,
            error: None,
            created_at: now,
            updated_at: now,
        });
    }

    dag::validate(&dep_graph)?;
    let levels = dag::compute_levels(&dep_graph);
    for unit in &mut units {
        unit.level = *levels.get(&unit.unit_key).unwrap_or(&0);
    }

    let graph = dag::build_snapshot(run_id, &dep_graph, now);

    Ok(Discovery { units, tasks, graph })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn discovers_single_unit_with_tasks() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "add-auth/unit.md",
            "---\nunit: add-auth\ntitle: Add authentication\ntasks:\n  - 01-login.md\n---\nBody\n",
        );
        write(
            dir.path(),
            "add-auth/01-login.md",
            "---\ntask: 1\ntitle: Write login handler\nvalidation: \"true\"\nstatus: pending\n---\nBody\n",
        );

        let discovery = discover(&Id::from_string("run-1"), dir.path(), Utc::now()).unwrap();
        assert_eq!(discovery.units.len(), 1);
        assert_eq!(discovery.tasks.len(), 1);
        assert_eq!(discovery.units[0].unit_key, "add-auth");
        assert_eq!(discovery.tasks[0].validation, "true");
    }

    #[test]
    fn rejects_unknown_dependency() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "unit-a.md",
            "---\nunit: a\ntitle: A\ndepends_on:\n  - missing\ntasks: []\n---\nBody\n",
        );

        let err = discover(&Id::from_string("run-1"), dir.path(), Utc::now()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Dag(DagError::UnknownDependency(_, _))));
    }

    #[test]
    fn rejects_missing_task_file() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "unit-a.md",
            "---\nunit: a\ntitle: A\ntasks:\n  - nope.md\n---\nBody\n",
        );

        let err = discover(&Id::from_string("run-1"), dir.path(), Utc::now()).unwrap_err();
        assert!(matches!(err, DiscoveryError::MissingTaskFile(_, _)));
    }

    #[test]
    fn computes_levels_across_units() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.md", "---\nunit: a\ntitle: A\ntasks: []\n---\n");
        write(
            dir.path(),
            "b.md",
            "---\nunit: b\ntitle: B\ndepends_on:\n  - a\ntasks: []\n---\n",
        );

        let discovery = discover(&Id::from_string("run-1"), dir.path(), Utc::now()).unwrap();
        let by_key: HashMap<_, _> = discovery
            .units
            .iter()
            .map(|u| (u.unit_key.clone(), u.level))
            .collect();
        assert_eq!(by_key["a"], 0);
        assert_eq!(by_key["b"], 1);
    }
}
