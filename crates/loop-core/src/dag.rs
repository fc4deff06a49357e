//! Unit dependency graph: cycle detection and level computation.
//!
//! No back-pointers are stored; everything here is plain adjacency-list
//! arithmetic over unit keys, computed once at discovery and persisted as a
//! `GraphSnapshot`.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{GraphSnapshot, Id};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("unit '{0}' depends on unknown unit '{1}'")]
    UnknownDependency(String, String),
    #[error("dependency cycle detected, involving unit '{0}'")]
    Cycle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validate that every `depends_on` entry refers to a known unit key and
/// that the dependency graph is acyclic.
pub fn validate(units: &HashMap<String, Vec<String>>) -> Result<(), DagError> {
    for (unit, deps) in units {
        for dep in deps {
            if !units.contains_key(dep) {
                return Err(DagError::UnknownDependency(unit.clone(), dep.clone()));
            }
        }
    }

    let mut colors: HashMap<&str, Color> = units.keys().map(|k| (k.as_str(), Color::White)).collect();

    for key in units.keys() {
        if colors[key.as_str()] == Color::White {
            visit(key, units, &mut colors)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    key: &'a str,
    units: &'a HashMap<String, Vec<String>>,
    colors: &mut HashMap<&'a str, Color>,
) -> Result<(), DagError> {
    colors.insert(key, Color::Gray);
    if let Some(deps) = units.get(key) {
        for dep in deps {
            match colors.get(dep.as_str()).copied().unwrap_or(Color::White) {
                Color::White => visit(dep, units, colors)?,
                Color::Gray => return Err(DagError::Cycle(dep.clone())),
                Color::Black => {}
            }
        }
    }
    colors.insert(key, Color::Black);
    Ok(())
}

/// Compute `level(u) = 1 + max(level(dep) for dep in deps(u))`, with roots
/// (no dependencies) at level 0. Assumes `validate` has already rejected
/// cycles and unknown dependencies.
pub fn compute_levels(units: &HashMap<String, Vec<String>>) -> HashMap<String, i64> {
    let mut levels = HashMap::with_capacity(units.len());

    fn level_of<'a>(key: &'a str, units: &'a HashMap<String, Vec<String>>, levels: &mut HashMap<String, i64>) -> i64 {
        if let Some(level) = levels.get(key) {
            return *level;
        }
        let deps = units.get(key).map(Vec::as_slice).unwrap_or(&[]);
        let level = if deps.is_empty() {
            0
        } else {
            1 + deps.iter().map(|d| level_of(d, units, levels)).max().unwrap_or(0)
        };
        levels.insert(key.to_string(), level);
        level
    }

    for key in units.keys() {
        level_of(key, units, &mut levels);
    }
    levels
}

/// Build a persisted `GraphSnapshot` from validated unit dependency data.
pub fn build_snapshot(
    run_id: &Id,
    units: &HashMap<String, Vec<String>>,
    created_at: chrono::DateTime<chrono::Utc>,
) -> GraphSnapshot {
    let levels = compute_levels(units);
    let mut nodes: Vec<String> = units.keys().cloned().collect();
    nodes.sort();

    let mut edges = Vec::new();
    for (unit, deps) in units {
        for dep in deps {
            edges.push((unit.clone(), dep.clone()));
        }
    }
    edges.sort();

    GraphSnapshot {
        run_id: run_id.clone(),
        nodes,
        edges,
        levels,
        created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, deps)| (k.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn rejects_unknown_dependency() {
        let g = graph(&[("a", &["missing"])]);
        assert_eq!(
            validate(&g).unwrap_err(),
            DagError::UnknownDependency("a".into(), "missing".into())
        );
    }

    #[test]
    fn rejects_direct_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(validate(&g), Err(DagError::Cycle(_))));
    }

    #[test]
    fn accepts_valid_dag() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(validate(&g).is_ok());
    }

    #[test]
    fn levels_follow_longest_path() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        let levels = compute_levels(&g);
        assert_eq!(levels["a"], 0);
        assert_eq!(levels["b"], 1);
        assert_eq!(levels["c"], 2);
    }

    #[test]
    fn snapshot_nodes_and_edges_are_sorted() {
        let g = graph(&[("b", &["a"]), ("a", &[])]);
        let snapshot = build_snapshot(&Id::from_string("run-1"), &g, chrono::Utc::now());
        assert_eq!(snapshot.nodes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(snapshot.edges, vec![("b".to_string(), "a".to_string())]);
    }
}
