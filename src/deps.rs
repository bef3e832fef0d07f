//! Dependency resolution for startup ordering.
//!
//! Tools are grouped into levels: a tool at level `k` only depends on tools
//! at levels `< k`, so level 0 starts immediately and each later level waits
//! for the previous one to become ready.

use std::collections::{HashMap, HashSet};

use crate::config::ToolConfig;
use crate::errors::{Result, SupervisorError};

/// Result of dependency resolution.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Disjoint groups of tool names; every dependency of a tool in
    /// `levels[k]` lives in some `levels[j]` with `j < k`. Order within a
    /// level is the declaration order of the input.
    pub levels: Vec<Vec<String>>,
    /// Tool name to level index.
    pub level_map: HashMap<String, usize>,
}

/// Computes startup levels for the given tools.
///
/// Dependency references to unknown tools and self-references are ignored
/// here (config validation already warned about them); a genuine cycle is
/// fatal and reported as the ordered cycle path.
pub fn resolve(tools: &[ToolConfig]) -> Result<DependencyGraph> {
    let names: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();

    let edges: HashMap<&str, Vec<&str>> = tools
        .iter()
        .map(|t| {
            let deps: Vec<&str> = t
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| *d != t.name && names.contains(d))
                .collect();
            (t.name.as_str(), deps)
        })
        .collect();

    if let Some(path) = find_cycle(tools.iter().map(|t| t.name.as_str()), &edges) {
        return Err(SupervisorError::DependencyCycle { path });
    }

    let mut level_map: HashMap<String, usize> = HashMap::new();
    for tool in tools {
        compute_level(&tool.name, &edges, &mut level_map);
    }

    let depth = level_map.values().copied().max().map_or(0, |m| m + 1);
    let mut levels: Vec<Vec<String>> = vec![Vec::new(); depth];
    for tool in tools {
        levels[level_map[&tool.name]].push(tool.name.clone());
    }

    Ok(DependencyGraph { levels, level_map })
}

/// Looks for a dependency cycle in the raw, unfiltered edges.
///
/// Unlike [`resolve`], self-references are kept, so a self-referencing tool
/// is reported as a degenerate length-1 cycle. The returned path is closed:
/// `["a", "b", "a"]` renders as `a -> b -> a`.
pub fn detect_cycle(tools: &[ToolConfig]) -> Option<Vec<String>> {
    let edges: HashMap<&str, Vec<&str>> = tools
        .iter()
        .map(|t| {
            let deps: Vec<&str> = t.depends_on.iter().map(String::as_str).collect();
            (t.name.as_str(), deps)
        })
        .collect();

    find_cycle(tools.iter().map(|t| t.name.as_str()), &edges)
}

fn find_cycle<'a>(
    nodes: impl Iterator<Item = &'a str>,
    edges: &HashMap<&'a str, Vec<&'a str>>,
) -> Option<Vec<String>> {
    fn visit<'a>(
        name: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if on_stack.contains(name) {
            let start = stack.iter().position(|n| *n == name).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
            path.push(name.to_string());
            return Some(path);
        }
        if visited.contains(name) {
            return None;
        }

        stack.push(name);
        on_stack.insert(name);

        if let Some(deps) = edges.get(name) {
            for dep in deps {
                if let Some(path) = visit(dep, edges, visited, stack, on_stack) {
                    return Some(path);
                }
            }
        }

        stack.pop();
        on_stack.remove(name);
        visited.insert(name);
        None
    }

    let mut visited = HashSet::new();
    for name in nodes {
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();
        if let Some(path) = visit(name, edges, &mut visited, &mut stack, &mut on_stack) {
            return Some(path);
        }
    }
    None
}

/// Level of a tool: 0 with no dependencies, otherwise one more than the
/// deepest dependency. Only called on acyclic edges.
fn compute_level(
    name: &str,
    edges: &HashMap<&str, Vec<&str>>,
    level_map: &mut HashMap<String, usize>,
) -> usize {
    if let Some(&level) = level_map.get(name) {
        return level;
    }

    let level = edges
        .get(name)
        .into_iter()
        .flatten()
        .map(|dep| compute_level(dep, edges, level_map) + 1)
        .max()
        .unwrap_or(0);

    level_map.insert(name.to_string(), level);
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, deps: &[&str]) -> ToolConfig {
        ToolConfig {
            name: name.to_string(),
            command: "true".to_string(),
            args: Vec::new(),
            cwd: None,
            env: std::collections::HashMap::new(),
            cleanup: Vec::new(),
            description: None,
            health_check: None,
            ui: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn independent_tools_are_level_zero() {
        let graph = resolve(&[tool("a", &[]), tool("b", &[])]).unwrap();
        assert_eq!(graph.levels, vec![vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(graph.level_map["a"], 0);
        assert_eq!(graph.level_map["b"], 0);
    }

    #[test]
    fn chain_resolves_to_one_tool_per_level() {
        let graph = resolve(&[tool("a", &[]), tool("b", &["a"]), tool("c", &["b"])]).unwrap();
        assert_eq!(
            graph.levels,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string()],
            ]
        );
    }

    #[test]
    fn level_is_one_past_deepest_dependency() {
        // d depends on both a (level 0) and c (level 2) -> level 3
        let graph = resolve(&[
            tool("a", &[]),
            tool("b", &["a"]),
            tool("c", &["b"]),
            tool("d", &["a", "c"]),
        ])
        .unwrap();
        assert_eq!(graph.level_map["d"], 3);
    }

    #[test]
    fn diamond_keeps_declaration_order_within_level() {
        let graph = resolve(&[
            tool("root", &[]),
            tool("left", &["root"]),
            tool("right", &["root"]),
            tool("tip", &["left", "right"]),
        ])
        .unwrap();
        assert_eq!(
            graph.levels[1],
            vec!["left".to_string(), "right".to_string()]
        );
        assert_eq!(graph.levels[2], vec!["tip".to_string()]);
    }

    #[test]
    fn unknown_references_do_not_affect_levels() {
        let graph = resolve(&[tool("a", &["ghost"]), tool("b", &["a"])]).unwrap();
        assert_eq!(graph.level_map["a"], 0);
        assert_eq!(graph.level_map["b"], 1);
    }

    #[test]
    fn cycle_is_fatal_and_reports_ordered_path() {
        let err = resolve(&[tool("a", &["c"]), tool("b", &["a"]), tool("c", &["b"])]).unwrap_err();
        match err {
            SupervisorError::DependencyCycle { path } => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
                assert_eq!(err_path_set(&path), vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    fn err_path_set(path: &[String]) -> Vec<&str> {
        let mut names: Vec<&str> = path[..path.len() - 1].iter().map(String::as_str).collect();
        names.sort();
        names
    }

    #[test]
    fn self_reference_is_a_length_one_cycle_for_the_detector() {
        let path = detect_cycle(&[tool("a", &["a"])]).unwrap();
        assert_eq!(path, vec!["a".to_string(), "a".to_string()]);
    }

    #[test]
    fn resolve_ignores_self_reference() {
        let graph = resolve(&[tool("a", &["a"])]).unwrap();
        assert_eq!(graph.level_map["a"], 0);
    }

    #[test]
    fn detector_finds_no_cycle_in_acyclic_graph() {
        assert!(detect_cycle(&[tool("a", &[]), tool("b", &["a"])]).is_none());
    }
}
