//! Executor over the optional error DAG.
//!
//! When analysis decomposes a composite failure, the executor picks the
//! next sub-problem whose dependencies are all solved, preferring
//! higher priority and, within a priority, lower complexity. The DAG
//! wins over the linear path whenever both are populated.

use crate::state::{DagNode, ErrorDag};

/// Select the next executable node: all dependencies solved, highest
/// priority first, lowest complexity as the tie-break.
#[must_use]
pub fn next_executable_node<'a>(dag: &'a ErrorDag, solved: &[String]) -> Option<&'a DagNode> {
    dag.nodes
        .iter()
        .filter(|node| !solved.contains(&node.id))
        .filter(|node| node.dependencies.iter().all(|dep| solved.contains(dep)))
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.complexity.cmp(&a.complexity))
        })
}

/// Fraction of nodes solved, in `0.0..=1.0`.
#[must_use]
pub fn progress(dag: &ErrorDag, solved: &[String]) -> f64 {
    if dag.nodes.is_empty() {
        return 1.0;
    }
    let solved_count = dag
        .nodes
        .iter()
        .filter(|node| solved.contains(&node.id))
        .count();
    solved_count as f64 / dag.nodes.len() as f64
}

/// True once every node is solved.
#[must_use]
pub fn is_complete(dag: &ErrorDag, solved: &[String]) -> bool {
    dag.nodes.iter().all(|node| solved.contains(&node.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, priority: i32, complexity: u8, deps: &[&str]) -> DagNode {
        DagNode {
            id: id.to_string(),
            problem: format!("fix {id}"),
            priority,
            complexity,
            dependencies: deps.iter().map(ToString::to_string).collect(),
        }
    }

    fn dag() -> ErrorDag {
        ErrorDag {
            root_problem: "build is red".to_string(),
            nodes: vec![
                node("deps", 5, 2, &[]),
                node("compile", 5, 6, &[]),
                node("tests", 3, 4, &["deps", "compile"]),
            ],
        }
    }

    #[test]
    fn test_priority_then_complexity() {
        let dag = dag();
        // Both priority-5 nodes are free; the cheaper one goes first.
        let next = next_executable_node(&dag, &[]).unwrap();
        assert_eq!(next.id, "deps");
    }

    #[test]
    fn test_dependencies_gate_selection() {
        let dag = dag();
        let solved = vec!["deps".to_string()];
        let next = next_executable_node(&dag, &solved).unwrap();
        assert_eq!(next.id, "compile");

        let solved = vec!["deps".to_string(), "compile".to_string()];
        let next = next_executable_node(&dag, &solved).unwrap();
        assert_eq!(next.id, "tests");
    }

    #[test]
    fn test_progress_and_completion() {
        let dag = dag();
        assert!(progress(&dag, &[]).abs() < f64::EPSILON);

        let solved = vec!["deps".to_string(), "compile".to_string()];
        assert!((progress(&dag, &solved) - 2.0 / 3.0).abs() < 1e-9);
        assert!(!is_complete(&dag, &solved));

        let all = vec![
            "deps".to_string(),
            "compile".to_string(),
            "tests".to_string(),
        ];
        assert!(is_complete(&dag, &all));
        assert!(next_executable_node(&dag, &all).is_none());
    }
}
