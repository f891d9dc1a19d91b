//! Stage planning for hybrid runs
//!
//! Agents are layered by their connections (Kahn's algorithm): stage 0 holds
//! agents with no incoming edge, stage N+1 those whose predecessors all sit in
//! stages 0..=N. Within a stage, declaration order is preserved.

use super::types::{AgentConnection, AgentDefinition};
use std::collections::{BTreeSet, HashMap};

/// Partition agents into stages; each stage lists indexes into `agents`
///
/// Returns every problem found: connections naming unknown agents, and the
/// agents left over when the connections form a cycle.
pub fn plan_stages(
    agents: &[AgentDefinition],
    connections: &[AgentConnection],
) -> Result<Vec<Vec<usize>>, Vec<String>> {
    let index_of: HashMap<&str, usize> = agents
        .iter()
        .enumerate()
        .map(|(i, a)| (a.id.as_str(), i))
        .collect();

    let mut violations = Vec::new();
    let mut edges = BTreeSet::new();
    for connection in connections {
        let from = index_of.get(connection.from.as_str());
        let to = index_of.get(connection.to.as_str());
        if from.is_none() {
            violations.push(format!(
                "connection references unknown agent '{}'",
                connection.from
            ));
        }
        if to.is_none() {
            violations.push(format!(
                "connection references unknown agent '{}'",
                connection.to
            ));
        }
        if let (Some(&from), Some(&to)) = (from, to) {
            edges.insert((from, to));
        }
    }
    if !violations.is_empty() {
        return Err(violations);
    }

    let mut in_degree = vec![0usize; agents.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); agents.len()];
    for &(from, to) in &edges {
        in_degree[to] += 1;
        successors[from].push(to);
    }

    let mut stages = Vec::new();
    let mut ready: Vec<usize> = (0..agents.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0;
    while !ready.is_empty() {
        let mut next = Vec::new();
        for &node in &ready {
            for &succ in &successors[node] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }
        next.sort_unstable();
        placed += ready.len();
        stages.push(std::mem::replace(&mut ready, next));
    }

    if placed < agents.len() {
        let stuck: Vec<&str> = (0..agents.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| agents[i].id.as_str())
            .collect();
        return Err(vec![format!(
            "connections form a cycle through: {}",
            stuck.join(", ")
        )]);
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs(ids: &[&str]) -> Vec<AgentDefinition> {
        ids.iter().map(|id| AgentDefinition::new(*id)).collect()
    }

    fn ids(agents: &[AgentDefinition], stages: &[Vec<usize>]) -> Vec<Vec<String>> {
        stages
            .iter()
            .map(|s| s.iter().map(|&i| agents[i].id.clone()).collect())
            .collect()
    }

    #[test]
    fn test_no_connections_is_one_stage() {
        let agents = defs(&["a", "b", "c"]);
        let stages = plan_stages(&agents, &[]).unwrap();
        assert_eq!(stages, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_diamond() {
        let agents = defs(&["fetch", "left", "right", "merge"]);
        let connections = vec![
            AgentConnection::new("fetch", "left"),
            AgentConnection::new("fetch", "right"),
            AgentConnection::new("left", "merge"),
            AgentConnection::new("right", "merge"),
        ];
        let stages = plan_stages(&agents, &connections).unwrap();
        assert_eq!(
            ids(&agents, &stages),
            vec![vec!["fetch"], vec!["left", "right"], vec!["merge"]]
        );
    }

    #[test]
    fn test_declaration_order_within_stage() {
        let agents = defs(&["z", "y", "root"]);
        let connections = vec![
            AgentConnection::new("root", "y"),
            AgentConnection::new("root", "z"),
        ];
        let stages = plan_stages(&agents, &connections).unwrap();
        assert_eq!(ids(&agents, &stages), vec![vec!["root"], vec!["z", "y"]]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let agents = defs(&["a", "b", "c"]);
        let connections = vec![
            AgentConnection::new("a", "b"),
            AgentConnection::new("b", "c"),
            AgentConnection::new("c", "b"),
        ];
        let err = plan_stages(&agents, &connections).unwrap_err();
        assert!(err[0].contains("cycle"));
        assert!(err[0].contains('b') && err[0].contains('c'));
    }

    #[test]
    fn test_unknown_endpoints_all_reported() {
        let agents = defs(&["a"]);
        let connections = vec![
            AgentConnection::new("a", "ghost"),
            AgentConnection::new("phantom", "a"),
        ];
        assert_eq!(plan_stages(&agents, &connections).unwrap_err().len(), 2);
    }
}
