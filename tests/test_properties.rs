//! Property tests for the bus circuit breakers, message history, and stage
//! planning

use agent_conductor::bus::{AgentMessage, CircuitBreaker, CircuitState, MessageBus};
use agent_conductor::config::BusSection;
use agent_conductor::pipeline::{plan_stages, AgentConnection, AgentDefinition};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

proptest! {
    #[test]
    fn circuit_opens_exactly_at_third_consecutive_failure(
        outcomes in proptest::collection::vec(any::<bool>(), 0..40)
    ) {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let mut consecutive = 0u32;

        for succeeded in outcomes {
            if succeeded {
                breaker.record_success();
                consecutive = 0;
            } else {
                breaker.record_failure_at(now);
                consecutive += 1;
            }
            let open = consecutive >= 3;
            prop_assert_eq!(breaker.allow_at(now), !open);
            prop_assert_eq!(breaker.state() == CircuitState::Open, open);
        }
    }

    #[test]
    fn bus_history_is_bounded_and_keeps_newest(capacity in 1usize..16, published in 0usize..48) {
        let bus = MessageBus::new(BusSection {
            history_capacity: capacity,
            ..BusSection::default()
        });

        let ids = tokio_test::block_on(async {
            let mut ids = Vec::new();
            for n in 0..published {
                let message = AgentMessage::notification("source", json!(n));
                ids.push(message.id.clone());
                bus.publish(message).await.unwrap();
            }
            ids
        });
        let history = tokio_test::block_on(bus.history(None));

        prop_assert_eq!(history.len(), published.min(capacity));
        let kept: Vec<String> = history.into_iter().map(|m| m.id).collect();
        prop_assert_eq!(kept, ids[published - published.min(capacity)..].to_vec());
    }

    #[test]
    fn forward_edges_always_plan_in_dependency_order(
        size in 1usize..10,
        raw_edges in proptest::collection::vec((0usize..10, 0usize..10), 0..30)
    ) {
        let agents: Vec<AgentDefinition> =
            (0..size).map(|i| AgentDefinition::new(format!("agent-{i}"))).collect();
        let connections: Vec<AgentConnection> = raw_edges
            .iter()
            .map(|&(a, b)| (a % size, b % size))
            .filter(|(a, b)| a < b)
            .map(|(a, b)| AgentConnection::new(agents[a].id.clone(), agents[b].id.clone()))
            .collect();

        let stages = plan_stages(&agents, &connections).unwrap();

        let mut stage_of = HashMap::new();
        for (stage, members) in stages.iter().enumerate() {
            for &index in members {
                prop_assert!(stage_of.insert(index, stage).is_none());
            }
        }
        prop_assert_eq!(stage_of.len(), size);

        for connection in &connections {
            let from = agents.iter().position(|a| a.id == connection.from).unwrap();
            let to = agents.iter().position(|a| a.id == connection.to).unwrap();
            prop_assert!(stage_of[&from] < stage_of[&to]);
        }
    }

    #[test]
    fn back_edge_on_a_chain_is_a_cycle(size in 2usize..8) {
        let agents: Vec<AgentDefinition> =
            (0..size).map(|i| AgentDefinition::new(format!("agent-{i}"))).collect();
        let mut connections: Vec<AgentConnection> = agents
            .windows(2)
            .map(|pair| AgentConnection::new(pair[0].id.clone(), pair[1].id.clone()))
            .collect();
        connections.push(AgentConnection::new(
            agents[size - 1].id.clone(),
            agents[0].id.clone(),
        ));

        let violations = plan_stages(&agents, &connections).unwrap_err();
        prop_assert!(violations[0].contains("cycle"));
    }
}
