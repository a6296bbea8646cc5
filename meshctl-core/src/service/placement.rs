// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Node selection for a newly-created service (§4.3): pick the least-loaded
//! node that still has capacity, rather than round-robin.

#[derive(Debug, Clone)]
pub struct NodeLoad {
    pub node_name: String,
    pub running_services: u32,
    pub max_services: u32,
}

impl NodeLoad {
    fn has_capacity(&self) -> bool {
        self.running_services < self.max_services
    }

    fn load_factor(&self) -> f64 {
        self.running_services as f64 / self.max_services.max(1) as f64
    }
}

pub trait PlacementStrategy: Send + Sync {
    /// Picks a node to host a new service, or `None` if every candidate is
    /// at capacity.
    fn select(&self, candidates: &[NodeLoad]) -> Option<String>;
}

/// Weighted-least-load placement: the node with the lowest
/// `running_services / max_services` ratio wins, ties broken by name so
/// placement is deterministic given the same input.
pub struct WeightedLoadPlacement;

impl PlacementStrategy for WeightedLoadPlacement {
    fn select(&self, candidates: &[NodeLoad]) -> Option<String> {
        candidates
            .iter()
            .filter(|c| c.has_capacity())
            .min_by(|a, b| a.load_factor().partial_cmp(&b.load_factor()).unwrap().then_with(|| a.node_name.cmp(&b.node_name)))
            .map(|c| c.node_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_least_loaded_node_wins() {
        let candidates = vec![
            NodeLoad { node_name: "a".into(), running_services: 8, max_services: 10 },
            NodeLoad { node_name: "b".into(), running_services: 2, max_services: 10 },
        ];
        assert_eq!(WeightedLoadPlacement.select(&candidates).as_deref(), Some("b"));
    }

    #[test]
    fn nodes_at_capacity_are_excluded() {
        let candidates = vec![NodeLoad { node_name: "a".into(), running_services: 10, max_services: 10 }];
        assert_eq!(WeightedLoadPlacement.select(&candidates), None);
    }

    #[test]
    fn ties_break_by_name() {
        let candidates = vec![
            NodeLoad { node_name: "z".into(), running_services: 1, max_services: 10 },
            NodeLoad { node_name: "a".into(), running_services: 1, max_services: 10 },
        ];
        assert_eq!(WeightedLoadPlacement.select(&candidates).as_deref(), Some("a"));
    }
}
