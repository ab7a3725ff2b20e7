//! Target node selection for change rows.

use crate::model::ChangeRecord;

/// Decides which nodes a change row is sent to.
pub trait DataRouter: Send + Sync {
    /// Subset of `nodes` that should receive `record`. An empty result sends
    /// the row to the unrouted batch.
    fn route_to_nodes(&self, record: &ChangeRecord, nodes: &[String]) -> Vec<String>;
}

/// Routes every row to every target except the node it came from and this node.
#[derive(Debug, Clone)]
pub struct DefaultDataRouter {
    local_node_id: String,
}

impl DefaultDataRouter {
    /// Router running on `local_node_id`.
    pub fn new(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
        }
    }
}

impl DataRouter for DefaultDataRouter {
    fn route_to_nodes(&self, record: &ChangeRecord, nodes: &[String]) -> Vec<String> {
        nodes
            .iter()
            .filter(|node| **node != self.local_node_id)
            .filter(|node| record.source_node_id.as_deref() != Some(node.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;

    fn nodes() -> Vec<String> {
        vec!["000".into(), "001".into(), "002".into()]
    }

    #[test]
    fn test_routes_to_all_other_nodes() {
        let router = DefaultDataRouter::new("000");
        let record = ChangeRecord::new(1, "t", EventType::Insert, "default");
        assert_eq!(router.route_to_nodes(&record, &nodes()), vec!["001", "002"]);
    }

    #[test]
    fn test_no_ping_back() {
        let router = DefaultDataRouter::new("000");
        let record = ChangeRecord::new(1, "t", EventType::Insert, "default").with_source_node("002");
        assert_eq!(router.route_to_nodes(&record, &nodes()), vec!["001"]);
    }

    #[test]
    fn test_no_targets() {
        let router = DefaultDataRouter::new("000");
        let record = ChangeRecord::new(1, "t", EventType::Insert, "default");
        assert!(router.route_to_nodes(&record, &["000".to_string()]).is_empty());
    }
}
