//! Task Router (§4.4): tier- and capability-sensitive node placement, with
//! overflow spill. Pure with respect to a given Registry snapshot, so it is
//! deterministic and easy to test.
use crate::{
    model::{Node, TaskClass},
    registry::Registry,
    util::error::OrchestratorError,
};

#[derive(Debug, Clone)]
pub struct Router {
    registry: Registry,
    overflow_queue_threshold: i64,
}

impl Router {
    #[must_use]
    pub fn new(registry: Registry, overflow_queue_threshold: i64) -> Self {
        Self {
            registry,
            overflow_queue_threshold,
        }
    }

    /// Returns an ordered list of candidate nodes for the given task, or
    /// `NoCapableNode` when none is both healthy and capable.
    pub async fn route(
        &self,
        task_class: &TaskClass,
        capability: &str,
        preferred_node_id: Option<&str>,
    ) -> Result<Vec<Node>, OrchestratorError> {
        let mut candidates = self.registry.capable(capability).await;
        candidates.retain(|n| n.runtime.healthy);

        if candidates.is_empty() {
            return Err(OrchestratorError::NoCapableNode);
        }

        sort_candidates(&mut candidates, task_class);
        promote_preferred(&mut candidates, preferred_node_id);
        apply_overflow_spill(&mut candidates, self.overflow_queue_threshold, preferred_node_id);

        Ok(candidates)
    }
}

fn sort_candidates(candidates: &mut [Node], task_class: &TaskClass) {
    let quality_class = task_class.is_quality_class();
    candidates.sort_by(|a, b| {
        let tier_cmp = if quality_class {
            b.tier.rank().cmp(&a.tier.rank()) // higher tier first
        } else {
            a.tier.rank().cmp(&b.tier.rank()) // lower tier first
        };
        tier_cmp
            .then(a.runtime.queue_depth.cmp(&b.runtime.queue_depth))
            .then(a.id.cmp(&b.id)) // deterministic tie break
    });
}

/// If a preferred node is present among healthy, capable candidates, it is
/// placed first regardless of the tier/queue-depth sort.
fn promote_preferred(candidates: &mut Vec<Node>, preferred_node_id: Option<&str>) {
    let Some(preferred) = preferred_node_id else {
        return;
    };
    if let Some(pos) = candidates.iter().position(|n| n.id == preferred) {
        let node = candidates.remove(pos);
        candidates.insert(0, node);
    }
}

/// If the head candidate's queue depth exceeds the threshold, promote the
/// first candidate below the threshold to the head. Does not disturb an
/// explicit preferred-node promotion.
fn apply_overflow_spill(candidates: &mut Vec<Node>, threshold: i64, preferred_node_id: Option<&str>) {
    if preferred_node_id.is_some() {
        return;
    }
    let Some(head) = candidates.first() else {
        return;
    };
    if head.runtime.queue_depth <= threshold {
        return;
    }
    if let Some(pos) = candidates.iter().position(|n| n.runtime.queue_depth <= threshold) {
        if pos != 0 {
            let node = candidates.remove(pos);
            candidates.insert(0, node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeDecl, NodeInventoryFile};
    use crate::model::Tier;
    use std::collections::BTreeSet;

    fn decl(id: &str, tier: Tier, _queue_depth: i64, caps: &[&str]) -> NodeDecl {
        NodeDecl {
            id: id.into(),
            display_name: id.into(),
            tier,
            vram_gb: 24,
            host: "127.0.0.1".into(),
            port: 8188,
            capabilities: caps.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            max_resolution: 1024,
            max_batch: 8,
            max_concurrent_jobs: 4,
        }
    }

    async fn registry_with(nodes: Vec<(NodeDecl, i64, bool)>) -> Registry {
        let registry = Registry::new();
        let decls: Vec<NodeDecl> = nodes.iter().map(|(d, _, _)| d.clone()).collect();
        registry.load(NodeInventoryFile { nodes: decls }).await.unwrap();
        for (decl, queue_depth, healthy) in nodes {
            registry.update_health(&decl.id, healthy, Some(5)).await;
            if queue_depth != 0 {
                registry.bump_queue(&decl.id, queue_depth).await;
            }
        }
        registry
    }

    #[tokio::test]
    async fn quality_task_prefers_higher_tier_then_lower_queue() {
        let registry = registry_with(vec![
            (decl("n1", Tier::Standard, 0, &["sdxl"]), 0, true),
            (decl("n2", Tier::Premium, 0, &["sdxl"]), 2, true),
            (decl("n3", Tier::Premium, 0, &["sdxl"]), 0, true),
        ])
        .await;
        let router = Router::new(registry, 3);
        let candidates = router.route(&TaskClass::Quality, "sdxl", None).await.unwrap();
        assert_eq!(candidates[0].id, "n3"); // premium, queue 0
        assert_eq!(candidates[1].id, "n2"); // premium, queue 2
        assert_eq!(candidates[2].id, "n1"); // standard
    }

    #[tokio::test]
    async fn non_quality_task_prefers_lower_tier() {
        let registry = registry_with(vec![
            (decl("n1", Tier::Premium, 0, &["sd15"]), 0, true),
            (decl("n2", Tier::Draft, 0, &["sd15"]), 0, true),
        ])
        .await;
        let router = Router::new(registry, 3);
        let candidates = router.route(&TaskClass::Draft, "sd15", None).await.unwrap();
        assert_eq!(candidates[0].id, "n2");
    }

    #[tokio::test]
    async fn preferred_node_is_placed_first() {
        let registry = registry_with(vec![
            (decl("n1", Tier::Draft, 0, &["sd15"]), 0, true),
            (decl("n2", Tier::Premium, 0, &["sd15"]), 0, true),
        ])
        .await;
        let router = Router::new(registry, 3);
        let candidates = router
            .route(&TaskClass::Draft, "sd15", Some("n2"))
            .await
            .unwrap();
        assert_eq!(candidates[0].id, "n2");
    }

    #[tokio::test]
    async fn overflow_spill_promotes_first_node_below_threshold() {
        let registry = registry_with(vec![
            (decl("n1", Tier::Quality, 0, &["sdxl"]), 5, true),
            (decl("n2", Tier::Quality, 0, &["sdxl"]), 0, true),
            (decl("n3", Tier::Quality, 0, &["sdxl"]), 0, true),
        ])
        .await;
        let router = Router::new(registry, 3);
        let candidates = router.route(&TaskClass::Quality, "sdxl", None).await.unwrap();
        assert_eq!(candidates[0].id, "n2");
    }

    #[tokio::test]
    async fn no_capable_node_when_none_healthy() {
        let registry = registry_with(vec![(decl("n1", Tier::Draft, 0, &["sd15"]), 0, false)]).await;
        let router = Router::new(registry, 3);
        let error = router.route(&TaskClass::Draft, "sd15", None).await.unwrap_err();
        assert!(matches!(error, OrchestratorError::NoCapableNode));
    }

    #[tokio::test]
    async fn ties_broken_by_node_id() {
        let registry = registry_with(vec![
            (decl("b", Tier::Draft, 0, &["sd15"]), 0, true),
            (decl("a", Tier::Draft, 0, &["sd15"]), 0, true),
        ])
        .await;
        let router = Router::new(registry, 3);
        let candidates = router.route(&TaskClass::Draft, "sd15", None).await.unwrap();
        assert_eq!(candidates[0].id, "a");
    }
}
