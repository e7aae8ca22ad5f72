//! Inventory and scaling decisions for one pool
//!
//! Everything here is computed before any mutation so the orphan guard can
//! abort a run cleanly.

use std::collections::HashMap;
use std::sync::Arc;

use crate::machine::{sort_oldest_first, Machine, NodeMachine};
use crate::names::in_pool;
use crate::platform::NodeInfo;

/// Machines and nodes of one pool, paired
#[derive(Debug, Default)]
pub struct Inventory {
    /// Joined members: paired machines and null machines
    pub members: Vec<NodeMachine>,
    /// Machines that never joined
    pub orphans: Vec<NodeMachine>,
}

impl Inventory {
    /// Pair `machines` with `nodes`, keeping only names that belong to `prefix`
    pub async fn collect(
        prefix: &str,
        mut machines: HashMap<String, Arc<dyn Machine>>,
        nodes: &[NodeInfo],
    ) -> Self {
        machines.retain(|name, _| in_pool(prefix, name));

        let mut inventory = Inventory::default();
        for node in nodes.iter().filter(|n| in_pool(prefix, &n.name)) {
            let machine = machines.remove(&node.name);
            inventory
                .members
                .push(NodeMachine::new(Some(node.clone()), machine).await);
        }

        let mut leftover: Vec<_> = machines.into_values().collect();
        leftover.sort_by_key(|m| m.name());
        for machine in leftover {
            inventory.orphans.push(NodeMachine::new(None, Some(machine)).await);
        }
        inventory
    }

    /// Members counted toward the desired size
    pub fn current(&self) -> usize {
        self.members.len()
    }
}

/// What a pool needs
#[derive(Debug)]
pub enum Action {
    /// Already at size
    Steady,
    /// Launch this many machines
    ScaleUp(usize),
    /// Terminate these members, oldest first
    ScaleDown(Vec<NodeMachine>),
}

/// Decide the action that brings `members` to `desired`
pub fn plan(desired: usize, mut members: Vec<NodeMachine>) -> Action {
    let current = members.len();
    if current < desired {
        return Action::ScaleUp(desired - current);
    }
    if current == desired {
        return Action::Steady;
    }

    sort_oldest_first(&mut members);
    members.truncate(current - desired);
    Action::ScaleDown(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::StubMachine;

    fn node(name: &str) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            ready: true,
            ..Default::default()
        }
    }

    fn machines(entries: &[(&str, i64)]) -> HashMap<String, Arc<dyn Machine>> {
        entries
            .iter()
            .map(|(name, secs)| {
                let m: Arc<dyn Machine> = StubMachine::created_at_secs(name, *secs);
                (name.to_string(), m)
            })
            .collect()
    }

    #[tokio::test]
    async fn inventory_separates_orphans_and_other_pools() {
        let machines = machines(&[
            ("prod-w-aaaaa", 1),
            ("prod-w-bbbbb", 2),
            ("prod-w-big-ccccc", 3),
        ]);
        let nodes = vec![node("prod-w-aaaaa"), node("prod-w-zzzzz"), node("prod-master-xxxxx")];

        let inv = Inventory::collect("prod-w-", machines, &nodes).await;

        let members: Vec<_> = inv.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(members, vec!["prod-w-aaaaa", "prod-w-zzzzz"]);
        assert!(inv.members[1].is_null_machine());
        let orphans: Vec<_> = inv.orphans.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(orphans, vec!["prod-w-bbbbb"]);
        assert_eq!(inv.current(), 2);
    }

    /// Story: five workers created at t=1..5, pool shrinks to three. The two
    /// oldest go, regardless of the order the provider listed them in.
    #[tokio::test]
    async fn scale_down_picks_oldest() {
        let entries = [
            ("prod-w-ccccc", 3),
            ("prod-w-aaaaa", 1),
            ("prod-w-eeeee", 5),
            ("prod-w-bbbbb", 2),
            ("prod-w-ddddd", 4),
        ];
        let nodes: Vec<_> = entries.iter().map(|(n, _)| node(n)).collect();
        let inv = Inventory::collect("prod-w-", machines(&entries), &nodes).await;

        let Action::ScaleDown(victims) = plan(3, inv.members) else {
            panic!("expected scale down");
        };
        let mut ages: Vec<_> = victims
            .iter()
            .map(|m| m.created.unwrap().timestamp())
            .collect();
        ages.sort();
        assert_eq!(ages, vec![1, 2]);
    }

    #[tokio::test]
    async fn scale_up_and_steady() {
        let nodes = vec![node("prod-w-aaaaa")];
        let inv = Inventory::collect("prod-w-", machines(&[("prod-w-aaaaa", 1)]), &nodes).await;
        assert!(matches!(plan(3, inv.members), Action::ScaleUp(2)));

        let inv = Inventory::collect("prod-w-", machines(&[("prod-w-aaaaa", 1)]), &nodes).await;
        assert!(matches!(plan(1, inv.members), Action::Steady));
    }
}
