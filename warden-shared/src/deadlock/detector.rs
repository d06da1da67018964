use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::warn;

/// Wait-for graph edge: `waiting_transaction` is blocked on a lock `holding_transaction` holds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitForEdge {
    pub waiting_transaction: String,
    pub holding_transaction: String,
    pub resource_id: String,
}

/// Deadlock detection result
#[derive(Debug, Clone)]
pub struct DeadlockCycle {
    /// Transactions in wait order, starting with the one whose wait closed the cycle
    pub transactions: Vec<String>,
    pub resources: Vec<String>,
    pub detected_at: SystemTime,
}

impl DeadlockCycle {
    /// The transaction to abort: the one whose request closed the cycle
    pub fn select_victim(&self) -> Option<String> {
        self.transactions.first().cloned()
    }

    pub fn describe(&self) -> String {
        let mut chain = self.transactions.clone();
        if let Some(first) = self.transactions.first() {
            chain.push(first.clone());
        }
        format!(
            "wait cycle {} over resources [{}]",
            chain.join(" -> "),
            self.resources.join(", ")
        )
    }
}

/// Deadlock detector over a wait-for graph. Clones share the graph.
#[derive(Debug, Clone, Default)]
pub struct DeadlockDetector {
    edges: Arc<RwLock<HashSet<WaitForEdge>>>,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a wait-for edge
    pub fn add_wait_for(&self, waiting_tx: &str, holding_tx: &str, resource_id: &str) {
        if waiting_tx == holding_tx {
            return;
        }
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        edges.insert(WaitForEdge {
            waiting_transaction: waiting_tx.to_string(),
            holding_transaction: holding_tx.to_string(),
            resource_id: resource_id.to_string(),
        });
    }

    /// Drop the edges where `transaction_id` is the waiter; it got its lock or gave up
    pub fn remove_waits_of(&self, transaction_id: &str) {
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        edges.retain(|edge| edge.waiting_transaction != transaction_id);
    }

    /// Remove every edge touching a finished transaction
    pub fn remove_transaction(&self, transaction_id: &str) {
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        edges.retain(|edge| {
            edge.waiting_transaction != transaction_id && edge.holding_transaction != transaction_id
        });
    }

    pub fn edge_count(&self) -> usize {
        self.edges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Detect any cycle in the wait-for graph
    pub fn detect_deadlock(&self) -> Option<DeadlockCycle> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        let graph = Self::adjacency(&edges);

        let mut starts: Vec<&String> = graph.keys().collect();
        starts.sort();
        let cycle = starts
            .into_iter()
            .find_map(|start| Self::cycle_from(&graph, start))?;
        Some(Self::build_cycle(&edges, cycle))
    }

    /// Detect a cycle passing through `transaction_id`
    pub fn detect_cycle_through(&self, transaction_id: &str) -> Option<DeadlockCycle> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        let graph = Self::adjacency(&edges);
        let cycle = Self::cycle_from(&graph, transaction_id)?;
        let deadlock = Self::build_cycle(&edges, cycle);
        warn!("Deadlock detected: {}", deadlock.describe());
        Some(deadlock)
    }

    fn adjacency(edges: &HashSet<WaitForEdge>) -> HashMap<String, Vec<String>> {
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        for edge in edges.iter() {
            graph
                .entry(edge.waiting_transaction.clone())
                .or_default()
                .push(edge.holding_transaction.clone());
        }
        for neighbors in graph.values_mut() {
            neighbors.sort();
            neighbors.dedup();
        }
        graph
    }

    fn build_cycle(edges: &HashSet<WaitForEdge>, cycle: Vec<String>) -> DeadlockCycle {
        let cycle_set: HashSet<&String> = cycle.iter().collect();
        let mut resources: Vec<String> = edges
            .iter()
            .filter(|edge| {
                cycle_set.contains(&edge.waiting_transaction)
                    && cycle_set.contains(&edge.holding_transaction)
            })
            .map(|edge| edge.resource_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        resources.sort();

        DeadlockCycle {
            transactions: cycle,
            resources,
            detected_at: SystemTime::now(),
        }
    }

    /// Walk wait-for edges from `start`; the stack of open frames is the wait
    /// path, returned once an edge leads back to `start`
    fn cycle_from<'a>(graph: &'a HashMap<String, Vec<String>>, start: &'a str) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

        while let Some((current, next)) = stack.last_mut() {
            let waits_on = graph.get(*current).map_or(&[][..], Vec::as_slice);
            let Some(holder) = waits_on.get(*next).map(String::as_str) else {
                stack.pop();
                continue;
            };
            *next += 1;

            if holder == start {
                return Some(stack.iter().map(|(tx, _)| tx.to_string()).collect());
            }
            if visited.insert(holder) {
                stack.push((holder, 0));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_detection() {
        let detector = DeadlockDetector::new();

        // tx1 -> tx2 -> tx1
        detector.add_wait_for("tx1", "tx2", "students:1");
        detector.add_wait_for("tx2", "tx1", "students:2");

        let cycle = detector.detect_deadlock().expect("cycle");
        assert_eq!(cycle.transactions.len(), 2);
        assert!(cycle.transactions.contains(&"tx1".to_string()));
        assert!(cycle.transactions.contains(&"tx2".to_string()));
        assert_eq!(cycle.resources, vec!["students:1", "students:2"]);
    }

    #[test]
    fn test_cycle_through_names_requester_as_victim() {
        let detector = DeadlockDetector::new();
        detector.add_wait_for("tx1", "tx2", "a");
        detector.add_wait_for("tx2", "tx3", "b");
        detector.add_wait_for("tx3", "tx1", "c");

        let cycle = detector.detect_cycle_through("tx3").expect("cycle");
        assert_eq!(cycle.transactions, vec!["tx3", "tx1", "tx2"]);
        assert_eq!(cycle.select_victim().as_deref(), Some("tx3"));
        assert!(cycle.describe().starts_with("wait cycle tx3 -> tx1 -> tx2 -> tx3"));
    }

    #[test]
    fn test_chain_without_cycle() {
        let detector = DeadlockDetector::new();
        detector.add_wait_for("tx1", "tx2", "a");
        detector.add_wait_for("tx2", "tx3", "b");

        assert!(detector.detect_deadlock().is_none());
        assert!(detector.detect_cycle_through("tx1").is_none());
    }

    #[test]
    fn test_waiter_outside_the_cycle_is_not_part_of_it() {
        let detector = DeadlockDetector::new();
        detector.add_wait_for("tx1", "tx2", "a");
        detector.add_wait_for("tx2", "tx1", "b");
        detector.add_wait_for("tx4", "tx1", "c");
        detector.add_wait_for("tx4", "tx3", "d");

        assert!(detector.detect_cycle_through("tx4").is_none());
        let cycle = detector.detect_deadlock().expect("cycle");
        assert_eq!(cycle.transactions, vec!["tx1", "tx2"]);
        assert_eq!(cycle.resources, vec!["a", "b"]);
    }

    #[test]
    fn test_edge_removal() {
        let detector = DeadlockDetector::new();
        detector.add_wait_for("tx1", "tx2", "a");
        detector.add_wait_for("tx2", "tx1", "b");
        detector.add_wait_for("tx3", "tx1", "c");
        detector.add_wait_for("tx1", "tx1", "self-edges are ignored");
        assert_eq!(detector.edge_count(), 3);

        detector.remove_waits_of("tx2");
        assert_eq!(detector.edge_count(), 2);
        assert!(detector.detect_deadlock().is_none());

        detector.remove_transaction("tx1");
        assert_eq!(detector.edge_count(), 0);
    }
}
