use crate::runtime::executors::Executor;
use crate::runtime::scheduler::TaskRunner;
use crate::value::TaggedValue;
use crate::{NodeIndex, PrerequisitePolicy, State};
use petgraph::Direction;
use petgraph::stable_graph::StableGraph;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Per-node storage in the promise arena.
///
/// Prerequisite ORDER is semantic (all/race scan in declared order), so the
/// node stores its own ordered prerequisite list. The reverse direction,
/// prerequisite to dependant, lives in the graph as an edge; each such edge
/// also represents the dependant's ownership of the prerequisite.
pub(crate) struct NodeCell {
    /// Creation-order serial, used as the run-queue tie break.
    pub(crate) id: u64,
    pub(crate) state: State,
    pub(crate) policy: PrerequisitePolicy,
    pub(crate) prerequisites: Vec<NodeIndex>,
    pub(crate) value: TaggedValue,
    /// Consumed exactly once by execution. `None` on initial promises.
    pub(crate) executor: Option<Executor>,
    /// External sequencer the node must execute on, if any.
    pub(crate) affinity: Option<Rc<dyn TaskRunner>>,
    /// A live client handle still points at this node.
    pub(crate) retained: bool,
    /// The node currently sits in the run queue.
    pub(crate) enqueued: bool,
}

impl NodeCell {
    pub(crate) fn new(id: u64, policy: PrerequisitePolicy) -> Self {
        Self {
            id,
            state: State::Unresolved,
            policy,
            prerequisites: Vec::new(),
            value: TaggedValue::Empty,
            executor: None,
            affinity: None,
            retained: true,
            enqueued: false,
        }
    }

    /// Initial promises have no executor and no prerequisites; they are
    /// the only nodes that accept a manual resolve or reject.
    #[inline]
    pub(crate) fn is_initial(&self) -> bool {
        self.executor.is_none() && self.prerequisites.is_empty()
    }
}

/// The node arena plus dependant edges.
///
/// Backed by a stable graph so indices survive unrelated removals. An edge
/// `p -> d` means `d` lists `p` as a prerequisite, and equivalently that
/// `d` keeps `p` alive until `d` executes or is freed.
pub(crate) struct PromiseGraph {
    inner: StableGraph<NodeCell, ()>,
}

impl PromiseGraph {
    pub(crate) fn new() -> Self {
        Self {
            inner: StableGraph::new(),
        }
    }

    pub(crate) fn insert(&mut self, cell: NodeCell) -> NodeIndex {
        self.inner.add_node(cell)
    }

    /// Panics if the node has been freed. Callers that can legitimately
    /// race node removal use [`PromiseGraph::get`] instead.
    #[inline(always)]
    pub(crate) fn cell(&self, index: NodeIndex) -> &NodeCell {
        &self.inner[index]
    }

    #[inline(always)]
    pub(crate) fn cell_mut(&mut self, index: NodeIndex) -> &mut NodeCell {
        &mut self.inner[index]
    }

    #[inline(always)]
    pub(crate) fn get(&self, index: NodeIndex) -> Option<&NodeCell> {
        self.inner.node_weight(index)
    }

    #[inline(always)]
    pub(crate) fn get_mut(&mut self, index: NodeIndex) -> Option<&mut NodeCell> {
        self.inner.node_weight_mut(index)
    }

    pub(crate) fn link(&mut self, prerequisite: NodeIndex, dependant: NodeIndex) {
        self.inner.add_edge(prerequisite, dependant, ());
    }

    /// Remove one `prerequisite -> dependant` edge. Parallel edges exist
    /// when a node lists the same prerequisite twice; one call removes one
    /// edge. Returns false when no edge remained.
    pub(crate) fn unlink(&mut self, prerequisite: NodeIndex, dependant: NodeIndex) -> bool {
        match self.inner.find_edge(prerequisite, dependant) {
            Some(edge) => {
                self.inner.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    pub(crate) fn dependants(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.neighbors_directed(index, Direction::Outgoing)
    }

    pub(crate) fn dependant_count(&self, index: NodeIndex) -> usize {
        self.inner
            .edges_directed(index, Direction::Outgoing)
            .count()
    }

    /// Remove a node and every edge touching it.
    pub(crate) fn remove(&mut self, index: NodeIndex) -> Option<NodeCell> {
        self.inner.remove_node(index)
    }

    pub(crate) fn node_count(&self) -> usize {
        self.inner.node_count()
    }
}

/// Deferred-release queue shared between the context and client handles.
///
/// Handles cannot reach the graph from `Drop`, so the last clone of a
/// [`crate::runtime::Promise`] pushes its index here; the context drains
/// the queue at its entry points and frees whatever became unreachable.
#[derive(Clone)]
pub(crate) struct ReleaseQueue {
    released: Rc<RefCell<VecDeque<NodeIndex>>>,
}

impl ReleaseQueue {
    pub(crate) fn new() -> Self {
        Self {
            released: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    #[inline(always)]
    pub(crate) fn release(&self, index: NodeIndex) {
        self.released.borrow_mut().push_back(index);
    }

    #[inline(always)]
    pub(crate) fn next_released(&self) -> Option<NodeIndex> {
        self.released.borrow_mut().pop_front()
    }

    /// Two handles belong to the same context iff they share this queue.
    #[inline]
    pub(crate) fn same_as(&self, other: &ReleaseQueue) -> bool {
        Rc::ptr_eq(&self.released, &other.released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_unlink_parallel_edges() {
        let mut graph = PromiseGraph::new();
        let a = graph.insert(NodeCell::new(0, PrerequisitePolicy::Never));
        let b = graph.insert(NodeCell::new(1, PrerequisitePolicy::All));

        // b depends on a twice, e.g. all([a, a])
        graph.link(a, b);
        graph.link(a, b);
        assert_eq!(graph.dependant_count(a), 2);

        assert!(graph.unlink(a, b));
        assert_eq!(graph.dependant_count(a), 1);
        assert!(graph.unlink(a, b));
        assert!(!graph.unlink(a, b));
        assert_eq!(graph.dependant_count(a), 0);
    }

    #[test]
    fn test_indices_stable_across_removal() {
        let mut graph = PromiseGraph::new();
        let a = graph.insert(NodeCell::new(0, PrerequisitePolicy::Never));
        let b = graph.insert(NodeCell::new(1, PrerequisitePolicy::All));
        let c = graph.insert(NodeCell::new(2, PrerequisitePolicy::All));

        graph.remove(b);
        assert!(graph.get(b).is_none());
        assert_eq!(graph.cell(a).id, 0);
        assert_eq!(graph.cell(c).id, 2);
    }

    #[test]
    fn test_release_queue_fifo() {
        let queue = ReleaseQueue::new();
        let other = queue.clone();
        other.release(NodeIndex::new(7));
        queue.release(NodeIndex::new(3));

        assert!(queue.same_as(&other));
        assert_eq!(queue.next_released(), Some(NodeIndex::new(7)));
        assert_eq!(queue.next_released(), Some(NodeIndex::new(3)));
        assert_eq!(queue.next_released(), None);
    }
}
