use crate::NodeIndex;
use crate::runtime::context::PromiseContext;
use std::collections::BTreeSet;

/// A deferred slice of the drain loop, handed to a [`TaskRunner`].
///
/// Invoking it re-enters the context and resumes processing with the node
/// the continuation was posted for.
pub type Continuation = Box<dyn FnOnce(&mut PromiseContext)>;

/// An external sequencer that can run work later.
///
/// The engine itself never spins an event loop. When the next ready node
/// declares an affinity, the drain stops and posts a [`Continuation`] to
/// the node's runner; whatever drives that runner decides when the
/// continuation (and with it the node) executes. Implementations must
/// invoke each posted continuation exactly once.
pub trait TaskRunner {
    fn post(&self, task: Continuation);
}

/// Queue position of a ready node.
///
/// Finally nodes sort behind every non-finally node; within a class the
/// creation serial decides. Derived ordering is field order, so the
/// declaration below IS the comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    finally: bool,
    id: u64,
    index: NodeIndex,
}

/// The ordered set of nodes ready to execute.
///
/// An ordered set rather than a FIFO: readiness can be discovered in any
/// dependant-iteration order, but execution order must not depend on it.
/// Double insertion is prevented one level up (a node's policy flips to
/// `Never` when it is scheduled), so every key here is unique.
pub(crate) struct RunQueue {
    ready: BTreeSet<QueueKey>,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            ready: BTreeSet::new(),
        }
    }

    #[inline(always)]
    pub(crate) fn schedule(&mut self, index: NodeIndex, id: u64, finally: bool) {
        self.ready.insert(QueueKey { finally, id, index });
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self) -> Option<NodeIndex> {
        self.ready.pop_first().map(|key| key.index)
    }

    #[inline(always)]
    pub(crate) fn peek(&self) -> Option<NodeIndex> {
        self.ready.first().map(|key| key.index)
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}
