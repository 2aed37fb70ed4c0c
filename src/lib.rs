use enum_as_inner::EnumAsInner;
pub use petgraph::prelude::NodeIndex;

pub mod runtime;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Lifecycle state of a node in the promise graph.
///
/// States move strictly forward. A node starts `Unresolved`, may pass
/// through `ResolvedWithPromise` while it waits on a nested promise, and
/// ends in exactly one terminal state. `Cancelled` is reachable from any
/// non-settled state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum State {
    /// No value has been delivered yet.
    Unresolved,

    /// The node's executor produced another promise; the node has been
    /// re-parented onto that nested promise and adopts its outcome once
    /// the nested promise settles.
    ResolvedWithPromise,

    /// Settled with a resolution value.
    Resolved,

    /// Settled with a rejection reason.
    Rejected,

    /// A finally node ran its closure. The node carries no value and
    /// never settles; downstream nodes cannot chain off it.
    AfterFinally,

    /// The node was cancelled before it could settle.
    Cancelled,
}

impl State {
    /// A settled node carries a final value: resolved or rejected.
    #[inline(always)]
    pub const fn is_settled(&self) -> bool {
        matches!(self, State::Resolved | State::Rejected)
    }
}

/// Determines when a node's prerequisites make it ready to execute.
///
/// The policy is consulted by the readiness check every time one of the
/// node's prerequisites settles. Once a node is placed on the run queue
/// its policy is overwritten with `Never` so later settlement waves
/// cannot enqueue it a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum PrerequisitePolicy {
    /// Ready when every prerequisite has settled, or immediately once any
    /// prerequisite has rejected. Used by then-chains, currying and `all`.
    All,

    /// Ready as soon as at least one prerequisite has settled. Used by
    /// `race`. Requires at least one prerequisite.
    Any,

    /// Always ready.
    Always,

    /// Never ready. Initial promises use this (they settle manually), and
    /// every node is switched to it when enqueued.
    Never,

    /// Ready when the single prerequisite has settled and every other
    /// dependant of that prerequisite is itself a finally node. This is
    /// what pushes finally blocks behind their sibling continuations.
    Finally,
}

pub mod prelude {
    pub use crate::runtime::{
        Continuation, Outcome, Promise, PromiseContext, PromiseError, TaskRunner, ThenBuilder,
    };
    pub use crate::value::{Payload, TaggedValue};
    pub use crate::{PrerequisitePolicy, State};
}
