use crate::runtime::context::PromiseContext;
use crate::runtime::node::Promise;
use crate::value::Payload;

/// Handler for a settled prerequisite value.
///
/// Handlers run on the caller's stack with full access to the context, so
/// they may build new promises, settle initials or cancel nodes while the
/// drain loop is live.
pub type SettledHandler = Box<dyn FnOnce(&mut PromiseContext, Payload) -> Outcome>;

/// Side-effect-only closure run by a finally node.
pub type FinallyHandler = Box<dyn FnOnce()>;

/// What a handler produced for its node.
#[derive(Debug)]
pub enum Outcome {
    Resolved(Payload),
    Rejected(Payload),
    /// Defer to another promise: the node adopts whatever that promise
    /// eventually settles to.
    Curried(Promise),
}

impl Outcome {
    pub fn resolved<T: 'static>(value: T) -> Self {
        Outcome::Resolved(Payload::new(value))
    }

    pub fn rejected<T: 'static>(reason: T) -> Self {
        Outcome::Rejected(Payload::new(reason))
    }

    pub fn curried(promise: Promise) -> Self {
        Outcome::Curried(promise)
    }
}

/// The closed set of node behaviors.
///
/// Every non-initial node carries exactly one of these, consumed the one
/// time the node executes.
pub(crate) enum Executor {
    /// Single prerequisite. A resolved prerequisite routes to `on_resolve`,
    /// a rejected one to `on_reject`; a missing handler passes the
    /// prerequisite's value through unchanged, which is what lets a
    /// rejection skip over resolve-only links to the next catch.
    Then {
        on_resolve: Option<SettledHandler>,
        on_reject: Option<SettledHandler>,
    },

    /// N prerequisites. The first rejection in declared order wins;
    /// otherwise resolves with one payload per prerequisite, in order.
    All,

    /// N prerequisites, first settled in declared order wins, resolved or
    /// rejected alike.
    Race,

    /// Single prerequisite. Runs the closure for its side effects; the
    /// node keeps no value and never settles.
    Finally(FinallyHandler),
}

impl Executor {
    pub(crate) fn then(
        on_resolve: Option<SettledHandler>,
        on_reject: Option<SettledHandler>,
    ) -> Self {
        Executor::Then {
            on_resolve,
            on_reject,
        }
    }
}
