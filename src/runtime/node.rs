use crate::NodeIndex;
use crate::runtime::context::PromiseContext;
use crate::runtime::executors::{Outcome, SettledHandler};
use crate::runtime::graph::ReleaseQueue;
use crate::runtime::scheduler::TaskRunner;
use crate::value::Payload;
use std::fmt;
use std::rc::Rc;

/// Client handle to a node in the promise graph.
///
/// The handle keeps its node alive: the node cannot be freed while any
/// clone exists. Dropping the last clone releases the node back to its
/// [`PromiseContext`], which frees it once nothing else (a dependant or
/// the run queue) still needs it. Handles are only meaningful with the
/// context that created them.
pub struct Promise {
    inner: Rc<PromiseInner>,
}

struct PromiseInner {
    index: NodeIndex,
    releases: ReleaseQueue,
}

impl Drop for PromiseInner {
    fn drop(&mut self) {
        self.releases.release(self.index);
    }
}

impl Promise {
    pub(crate) fn new(index: NodeIndex, releases: ReleaseQueue) -> Self {
        Self {
            inner: Rc::new(PromiseInner { index, releases }),
        }
    }

    /// Arena index of the underlying node.
    #[inline(always)]
    pub fn index(&self) -> NodeIndex {
        self.inner.index
    }

    #[inline(always)]
    pub(crate) fn releases(&self) -> &ReleaseQueue {
        &self.inner.releases
    }
}

impl Clone for Promise {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&self.inner.index).finish()
    }
}

/// Fluent construction of a continuation node.
///
/// Any subset of the two handlers may be set; a missing handler passes the
/// prerequisite's value through unchanged. `on_reject` alone is a catch.
///
/// ```rust,ignore
/// let doubled = ThenBuilder::new(&input)
///     .on_resolve(|_cx, v| Outcome::resolved(v.downcast_ref::<i32>().unwrap() * 2))
///     .build(&mut cx);
/// ```
pub struct ThenBuilder<'a> {
    prerequisite: &'a Promise,
    on_resolve: Option<SettledHandler>,
    on_reject: Option<SettledHandler>,
    affinity: Option<Rc<dyn TaskRunner>>,
}

impl<'a> ThenBuilder<'a> {
    pub fn new(prerequisite: &'a Promise) -> Self {
        Self {
            prerequisite,
            on_resolve: None,
            on_reject: None,
            affinity: None,
        }
    }

    /// Handle a resolved prerequisite.
    pub fn on_resolve(
        mut self,
        handler: impl FnOnce(&mut PromiseContext, Payload) -> Outcome + 'static,
    ) -> Self {
        assert!(
            self.on_resolve.is_none(),
            "cannot set the resolve handler twice"
        );
        self.on_resolve = Some(Box::new(handler));
        self
    }

    /// Handle a rejected prerequisite.
    pub fn on_reject(
        mut self,
        handler: impl FnOnce(&mut PromiseContext, Payload) -> Outcome + 'static,
    ) -> Self {
        assert!(
            self.on_reject.is_none(),
            "cannot set the reject handler twice"
        );
        self.on_reject = Some(Box::new(handler));
        self
    }

    /// Pin execution of this node to an external sequencer. The drain
    /// loop will post a continuation to `runner` instead of running the
    /// node inline.
    pub fn via(mut self, runner: Rc<dyn TaskRunner>) -> Self {
        assert!(self.affinity.is_none(), "cannot set the task runner twice");
        self.affinity = Some(runner);
        self
    }

    /// Wire the node into the graph. If the prerequisite has already
    /// settled the node executes during this call (or is posted to its
    /// runner).
    pub fn build(self, cx: &mut PromiseContext) -> Promise {
        cx.attach_then(
            self.prerequisite,
            self.on_resolve,
            self.on_reject,
            self.affinity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_release_once() {
        let releases = ReleaseQueue::new();
        let promise = Promise::new(NodeIndex::new(2), releases.clone());
        let other = promise.clone();

        drop(promise);
        assert_eq!(releases.next_released(), None);

        drop(other);
        assert_eq!(releases.next_released(), Some(NodeIndex::new(2)));
        assert_eq!(releases.next_released(), None);
    }
}
