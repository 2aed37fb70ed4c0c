use crate::runtime::executors::{Executor, Outcome, SettledHandler};
use crate::runtime::graph::{NodeCell, PromiseGraph, ReleaseQueue};
use crate::runtime::node::Promise;
use crate::runtime::scheduler::{RunQueue, TaskRunner};
use crate::value::{Payload, TaggedValue};
use crate::{NodeIndex, PrerequisitePolicy, State};
use std::rc::Rc;
use tracing::trace;

/// Recoverable misuse of the manual settle API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PromiseError {
    /// The promise already carries a final value.
    #[error("promise has already settled")]
    AlreadySettled,

    /// Only initial promises accept a manual resolve or reject.
    #[error("only an initial promise can be resolved or rejected manually")]
    NotInitial,
}

/// The promise engine: node arena, run queue and drain loop.
///
/// Single-threaded and cooperative. All activity happens inside explicit
/// calls into the context; settling an initial promise drains every node
/// that becomes ready, on the caller's stack, in a deterministic order.
/// Nodes pinned to a [`TaskRunner`] interrupt the drain: a continuation is
/// posted and the drain resumes when the runner invokes it.
pub struct PromiseContext {
    graph: PromiseGraph,
    queue: RunQueue,
    releases: ReleaseQueue,
    edge_buffer: Vec<NodeIndex>,
    next_id: u64,
    in_process: bool,
    task_posted: bool,
}

impl PromiseContext {
    pub fn new() -> Self {
        Self {
            graph: PromiseGraph::new(),
            queue: RunQueue::new(),
            releases: ReleaseQueue::new(),
            edge_buffer: Vec::new(),
            next_id: 0,
            in_process: false,
            task_posted: false,
        }
    }

    /// Create an unresolved promise that settles via [`PromiseContext::resolve`]
    /// or [`PromiseContext::reject`].
    pub fn create_initial(&mut self) -> Promise {
        self.drain_releases();
        let id = self.next_serial();
        let index = self
            .graph
            .insert(NodeCell::new(id, PrerequisitePolicy::Never));
        trace!(node = index.index(), "created initial promise");
        Promise::new(index, self.releases.clone())
    }

    /// Deliver a resolution value to an initial promise and drain.
    ///
    /// Settling a cancelled promise is a silent no-op. Settling twice, or
    /// settling a non-initial node, is reported as an error.
    pub fn resolve<T: 'static>(&mut self, promise: &Promise, value: T) -> Result<(), PromiseError> {
        let index = self.fetch(promise);
        self.settle_initial(index, TaggedValue::Resolved(Payload::new(value)))
    }

    /// Deliver a rejection reason to an initial promise and drain.
    pub fn reject<T: 'static>(&mut self, promise: &Promise, reason: T) -> Result<(), PromiseError> {
        let index = self.fetch(promise);
        self.settle_initial(index, TaggedValue::Rejected(Payload::new(reason)))
    }

    /// A promise that resolves once every prerequisite has resolved, with
    /// one payload per prerequisite in declared order (`Vec<Payload>`), or
    /// rejects with the first rejection in declared order.
    pub fn all(&mut self, promises: &[&Promise]) -> Promise {
        let prerequisites: Vec<NodeIndex> = promises.iter().map(|p| self.fetch(p)).collect();
        self.attach(prerequisites, PrerequisitePolicy::All, Executor::All, None)
    }

    /// A promise that adopts the first prerequisite to settle, resolved or
    /// rejected alike. Requires at least one prerequisite.
    pub fn race(&mut self, promises: &[&Promise]) -> Promise {
        assert!(!promises.is_empty(), "race requires at least one promise");
        let prerequisites: Vec<NodeIndex> = promises.iter().map(|p| self.fetch(p)).collect();
        self.attach(prerequisites, PrerequisitePolicy::Any, Executor::Race, None)
    }

    /// Run `handler` after the prerequisite settles AND every sibling
    /// continuation hanging off it has run. The returned promise carries
    /// no value and never settles; keep it only to cancel the block.
    pub fn finally(
        &mut self,
        prerequisite: &Promise,
        handler: impl FnOnce() + 'static,
    ) -> Promise {
        let pre = self.fetch(prerequisite);
        self.attach(
            vec![pre],
            PrerequisitePolicy::Finally,
            Executor::Finally(Box::new(handler)),
            None,
        )
    }

    /// Cancel a promise and, transitively, every dependant that cannot
    /// deliver anything anymore. An any-policy dependant (a race) survives
    /// while something downstream of it is still live. Settled nodes are
    /// past cancellation and ignore the call.
    pub fn cancel(&mut self, promise: &Promise) {
        self.drain_releases();
        let index = self.fetch(promise);
        self.cancel_node(index);
        // cancellation can unblock a finally sibling
        self.maybe_process();
    }

    /// Current lifecycle state of a promise.
    pub fn state(&self, promise: &Promise) -> State {
        self.graph.cell(self.fetch(promise)).state
    }

    /// Free nodes whose last client handle was dropped and that nothing
    /// in the graph still needs. Also runs opportunistically on every
    /// mutating entry point.
    pub fn collect(&mut self) {
        self.drain_releases();
    }

    /// Number of live nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub(crate) fn attach_then(
        &mut self,
        prerequisite: &Promise,
        on_resolve: Option<SettledHandler>,
        on_reject: Option<SettledHandler>,
        affinity: Option<Rc<dyn TaskRunner>>,
    ) -> Promise {
        let pre = self.fetch(prerequisite);
        self.attach(
            vec![pre],
            PrerequisitePolicy::All,
            Executor::then(on_resolve, on_reject),
            affinity,
        )
    }

    #[inline]
    fn fetch(&self, promise: &Promise) -> NodeIndex {
        debug_assert!(
            promise.releases().same_as(&self.releases),
            "promise handle used with a foreign context"
        );
        promise.index()
    }

    fn next_serial(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn settle_initial(
        &mut self,
        index: NodeIndex,
        value: TaggedValue,
    ) -> Result<(), PromiseError> {
        self.drain_releases();
        let cell = self.graph.cell_mut(index);
        if cell.state.is_cancelled() {
            return Ok(());
        }
        if !cell.is_initial() {
            return Err(PromiseError::NotInitial);
        }
        if !cell.state.is_unresolved() {
            return Err(PromiseError::AlreadySettled);
        }
        cell.value = value;
        trace!(node = index.index(), "manually settled");
        self.set_state_from_value(index);
        self.schedule_ready_dependants(index);
        self.maybe_process();
        Ok(())
    }

    /// Wire a new node under its prerequisites. If the prerequisites
    /// already satisfy the policy the node is scheduled and the drain
    /// runs before this returns (or a continuation is posted).
    fn attach(
        &mut self,
        prerequisites: Vec<NodeIndex>,
        policy: PrerequisitePolicy,
        executor: Executor,
        affinity: Option<Rc<dyn TaskRunner>>,
    ) -> Promise {
        self.drain_releases();
        let id = self.next_serial();
        let mut cell = NodeCell::new(id, policy);
        cell.executor = Some(executor);
        cell.affinity = affinity;
        let index = self.graph.insert(cell);

        let mut dead = match policy {
            // a race stays viable while any prerequisite can still settle
            PrerequisitePolicy::Any => !prerequisites.is_empty(),
            _ => false,
        };
        for &pre in &prerequisites {
            self.graph.link(pre, index);
            let cancelled = self.graph.cell(pre).state.is_cancelled();
            match policy {
                PrerequisitePolicy::Any => dead &= cancelled,
                _ => dead |= cancelled,
            }
        }
        self.graph.cell_mut(index).prerequisites = prerequisites;
        trace!(node = index.index(), ?policy, "attached");

        if dead {
            // a cancelled prerequisite can never settle
            self.cancel_node(index);
        } else if self.can_execute(index) {
            self.schedule(index);
        }
        let promise = Promise::new(index, self.releases.clone());
        self.maybe_process();
        promise
    }

    /// Readiness of a node under its prerequisite policy.
    fn can_execute(&self, index: NodeIndex) -> bool {
        let cell = self.graph.cell(index);
        match cell.policy {
            PrerequisitePolicy::Never => false,
            PrerequisitePolicy::Always => true,
            PrerequisitePolicy::All => {
                cell.prerequisites
                    .iter()
                    .any(|&p| self.graph.cell(p).state.is_rejected())
                    || cell
                        .prerequisites
                        .iter()
                        .all(|&p| self.graph.cell(p).state.is_settled())
            }
            PrerequisitePolicy::Any => {
                debug_assert!(
                    !cell.prerequisites.is_empty(),
                    "an any-policy node needs at least one prerequisite"
                );
                cell.prerequisites
                    .iter()
                    .any(|&p| self.graph.cell(p).state.is_settled())
            }
            PrerequisitePolicy::Finally => {
                let pre = cell.prerequisites[0];
                self.graph.cell(pre).state.is_settled()
                    && self
                        .graph
                        .dependants(pre)
                        .all(|d| d == index || self.graph.cell(d).policy.is_finally())
            }
        }
    }

    fn schedule(&mut self, index: NodeIndex) {
        let cell = self.graph.cell_mut(index);
        debug_assert!(!cell.enqueued, "node scheduled twice");
        let finally = cell.policy.is_finally();
        self.queue.schedule(index, cell.id, finally);
        // Never blocks every later readiness check: one execution per node
        cell.policy = PrerequisitePolicy::Never;
        cell.enqueued = true;
        trace!(node = index.index(), finally, "scheduled");
    }

    /// Readiness is judged for the whole wave before anything is
    /// enqueued: scheduling flips a node's policy to `Never`, which would
    /// hide a just-scheduled finally node from its siblings' readiness
    /// checks and leave drain order to graph iteration order.
    fn schedule_ready_dependants(&mut self, index: NodeIndex) {
        let mut buffer = std::mem::take(&mut self.edge_buffer);
        buffer.clear();
        buffer.extend(self.graph.dependants(index));
        buffer.retain(|&d| self.can_execute(d));
        for dependant in buffer.drain(..) {
            // parallel edges surface a dependant once per edge
            if !self.graph.cell(dependant).enqueued {
                self.schedule(dependant);
            }
        }
        self.edge_buffer = buffer;
    }

    /// Release the node's hold on its prerequisites. For each former
    /// prerequisite, re-check its remaining finally dependants (this node
    /// may have been what blocked them) and free it if unowned.
    fn detach_prerequisites(&mut self, index: NodeIndex) {
        let prerequisites = std::mem::take(&mut self.graph.cell_mut(index).prerequisites);
        for pre in prerequisites {
            if !self.graph.unlink(pre, index) {
                // already severed by cancellation
                continue;
            }
            let mut finals: Vec<NodeIndex> = self
                .graph
                .dependants(pre)
                .filter(|&d| self.graph.cell(d).policy.is_finally())
                .collect();
            // snapshot readiness before enqueueing any of them, so a wave
            // of sibling finally nodes drains by creation serial
            finals.retain(|&f| self.can_execute(f));
            for finally in finals {
                self.schedule(finally);
            }
            self.maybe_free(pre);
        }
    }

    /// Derive the node's state from its value slot.
    ///
    /// A curried value either collapses (the nested promise has settled;
    /// adopt its value and state), adopts a cancellation, or re-parents
    /// the node onto the nested promise until it settles.
    fn set_state_from_value(&mut self, index: NodeIndex) {
        let value = self.graph.cell(index).value.clone();
        match value {
            TaggedValue::Resolved(_) => self.graph.cell_mut(index).state = State::Resolved,
            TaggedValue::Rejected(_) => self.graph.cell_mut(index).state = State::Rejected,
            TaggedValue::Empty => {
                debug_assert!(
                    self.graph.cell(index).state.is_after_finally(),
                    "an empty value is only legal on a finally node that ran"
                );
            }
            TaggedValue::Curried(nested) => {
                let nested_state = self.graph.cell(nested).state;
                if nested_state.is_settled() {
                    let adopted = self.graph.cell(nested).value.clone();
                    let cell = self.graph.cell_mut(index);
                    cell.value = adopted;
                    cell.state = nested_state;
                } else if nested_state.is_cancelled() {
                    self.cancel_node(index);
                } else {
                    // wait on the nested promise instead of the old parents
                    self.detach_prerequisites(index);
                    self.graph.link(nested, index);
                    let cell = self.graph.cell_mut(index);
                    cell.prerequisites.push(nested);
                    cell.policy = PrerequisitePolicy::All;
                    cell.state = State::ResolvedWithPromise;
                    trace!(
                        node = index.index(),
                        nested = nested.index(),
                        "re-parented onto nested promise"
                    );
                }
            }
        }
    }

    /// Run a node that was popped from the queue.
    fn execute(&mut self, index: NodeIndex) {
        if self.graph.cell(index).state.is_resolved_with_promise() {
            // the nested promise settled; read through it
            self.set_state_from_value(index);
            return;
        }
        debug_assert!(!self.graph.cell(index).state.is_cancelled());
        let executor = self
            .graph
            .cell_mut(index)
            .executor
            .take()
            .expect("a scheduled node must carry an unconsumed executor");

        // handlers run reentrantly: they may attach, settle or cancel
        // while this node is mid-execution (it stays pinned via `enqueued`)
        let mut nested_guard = None;
        match executor {
            Executor::Then {
                on_resolve,
                on_reject,
            } => {
                let pre = self.graph.cell(index).prerequisites[0];
                let (pre_state, payload) = {
                    let cell = self.graph.cell(pre);
                    (cell.state, cell.value.payload().cloned())
                };
                let payload = payload.expect("a settled prerequisite carries a payload");
                let outcome = match pre_state {
                    State::Resolved => match on_resolve {
                        Some(handler) => handler(self, payload),
                        None => Outcome::Resolved(payload),
                    },
                    State::Rejected => match on_reject {
                        Some(handler) => handler(self, payload),
                        None => Outcome::Rejected(payload),
                    },
                    _ => unreachable!("a then node executed before its prerequisite settled"),
                };
                nested_guard = self.apply_outcome(index, outcome);
            }
            Executor::All => self.run_all(index),
            Executor::Race => self.run_race(index),
            Executor::Finally(handler) => {
                handler();
                self.graph.cell_mut(index).state = State::AfterFinally;
            }
        }

        if !self.graph.cell(index).state.is_cancelled() {
            self.set_state_from_value(index);
        }
        // a curried handle is released only after the dependant edge exists
        drop(nested_guard);
    }

    /// Write a handler's outcome into the node's value slot. A curried
    /// outcome returns the handle so the caller keeps the nested node
    /// alive until re-parenting takes ownership of it.
    fn apply_outcome(&mut self, index: NodeIndex, outcome: Outcome) -> Option<Promise> {
        match outcome {
            Outcome::Resolved(payload) => {
                self.graph.cell_mut(index).value = TaggedValue::Resolved(payload);
                None
            }
            Outcome::Rejected(payload) => {
                self.graph.cell_mut(index).value = TaggedValue::Rejected(payload);
                None
            }
            Outcome::Curried(promise) => {
                debug_assert!(
                    promise.releases().same_as(&self.releases),
                    "curried promise from a foreign context"
                );
                self.graph.cell_mut(index).value = TaggedValue::Curried(promise.index());
                Some(promise)
            }
        }
    }

    fn run_all(&mut self, index: NodeIndex) {
        let prerequisites = self.graph.cell(index).prerequisites.clone();
        for &pre in &prerequisites {
            if self.graph.cell(pre).state.is_rejected() {
                let reason = self.settled_payload(pre);
                self.graph.cell_mut(index).value = TaggedValue::Rejected(reason);
                return;
            }
        }
        let mut values = Vec::with_capacity(prerequisites.len());
        for &pre in &prerequisites {
            debug_assert!(
                self.graph.cell(pre).state.is_resolved(),
                "an all node executed before every prerequisite settled"
            );
            values.push(self.settled_payload(pre));
        }
        self.graph.cell_mut(index).value = TaggedValue::Resolved(Payload::new(values));
    }

    fn run_race(&mut self, index: NodeIndex) {
        let prerequisites = self.graph.cell(index).prerequisites.clone();
        for &pre in &prerequisites {
            // cancelled prerequisites never settle; skip them
            if self.graph.cell(pre).state.is_settled() {
                let winner = self.graph.cell(pre).value.clone();
                self.graph.cell_mut(index).value = winner;
                return;
            }
        }
        unreachable!("a race node executed before any prerequisite settled");
    }

    #[inline]
    fn settled_payload(&self, index: NodeIndex) -> Payload {
        self.graph
            .cell(index)
            .value
            .payload()
            .cloned()
            .expect("a settled node carries a payload")
    }

    /// Worklist cancellation; the `Cancelled` state doubles as the
    /// visited mark, so shared or cyclic reachability terminates.
    fn cancel_node(&mut self, index: NodeIndex) {
        let mut worklist = vec![index];
        while let Some(node) = worklist.pop() {
            let Some(cell) = self.graph.get_mut(node) else {
                continue;
            };
            if cell.state.is_cancelled() || cell.state.is_settled() || cell.state.is_after_finally()
            {
                continue;
            }
            cell.state = State::Cancelled;
            // drop handlers along with any promises they captured
            cell.executor = None;
            trace!(node = node.index(), "cancelled");
            self.detach_prerequisites(node);
            let dependants: Vec<NodeIndex> = self.graph.dependants(node).collect();
            for dependant in dependants {
                if self.should_cancel_too(dependant) {
                    worklist.push(dependant);
                }
                // a surviving dependant keeps its edge: it still owns this
                // node and still lists it as an (unsettleable) prerequisite
            }
            self.maybe_free(node);
        }
    }

    /// A cancelled prerequisite drags its dependants down, except an
    /// any-policy dependant that something non-cancelled still depends
    /// on; with nothing downstream the any node goes down as well.
    fn should_cancel_too(&self, dependant: NodeIndex) -> bool {
        let cell = self.graph.cell(dependant);
        if !cell.policy.is_any() {
            return true;
        }
        self.graph
            .dependants(dependant)
            .all(|d| self.graph.cell(d).state.is_cancelled())
    }

    /// Free the node unless a handle, a dependant or the run queue still
    /// owns it, then re-check its former prerequisites the same way.
    fn maybe_free(&mut self, index: NodeIndex) {
        let mut worklist = vec![index];
        while let Some(node) = worklist.pop() {
            let Some(cell) = self.graph.get(node) else {
                continue;
            };
            if cell.retained || cell.enqueued || self.graph.dependant_count(node) > 0 {
                continue;
            }
            let Some(cell) = self.graph.remove(node) else {
                continue;
            };
            trace!(node = node.index(), "freed");
            worklist.extend(cell.prerequisites);
        }
    }

    fn drain_releases(&mut self) {
        while let Some(index) = self.releases.next_released() {
            if let Some(cell) = self.graph.get_mut(index) {
                cell.retained = false;
                self.maybe_free(index);
            }
        }
    }

    /// Start a drain unless one is live or deferred. Called by every
    /// operation that can create ready nodes.
    fn maybe_process(&mut self) {
        if self.in_process || self.task_posted {
            return;
        }
        let Some(front) = self.queue.peek() else {
            self.drain_releases();
            return;
        };
        match self.graph.cell(front).affinity.clone() {
            Some(runner) => self.post_continuation(runner),
            None => self.process(),
        }
    }

    /// Drain the run queue on the current stack.
    ///
    /// Only entered when the front node may run here: callers go through
    /// [`PromiseContext::maybe_process`] or a posted continuation.
    fn process(&mut self) {
        if self.in_process {
            return;
        }
        self.in_process = true;
        while let Some(index) = self.queue.pop() {
            // `enqueued` stays set while the node runs: it pins the node
            // against reentrant frees from its own handler
            let cancelled = self.graph.cell(index).state.is_cancelled();
            if !cancelled {
                trace!(node = index.index(), "executing");
                self.execute(index);
            }
            if !self.graph.cell(index).state.is_resolved_with_promise() {
                self.schedule_ready_dependants(index);
                self.detach_prerequisites(index);
            }
            self.graph.cell_mut(index).enqueued = false;
            self.maybe_free(index);

            let Some(front) = self.queue.peek() else {
                break;
            };
            if let Some(runner) = self.graph.cell(front).affinity.clone() {
                // the next node must run on its own sequencer
                self.post_continuation(runner);
                break;
            }
        }
        self.in_process = false;
        self.drain_releases();
    }

    fn post_continuation(&mut self, runner: Rc<dyn TaskRunner>) {
        debug_assert!(!self.task_posted, "continuation already outstanding");
        self.task_posted = true;
        trace!("posting continuation");
        let target = Rc::clone(&runner);
        runner.post(Box::new(move |cx: &mut PromiseContext| {
            cx.task_posted = false;
            cx.resume_on(target);
        }));
    }

    /// Continuation entry point. The queue may have reordered while the
    /// post was in flight; a front that needs a different runner is
    /// re-posted instead of run here.
    fn resume_on(&mut self, runner: Rc<dyn TaskRunner>) {
        if self.in_process {
            return;
        }
        let Some(front) = self.queue.peek() else {
            return;
        };
        if let Some(required) = self.graph.cell(front).affinity.clone()
            && !Rc::ptr_eq(&required, &runner)
        {
            self.post_continuation(required);
            return;
        }
        self.process();
    }
}
