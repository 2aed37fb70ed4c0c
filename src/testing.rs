//! Test doubles for driving the engine without a real event loop.

use crate::runtime::{Continuation, PromiseContext, TaskRunner};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A [`TaskRunner`] that queues posted continuations for explicit pumping.
///
/// Lets tests assert that affinity nodes did NOT run inline, then invoke
/// the continuations one at a time:
///
/// ```rust,ignore
/// let runner = ManualTaskRunner::new();
/// let q = ThenBuilder::new(&p).on_resolve(..).via(runner.clone()).build(&mut cx);
/// cx.resolve(&p, 1).unwrap();
/// assert_eq!(runner.pending(), 1);
/// runner.run_next(&mut cx);
/// ```
pub struct ManualTaskRunner {
    tasks: RefCell<VecDeque<Continuation>>,
}

impl ManualTaskRunner {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            tasks: RefCell::new(VecDeque::new()),
        })
    }

    /// Number of continuations waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Run the oldest pending continuation. Returns false when none was
    /// pending. The continuation may post again (to this runner or
    /// another) before it returns.
    pub fn run_next(&self, cx: &mut PromiseContext) -> bool {
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task(cx);
                true
            }
            None => false,
        }
    }

    /// Pump until no continuation is pending; returns how many ran.
    pub fn run_all(&self, cx: &mut PromiseContext) -> usize {
        let mut ran = 0;
        while self.run_next(cx) {
            ran += 1;
        }
        ran
    }
}

impl TaskRunner for ManualTaskRunner {
    fn post(&self, task: Continuation) {
        self.tasks.borrow_mut().push_back(task);
    }
}
