//! Promise dependency-graph engine.
//!
//! The `runtime` module is the execution core of cascade. Promises form a
//! directed acyclic graph: each node owns an ordered list of prerequisites
//! and is linked back from them as a dependant. When a prerequisite
//! settles, a readiness check decides whether the dependant joins the run
//! queue; a cooperative drain loop then executes ready nodes one at a
//! time, in a deterministic order, on the caller's stack.
//!
//! # Core Components
//!
//! ### [`PromiseContext`]
//! The central engine that owns:
//! - the node arena and dependant edges
//! - the ordered run queue and the drain loop
//! - cancellation, currying and lifetime management
//!
//! ### [`Promise`] and [`ThenBuilder`]
//! Client handles into the graph. A `Promise` keeps its node alive;
//! dropping the last clone releases the node back to the context. The
//! builder wires continuations with optional resolve/reject handlers and
//! an optional scheduling affinity.
//!
//! ### [`TaskRunner`]
//! The seam to an external event loop. A node built `.via(runner)` never
//! executes inline; the drain yields and posts a [`Continuation`] to the
//! runner instead, which re-enters the context when invoked.
//!
//! # Execution Model
//!
//! Single-threaded and cooperative. Everything happens inside explicit
//! calls into the context: settling an initial promise, building a node
//! onto an already-settled prerequisite, or invoking a posted
//! continuation. Handlers run with full access to the context and may
//! create, settle or cancel promises reentrantly; the drain loop is
//! reentrancy-guarded and a node can be enqueued at most once.

pub mod context;
pub mod executors;
mod graph;
pub mod node;
mod scheduler;

pub use context::*;
pub use executors::*;
pub use node::*;
pub use scheduler::{Continuation, TaskRunner};
