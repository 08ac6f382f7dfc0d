//! Scheduling loop that feeds the commit path.
//!
//! Each pass lists pods and nodes, places every unbound pod on the node with
//! the fewest pods (assumed placements included) and binds it. A failed
//! binding is retried by the next pass, which sees the pod unbound again.

mod worker;

pub use worker::{PassStats, SchedulerWorker};
