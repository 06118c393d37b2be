//! The queue engine.
//!
//! Four components cooperate over a shared [`Store`](crate::store::Store):
//!
//! - [`TopicRegistry`] holds per topic/subtopic delivery policy,
//! - [`MessageStore`] owns message records and every lifecycle transition,
//! - [`LeaseManager`] selects and leases work for pollers,
//! - [`AckCoordinator`] finalizes or releases leased work.
//!
//! None of them keeps queue state between calls. Every transition is a
//! single-record compare-and-swap, so any number of engines may run against
//! the same store. Callers pass the current time in explicitly.

pub mod ack;
pub mod lease;
pub mod messages;
pub mod registry;

pub use ack::{AckCoordinator, ReleaseResult, ReleaseStatus};
pub use lease::{Dequeue, LeaseManager};
pub use messages::{Enqueue, LeaseAttempt, MessageLimits, MessageStore};
pub use registry::TopicRegistry;
