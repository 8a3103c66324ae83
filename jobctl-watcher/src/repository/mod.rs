//! Repository layer
//!
//! Thin adapters over the two systems the watcher talks to: the cluster API
//! for its own pod, and the results API for the outcome. No business logic
//! lives here; errors are classified and handed up.
//!
//! Both repositories are trait-based so the control loop can be tested with
//! in-memory fakes.

mod outcomes;
mod pods;

// Re-export traits
pub use outcomes::OutcomeRepository;
pub use pods::PodRepository;

// Re-export implementations
pub use outcomes::HttpOutcomeRepository;
pub use pods::KubePodRepository;

pub use outcomes::{StoreAck, StoreError};
pub use pods::ContainerObservation;

#[cfg(test)]
pub(crate) use outcomes::fake::FakeOutcomes;
#[cfg(test)]
pub(crate) use pods::fake::FakePods;
