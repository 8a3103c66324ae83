//! Repository Module
//!
//! Data access layer for the creator. The dedup record lives in PostgreSQL;
//! workloads live in the cluster. Both are trait-based so the services can be
//! tested against in-memory fakes.

pub mod dedup;
pub mod workloads;

// Re-export traits
pub use dedup::DedupStore;
pub use workloads::WorkloadRepository;

// Re-export implementations
pub use dedup::PgDedupStore;
pub use workloads::KubeWorkloadRepository;

#[cfg(test)]
pub(crate) use dedup::fake::InMemoryDedupStore;
