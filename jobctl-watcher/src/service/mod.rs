//! Service layer
//!
//! The pieces the control loop is composed of: the progress monitor, the
//! outcome reporter and the log post-processing used for outcome details.

pub mod logs;
mod monitor;
mod reporter;

pub use monitor::{Clock, ProgressMonitor, SystemClock};
pub use reporter::{ReportResult, Reporter};

#[cfg(test)]
pub(crate) use monitor::test_clock::PausedClock;
