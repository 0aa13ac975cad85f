//! PDF Reader Scheduler Library
//!
//! Background interval scheduling for periodic maintenance work.
//!
//! Cache cleanup, system-memory probes and optimizer passes all run on a
//! single [`IntervalScheduler`] thread instead of spawning one thread each.
//!
//! # Example
//!
//! ```
//! use pdf_reader_scheduler::IntervalScheduler;
//! use std::time::Duration;
//!
//! let scheduler = IntervalScheduler::start("maintenance");
//! let cleanup = scheduler.schedule("cleanup", Duration::from_secs(30), || {
//!     // ... periodic cleanup ...
//! });
//!
//! // Retune the cadence when memory pressure changes
//! scheduler.set_interval(cleanup, Duration::from_secs(15));
//!
//! scheduler.stop();
//! ```

mod interval;

pub use interval::{IntervalScheduler, TaskFn, TaskId, TaskInfo, MIN_INTERVAL};
