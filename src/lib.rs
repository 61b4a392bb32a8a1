//! Supervision harness for semi-autonomous web-extraction workers.
//!
//! The host side launches a worker (usually in a container), polls the
//! file-backed status mailbox the worker publishes into, detects stalls,
//! enforces a hard time budget, and archives every observability file on
//! the way out. The worker side gets [`updater::StatusUpdater`], a
//! heartbeat publisher that keeps the mailbox fresh between explicit
//! progress updates.

pub mod config;
pub mod context;
pub mod lifecycle;
pub mod logs;
pub mod monitor;
pub mod results;
pub mod status;
pub mod updater;
pub mod worker;
