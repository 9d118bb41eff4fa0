//! Inter-Process Coordination
//!
//! The glue that lets one logical proxy instance run as a cooperating group
//! of OS processes: strand registration and discovery, the startup
//! synchronization barrier, a reliable point-to-point datagram messenger,
//! per-process startup-activity accounting, and the PID-file instance guard.
//!
//! Each process runs a single cooperative event loop; handlers run to
//! completion before the next inbound event is processed. The only state
//! shared across process boundaries without a message in between lives in
//! the `pagepool` crate; everything here is reached through datagrams routed
//! via the Coordinator.

pub mod agent;
pub mod coordinator;
pub mod error;
pub mod fdpass;
pub mod ledger;
pub mod messenger;
pub mod pidfile;

// Re-export commonly used types
pub use agent::{AgentConfig, MessageHandler, StrandAgent};
pub use coordinator::{Coordinator, CoordinatorConfig, Outbound, StrandRegistry};
pub use error::{IpcError, Result};
pub use ledger::{LedgerHold, OptionalStartupActivity, StartupActivity, StartupLedger};
pub use messenger::{Messenger, MessengerConfig, MessengerStats, MessengerStatsSnapshot};
pub use pidfile::PidFile;
