//! c3-hub: command-and-control hub for remote agents
//!
//! Agents and dashboards connect over WebSocket. The hub keeps track of which
//! agents are live, forwards commands to them, relays their output to every
//! dashboard and runs an offline handshake before an agent is deleted.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod protocol;
pub mod records;
pub mod registry;
pub mod server;
pub mod testing;
pub mod watch;

pub use cli::{Cli, Command};
pub use config::ServerConfig;
pub use protocol::{AgentMessage, CommandEnvelope, Event, ShellOutput};
pub use records::{ClientRecords, NoopRecords, RecordError};
pub use registry::{OfflineOutcome, Registry, RenameOutcome};
pub use server::{Server, ServerError};
pub use testing::{AgentPeer, ObserverPeer, RecordingRecords, TestError, TestHarness};
pub use watch::{WatchError, Watcher};
