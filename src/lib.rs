#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod capability;
pub mod config;
pub mod dispatch;
mod error;
pub mod gate;
mod io;
pub mod ledger;
pub mod logging;
pub mod store;
pub mod task;

pub use crate::capability::{
    Capabilities, Capability, CommandCapability, CommandSpec, Invocation, Outcome,
};
pub use crate::config::Config;
pub use crate::dispatch::{Dispatcher, Options, PassReport, Resource, Status, TaskOutcome};
pub use crate::error::*;
pub use crate::gate::{Decision, Gate};
pub use crate::io::as_overhead;
pub use crate::ledger::{ResourceLedger, TaskState};
pub use crate::store::LedgerStore;
pub use crate::task::{Registry, Task, TaskKind};
