#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! koruza-control library — building blocks of the serial command broker.
//!
//! The broker mediates access to a single half-duplex serial device on
//! behalf of multiple local clients:
//!
//! - `config` — configuration loading and validation
//! - `protocol` — wire framing shared by broker and client
//! - `scheduler` — FIFO command queue with a single active slot
//! - `serial` — serial port lifecycle and reset hook
//! - `broker` — the event-driven broker task
//! - `server` — unix-socket listener and per-connection framing
//! - `client` — the interactive controller client

pub mod broker;
pub mod client;
pub mod config;
pub mod protocol;
pub mod scheduler;
pub mod serial;
pub mod server;

// Re-export key types at crate root for convenience.
pub use broker::{Broker, Event};
pub use config::Config;
pub use protocol::ResponseFramer;
pub use scheduler::Scheduler;
pub use serial::SerialPort;
