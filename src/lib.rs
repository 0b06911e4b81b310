//! # multidrop
//!
//! Async command/response protocol engine for chained serial instruments.
//!
//! Several instruments can share one RS-232 line, each answering to a
//! single-character bus address. This library owns the port, serialises
//! exchanges so replies never interleave, and decodes the terse ASCII
//! replies into typed values.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - One lock per port, held for a whole command exchange
//! - Echo verification, ACK/NAK bytes and bare syntax-error bytes
//! - Read-through caches that are dropped on every write that could stale them
//! - Ismatec MCP peristaltic pumps and Hamilton MVP valve positioners
//!
//! ## Quick Start
//!
//! ```no_run
//! use multidrop::ismatec::McpChain;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), multidrop::Error> {
//!     let mut chain = McpChain::serial("/dev/ttyUSB0");
//!     let addresses = chain.initialize().await?.to_vec();
//!     println!("Pumps at {addresses:?}");
//!
//!     let pump = chain.pump(addresses[0])?;
//!     pump.initialize().await?;
//!     pump.set_speed(120.0).await?;
//!     pump.start().await?;
//!     println!("Flow: {} ml/min", pump.calibrated_flow_rate().await?);
//!     pump.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Byte/line channel to a port (serial, or scripted mock)
//! - [`protocol`] - Framing rules, response units, the [`Command`] trait and field parsers
//! - [`chain`] - The dispatcher that runs one command at a time over a port
//! - [`ismatec`] - Ismatec MCP pump commands, chain discovery and pump device
//! - [`hamilton`] - Hamilton MVP valve commands, auto-addressing and valve device

pub mod chain;
pub mod error;
pub mod hamilton;
pub mod ismatec;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use chain::Chain;
pub use error::{Error, ParseError, Result};
pub use hamilton::{MvpChain, MvpValve, RotationPolicy, ValveType};
pub use ismatec::{McpChain, McpPump, Mode, StartOutcome};
pub use protocol::{Command, Framing, ResponseUnit, Step, UnitKind};
pub use transport::{MockTransport, SerialConfig, SerialTransport, Transport, serial::list_ports};
