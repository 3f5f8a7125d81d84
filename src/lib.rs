//! ferry - share one directory over a line-oriented TCP protocol
//!
//! The server core is split the way a request flows through it:
//! [`session`] reads command lines with the [`codec`], [`dispatch`] parses
//! them into a [`command::Command`] and runs it against the [`store`],
//! taking per-file holds from [`locks`]. [`server`] accepts connections
//! and bounds how many run at once. [`client`] speaks the same protocol.

pub mod audit;
pub mod cli;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod logging;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
