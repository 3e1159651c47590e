//! Lynx library
//!
//! Peer-to-peer directory synchronization: named shared folders ("lynks")
//! replicated across a swarm of peers, coordinated by a tracker.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs_enum;
pub mod logger;
pub mod lynk;
pub mod manifest;
pub mod net;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod protocol_core;
pub mod swarm;
pub mod sync;
pub mod tracker;
pub mod transfer;

pub use error::{LynxError, Result};
pub use node::{Node, NodeHandle};
