//! WireGuard boundary
//!
//! The data plane is an external collaborator. This module defines the
//! driver capability the reconciler programs against, key handling, and a
//! config renderer for operators. Two drivers ship: a command-line driver
//! over `wg`/`ip`, and an in-process driver used by tests.

mod command;
mod config;
mod driver;
pub mod keys;

pub use command::CommandDriver;
pub use config::render_interface_config;
pub use driver::{MemoryDriver, Peer, WireGuardDriver};
pub use keys::KeyPair;
