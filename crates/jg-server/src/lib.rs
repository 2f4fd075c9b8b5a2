//! jg-server: the jumpgate daemon
//!
//! Accepts SSH client connections, authenticates them against a single
//! authorized key, and services `direct-tcpip` channels by proxying them
//! to machines provisioned on demand through the configured providers.

pub mod auth;
pub mod connector;
pub mod manager;
pub mod server;

pub use manager::Manager;
