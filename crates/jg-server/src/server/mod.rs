//! SSH front end: per-connection handler, listener, host key loading.

mod handler;
mod listener;

pub use handler::{ClientHandler, ServerConfig};
pub use listener::{load_host_key, SshServer};
