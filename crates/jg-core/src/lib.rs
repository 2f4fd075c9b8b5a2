//! jg-core: machine-lifecycle contracts for jumpgate
//!
//! This crate defines the seams between the jumpgate daemon, its SSH
//! transport, and its machine providers: the configuration schema, the
//! channel-open abstraction, the per-machine control surface, and the
//! provider contract. Nothing in here talks SSH or to a hypervisor; the
//! daemon and provider crates plug into these types.

pub mod channel;
pub mod config;
pub mod diag;
pub mod error;
pub mod machine;
pub mod provider;

pub use channel::{BoxedChannelIo, ChannelIo, ChannelOpen, RejectReason};
pub use config::{load_config, Config, ServerConfig, TargetConfig};
pub use diag::{Diagnostic, Diagnostics, Severity};
pub use error::ConfigError;
pub use machine::{ActivityGuard, Machine, MachineControl, ServeEnd, TranslateRequest};
pub use provider::{probe_tcp, Provider};
