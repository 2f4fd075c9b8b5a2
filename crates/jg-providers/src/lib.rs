//! jg-providers: concrete machine providers for jumpgate
//!
//! Each provider implements the [`jg_core::Provider`] contract; the
//! [`registry::ProviderRegistry`] resolves configuration type names to
//! provider factories.

pub mod forward;
pub mod registry;
pub mod virtualbox;

pub use registry::{ProviderFactory, ProviderRegistry};
