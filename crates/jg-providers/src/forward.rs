//! Static forward provider
//!
//! No backing resource: every translate request is answered immediately
//! with the configured destination. Exists to give plain port forwards
//! the same dispatch path as provisioned machines. Always shared, and
//! never exits until stopped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use jg_core::{Diagnostic, Diagnostics, Machine, MachineControl, Provider};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForwardOptions {
    /// Destination host.
    host: String,
    /// Destination port; the port the client asked for is ignored.
    port: u16,
}

/// Provider that forwards every channel to one fixed destination.
pub struct ForwardProvider {
    destination: String,
}

/// Factory for `type = "forward"` targets.
pub fn factory(target: &str, options: &toml::Table) -> Result<Arc<dyn Provider>, Diagnostics> {
    let options: ForwardOptions =
        toml::Value::Table(options.clone()).try_into().map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!("invalid forward options for target {:?}", target))
                    .with_detail(e.to_string()),
            )
        })?;

    Ok(Arc::new(ForwardProvider {
        destination: format!("{}:{}", options.host, options.port),
    }))
}

#[async_trait]
impl Provider for ForwardProvider {
    fn is_shared(&self) -> bool {
        true
    }

    async fn run_machine(&self, machine: &Machine, control: &mut MachineControl) {
        let _ = machine.resolved.set(self.destination.clone());
        tracing::debug!(
            "forward machine {} serving {}",
            machine.id,
            self.destination
        );

        // Fixed destination: nothing to provision or probe, and the
        // activity counter is irrelevant. Serve until stopped.
        loop {
            tokio::select! {
                biased;
                _ = control.stop.cancelled() => break,
                delta = control.activity.recv() => {
                    if delta.is_none() {
                        break;
                    }
                }
                request = control.translate.recv() => match request {
                    Some(request) => {
                        let _ = request.reply.send(Some(self.destination.clone()));
                    }
                    None => break,
                },
            }
        }
    }
}
