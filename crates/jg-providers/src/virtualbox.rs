//! VirtualBox provider
//!
//! Drives a local VM through the `VBoxManage` CLI: start it headless,
//! probe the guest's SSH port, serve translate requests against the
//! guest address, and power the VM off when the machine winds down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use jg_core::config::duration_secs;
use jg_core::provider::EXTERNAL_COMMAND_TIMEOUT;
use jg_core::{probe_tcp, Diagnostic, Diagnostics, Machine, MachineControl, Provider};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct VirtualBoxOptions {
    /// VM name or UUID as known to VBoxManage.
    vm: String,

    /// Guest address channels are proxied to.
    address: String,

    /// Port probed for reachability.
    #[serde(default = "default_probe_port")]
    probe_port: u16,

    /// Idle grace period before the VM is shut down.
    #[serde(default, with = "duration_secs")]
    linger: Duration,

    /// Hard power-off instead of an ACPI shutdown signal.
    #[serde(default)]
    power_off: bool,
}

fn default_probe_port() -> u16 {
    22
}

/// Provider backed by a VirtualBox VM.
pub struct VirtualBoxProvider {
    options: VirtualBoxOptions,
}

/// Factory for `type = "virtualbox"` targets.
pub fn factory(target: &str, options: &toml::Table) -> Result<Arc<dyn Provider>, Diagnostics> {
    let options: VirtualBoxOptions =
        toml::Value::Table(options.clone()).try_into().map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!(
                    "invalid virtualbox options for target {:?}",
                    target
                ))
                .with_detail(e.to_string()),
            )
        })?;

    Ok(Arc::new(VirtualBoxProvider { options }))
}

#[async_trait]
impl Provider for VirtualBoxProvider {
    fn is_shared(&self) -> bool {
        true
    }

    async fn run_machine(&self, machine: &Machine, control: &mut MachineControl) {
        // Teardown must only run for a VM that actually started.
        if !self.start_vm(machine).await {
            return;
        }

        let probe_addr = format!("{}:{}", self.options.address, self.options.probe_port);
        if probe_tcp(&probe_addr, &control.stop).await {
            let _ = machine.resolved.set(self.options.address.clone());
            tracing::info!(
                "machine {} (vm {:?}) reachable on {}",
                machine.id,
                self.options.vm,
                probe_addr
            );

            let address = self.options.address.clone();
            let end = control
                .serve(self.options.linger, |request| {
                    Some(format!("{}:{}", address, request.port))
                })
                .await;
            tracing::debug!("machine {} winding down: {:?}", machine.id, end);
        } else {
            tracing::warn!(
                "machine {} (vm {:?}) never became reachable on {}",
                machine.id,
                self.options.vm,
                probe_addr
            );
        }

        self.stop_vm(machine).await;
    }
}

impl VirtualBoxProvider {
    async fn start_vm(&self, machine: &Machine) -> bool {
        tracing::info!("machine {}: starting vm {:?}", machine.id, self.options.vm);
        match vboxmanage(&["startvm", &self.options.vm, "--type", "headless"]).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "machine {}: failed to start vm {:?}: {}",
                    machine.id,
                    self.options.vm,
                    e
                );
                false
            }
        }
    }

    async fn stop_vm(&self, machine: &Machine) {
        let action = if self.options.power_off {
            "poweroff"
        } else {
            "acpipowerbutton"
        };
        tracing::info!(
            "machine {}: stopping vm {:?} ({})",
            machine.id,
            self.options.vm,
            action
        );
        if let Err(e) = vboxmanage(&["controlvm", &self.options.vm, action]).await {
            tracing::error!(
                "machine {}: failed to stop vm {:?}: {}",
                machine.id,
                self.options.vm,
                e
            );
        }
    }
}

/// Run one VBoxManage invocation under the external-command timeout.
async fn vboxmanage(args: &[&str]) -> io::Result<()> {
    let output = tokio::time::timeout(
        EXTERNAL_COMMAND_TIMEOUT,
        Command::new("VBoxManage").args(args).output(),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "VBoxManage timed out"))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("VBoxManage {}: {}", args.join(" "), stderr.trim()),
        ));
    }
    Ok(())
}
