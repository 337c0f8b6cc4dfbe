//! Port Forwarding Manager
//!
//! Owns the registry of active forwards for one Ready session. Adds and
//! removals are serialized behind one async mutex; relays run on their
//! own tasks and never touch the registry.

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::dynamic::start_dynamic_forward;
use super::listener::ListenerHandle;
use super::local::start_local_forward;
use super::port::{ForwardKind, ForwardedPort};
use super::relay::ForwardStats;
use super::remote::RemoteForwardTable;
use crate::session::EventSink;
use crate::ssh::{ForwardError, HandleController, SshError};

enum Runtime {
    Listener(ListenerHandle),
    Remote { bound_port: u32 },
}

struct ActiveForward {
    /// Effective rule, with the bound port filled in
    spec: ForwardedPort,
    /// Rule as requested, so callers can remove by either form
    requested: ForwardedPort,
    runtime: Runtime,
}

/// Snapshot for the UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardInfo {
    pub port: ForwardedPort,
    pub stats: ForwardStats,
}

pub struct PortForwardManager {
    controller: HandleController,
    events: EventSink,
    remote: RemoteForwardTable,
    active: Mutex<Vec<ActiveForward>>,
}

impl PortForwardManager {
    pub fn new(controller: HandleController, events: EventSink, remote: RemoteForwardTable) -> Self {
        Self {
            controller,
            events,
            remote,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Start a forward and register it. Failures are reported as a service
    /// message and leave nothing registered.
    pub async fn add_port_forward(&self, spec: ForwardedPort) -> Result<ForwardedPort, ForwardError> {
        let mut active = self.active.lock().await;

        let result = match spec.validate() {
            Ok(()) if active
                .iter()
                .any(|a| a.spec.same_binding(&spec) || a.requested.same_binding(&spec)) =>
            {
                Err(ForwardError::AddrInUse(spec.bind_addr()))
            }
            Ok(()) => self.start(&spec).await,
            Err(e) => Err(e),
        };

        match result {
            Ok((effective, runtime)) => {
                let arrow = if effective.kind == ForwardKind::Remote { "<-" } else { "->" };
                self.events
                    .service_message(format!(" {} Forwarded {}", arrow, effective));
                active.push(ActiveForward {
                    spec: effective.clone(),
                    requested: spec,
                    runtime,
                });
                Ok(effective)
            }
            Err(e) => {
                let message = match (&e, spec.kind) {
                    (ForwardError::RemoteRejected(reason), ForwardKind::Remote) => {
                        format!(" X  Remote rejected port forwarding for {}: {}", spec, reason)
                    }
                    _ => format!(" X  Failed to forward port {}: {}", spec, e),
                };
                self.events.service_message(message);
                Err(e)
            }
        }
    }

    async fn start(&self, spec: &ForwardedPort) -> Result<(ForwardedPort, Runtime), ForwardError> {
        match spec.kind {
            ForwardKind::Local | ForwardKind::Dynamic => {
                let handle = if spec.kind == ForwardKind::Local {
                    start_local_forward(self.controller.clone(), spec, self.events.clone()).await?
                } else {
                    start_dynamic_forward(self.controller.clone(), spec, self.events.clone()).await?
                };
                let mut effective = spec.clone();
                effective.port = handle.bound_addr.port();
                Ok((effective, Runtime::Listener(handle)))
            }
            ForwardKind::Remote => {
                let bound_port = self
                    .controller
                    .tcpip_forward(&spec.host, spec.port as u32)
                    .await
                    .map_err(|e| match e {
                        SshError::Disconnected => ForwardError::NotReady,
                        other => ForwardError::RemoteRejected(other.to_string()),
                    })?;
                let mut effective = spec.clone();
                effective.port = bound_port as u16;
                self.remote.register(effective.clone());
                Ok((effective, Runtime::Remote { bound_port }))
            }
        }
    }

    /// Stop a forward and deregister it. Matches on kind, bind host and
    /// bind port, as requested or as bound.
    pub async fn remove_port_forward(&self, spec: &ForwardedPort) -> Result<(), ForwardError> {
        let mut active = self.active.lock().await;
        let index = active
            .iter()
            .position(|a| a.spec.same_binding(spec) || a.requested.same_binding(spec))
            .ok_or_else(|| ForwardError::NotFound(spec.to_string()))?;

        let forward = active.remove(index);
        drop(active);

        self.stop(forward).await;
        Ok(())
    }

    async fn stop(&self, forward: ActiveForward) {
        match forward.runtime {
            Runtime::Listener(handle) => handle.stop().await,
            Runtime::Remote { bound_port } => {
                self.remote.unregister(bound_port);
                if let Err(e) = self
                    .controller
                    .cancel_tcpip_forward(&forward.spec.host, bound_port)
                    .await
                {
                    warn!("cancel-tcpip-forward for {} failed: {}", forward.spec, e);
                }
            }
        }
        self.events
            .service_message(format!("Stopped forwarding {}", forward.spec));
    }

    /// Stop everything, used on session teardown
    pub async fn stop_all(&self) {
        let forwards: Vec<ActiveForward> = self.active.lock().await.drain(..).collect();
        if !forwards.is_empty() {
            info!("Stopping {} forwards", forwards.len());
        }
        for forward in forwards {
            self.stop(forward).await;
        }
        self.remote.clear();
    }

    pub async fn list(&self) -> Vec<ForwardInfo> {
        self.active
            .lock()
            .await
            .iter()
            .map(|a| ForwardInfo {
                port: a.spec.clone(),
                stats: match &a.runtime {
                    Runtime::Listener(handle) => handle.stats(),
                    Runtime::Remote { bound_port } => {
                        self.remote.stats(*bound_port).unwrap_or_default()
                    }
                },
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.active.lock().await.len()
    }
}
