//! Service Handle
//!
//! Cloneable handle to a spawned service: observe its state and ask it to
//! stop. The orchestrator uses it to wait for the controller to come up and
//! to notice when it ends on its own.

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }

    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct ServiceHandle {
    pub service_id: String,
    stop_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    pub(crate) fn new(service_id: String, stop_tx: mpsc::Sender<()>, state_rx: watch::Receiver<ServiceState>) -> Self {
        Self {
            service_id,
            stop_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Ask the service to stop after its current tick
    pub async fn shutdown(&self) -> ServiceResult<()> {
        self.stop_tx
            .send(())
            .await
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))
    }

    /// Wait until `on_start` has finished; fails if it returned an error
    pub async fn started(&self) -> ServiceResult<()> {
        match self.wait_until(|s| s != ServiceState::Starting).await? {
            ServiceState::Failed => Err(ServiceError::Failed(format!("service '{}' failed to start", self.service_id))),
            _ => Ok(()),
        }
    }

    /// Wait until the service has stopped or failed
    pub async fn stopped(&self) -> ServiceState {
        self.wait_until(|s| s.is_terminal())
            .await
            .unwrap_or(ServiceState::Failed)
    }

    async fn wait_until(&self, done: impl Fn(ServiceState) -> bool) -> ServiceResult<ServiceState> {
        let mut state_rx = self.state_rx.clone();
        state_rx
            .wait_for(|s| done(*s))
            .await
            .map(|s| *s)
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}
