//! Background polling of registered devices
//!
//! One task walks the registry forever: for every enabled device it reads each
//! register once, updates the live value and device health, then sleeps the
//! device's poll interval. The registry lock is only held to snapshot the plan
//! and to record results, never across a bus transaction.
//!
//! Cancellation is cooperative. `stop` signals the task and waits a bounded
//! grace period; a transaction already on the wire always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::master::ModbusMaster;
use crate::protocol::SlaveId;
use crate::registry::{Device, RegisterKind, SharedRegistry};
use crate::transport::{SerialLine, TransceiverControl};

/// Registers of one device to read in a cycle
#[derive(Debug, Clone)]
struct DevicePlan {
    device_id: SlaveId,
    poll_interval: Duration,
    registers: Vec<(u16, RegisterKind)>,
}

impl DevicePlan {
    fn from_device(device: &Device) -> Self {
        Self {
            device_id: device.device_id,
            poll_interval: device.poll_interval,
            registers: device
                .registers
                .iter()
                .map(|r| (r.address, r.kind))
                .collect(),
        }
    }
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the polling task
pub struct Poller<L, D> {
    master: Arc<ModbusMaster<L, D>>,
    registry: SharedRegistry,
    config: PollerConfig,
    task: Mutex<Option<PollTask>>,
}

impl<L, D> Poller<L, D>
where
    L: SerialLine + 'static,
    D: TransceiverControl + 'static,
{
    pub fn new(
        master: Arc<ModbusMaster<L, D>>,
        registry: SharedRegistry,
        config: PollerConfig,
    ) -> Self {
        Self {
            master,
            registry,
            config,
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling task. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Polling already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let worker = PollWorker {
            master: Arc::clone(&self.master),
            registry: Arc::clone(&self.registry),
            config: self.config,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(async move { worker.run().await });
        *task = Some(PollTask { cancel, handle });
        info!("Polling started");
        true
    }

    /// Signal the task to stop and wait up to the configured grace period.
    /// Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(PollTask { cancel, handle }) = self.task.lock().await.take() else {
            debug!("Polling not running");
            return false;
        };
        cancel.cancel();
        match tokio::time::timeout(self.config.stop_grace, handle).await {
            Ok(Ok(())) => info!("Polling task stopped gracefully"),
            Ok(Err(e)) => warn!("Polling task ended abnormally: {}", e),
            Err(_) => warn!(
                "Polling task still busy after {}ms, detaching",
                self.config.stop_grace.as_millis()
            ),
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Run one pass over every enabled device right now, without interval
    /// sleeps. Returns the number of registers read successfully.
    pub async fn poll_once(&self) -> usize {
        let worker = PollWorker {
            master: Arc::clone(&self.master),
            registry: Arc::clone(&self.registry),
            config: self.config,
            cancel: CancellationToken::new(),
        };
        let mut ok = 0;
        for plan in worker.snapshot().await {
            ok += worker.poll_device(&plan).await;
        }
        ok
    }
}

struct PollWorker<L, D> {
    master: Arc<ModbusMaster<L, D>>,
    registry: SharedRegistry,
    config: PollerConfig,
    cancel: CancellationToken,
}

impl<L: SerialLine, D: TransceiverControl> PollWorker<L, D> {
    async fn snapshot(&self) -> Vec<DevicePlan> {
        let registry = self.registry.lock().await;
        registry
            .list_devices()
            .iter()
            .filter(|d| d.enabled)
            .map(DevicePlan::from_device)
            .collect()
    }

    /// Sleep unless cancelled first; false means cancelled
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn run(self) {
        info!("Polling task running");
        'outer: while !self.cancel.is_cancelled() {
            let plans = self.snapshot().await;
            let mut polled_any = false;

            for plan in &plans {
                if self.cancel.is_cancelled() {
                    break 'outer;
                }
                if plan.registers.is_empty() {
                    continue;
                }
                polled_any = true;
                self.poll_device(plan).await;
                if !self.pause(plan.poll_interval).await {
                    break 'outer;
                }
            }

            if !polled_any && !self.pause(self.config.idle_interval).await {
                break;
            }
        }
        info!("Polling task exited");
    }

    /// Read every register of one device once; returns successful reads.
    async fn poll_device(&self, plan: &DevicePlan) -> usize {
        let mut ok = 0;
        for (i, &(address, kind)) in plan.registers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            if i > 0 && !self.pause(self.config.register_gap).await {
                break;
            }

            let result = self.master.read_point(plan.device_id, kind, address).await;
            let mut registry = self.registry.lock().await;
            match result {
                Ok(raw) => {
                    debug!(
                        "Device {} register 0x{:04X} = {}",
                        plan.device_id, address, raw
                    );
                    registry.record_success(plan.device_id, address, raw);
                    ok += 1;
                }
                Err(e) => {
                    warn!(
                        "Poll of device {} register 0x{:04X} failed: {}",
                        plan.device_id, address, e
                    );
                    registry.record_failure(plan.device_id, &e);
                }
            }
        }
        ok
    }
}
