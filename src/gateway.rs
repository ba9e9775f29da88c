//! Gateway facade
//!
//! [`ModbusGateway`] ties the master, the shared registry, the poller and the
//! persistence backend together and exposes the operations a configuration
//! front end (HTTP handlers, a CLI) calls. Errors carry enough structure for
//! the caller to map them to its own status codes via [`ModbusError::kind`]
//! and the variant.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::master::ModbusMaster;
use crate::poller::Poller;
use crate::protocol::{ModbusException, SlaveId};
use crate::registry::{
    Device, DeviceHealth, DeviceRegistry, Register, RegisterKind, SharedRegistry,
};
use crate::storage::{clear_registry, load_registry, save_registry, KeyValueStore};
use crate::transport::{AutoDirection, SerialLine, TransceiverControl, TransportStats};

/// Health summary of one device
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceSummary {
    pub device_id: SlaveId,
    pub name: String,
    pub enabled: bool,
    pub health: DeviceHealth,
}

/// Point-in-time status of the whole gateway
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GatewayStatus {
    pub initialized: bool,
    pub polling: bool,
    pub last_exception: Option<u8>,
    pub last_exception_text: Option<&'static str>,
    pub transport: TransportStats,
    pub devices: Vec<DeviceSummary>,
}

pub struct ModbusGateway<L, D = AutoDirection> {
    master: Arc<ModbusMaster<L, D>>,
    registry: SharedRegistry,
    poller: Poller<L, D>,
    store: Arc<dyn KeyValueStore>,
}

impl<L, D> ModbusGateway<L, D>
where
    L: SerialLine + 'static,
    D: TransceiverControl + 'static,
{
    pub fn new(config: GatewayConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let master = Arc::new(ModbusMaster::new(config.master));
        let registry = DeviceRegistry::shared(config.registry);
        let poller = Poller::new(Arc::clone(&master), Arc::clone(&registry), config.poller);
        Self {
            master,
            registry,
            poller,
            store,
        }
    }

    /// Hand the serial line to the master
    pub async fn init(&self, line: L, direction: D) -> ModbusResult<()> {
        self.master.init(line, direction).await
    }

    pub fn master(&self) -> &Arc<ModbusMaster<L, D>> {
        &self.master
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Device and register configuration
    // ------------------------------------------------------------------

    pub async fn list_devices(&self) -> Vec<Device> {
        self.registry.lock().await.list_devices()
    }

    pub async fn get_device(&self, device_id: SlaveId) -> ModbusResult<Device> {
        self.registry.lock().await.get_device(device_id)
    }

    pub async fn add_device(&self, device: Device) -> ModbusResult<()> {
        self.registry.lock().await.add_device(device)
    }

    pub async fn update_device(&self, device_id: SlaveId, device: Device) -> ModbusResult<()> {
        self.registry.lock().await.update_device(device_id, device)
    }

    pub async fn remove_device(&self, device_id: SlaveId) -> ModbusResult<Device> {
        self.registry.lock().await.remove_device(device_id)
    }

    pub async fn get_register(&self, device_id: SlaveId, address: u16) -> ModbusResult<Register> {
        self.registry.lock().await.get_register(device_id, address)
    }

    pub async fn add_register(&self, device_id: SlaveId, register: Register) -> ModbusResult<()> {
        self.registry.lock().await.add_register(device_id, register)
    }

    pub async fn update_register(
        &self,
        device_id: SlaveId,
        address: u16,
        register: Register,
    ) -> ModbusResult<()> {
        self.registry
            .lock()
            .await
            .update_register(device_id, address, register)
    }

    pub async fn remove_register(
        &self,
        device_id: SlaveId,
        address: u16,
    ) -> ModbusResult<Register> {
        self.registry.lock().await.remove_register(device_id, address)
    }

    pub async fn scaled_value(&self, device_id: SlaveId, address: u16) -> f32 {
        self.registry.lock().await.scaled_value(device_id, address)
    }

    // ------------------------------------------------------------------
    // Bus access
    // ------------------------------------------------------------------

    /// Write a configured register and store the written value.
    ///
    /// Coils are switched on for any non-zero value.
    pub async fn write_register(
        &self,
        device_id: SlaveId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let register = self.get_register(device_id, address).await?;
        if !register.writable || !register.kind.is_writable_table() {
            return Err(ModbusError::invalid_argument(format!(
                "register 0x{:04X} on device {} is not writable",
                address, device_id
            )));
        }

        let (result, stored) = match register.kind {
            RegisterKind::Coil => (
                self.master
                    .write_single_coil(device_id, address, value != 0)
                    .await,
                (value != 0) as u16,
            ),
            _ => (
                self.master
                    .write_single_register(device_id, address, value)
                    .await,
                value,
            ),
        };

        let mut registry = self.registry.lock().await;
        match result {
            Ok(()) => {
                info!(
                    "Device {} register 0x{:04X} written: {}",
                    device_id, address, stored
                );
                registry.record_write_success(device_id, address, stored);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Write to device {} register 0x{:04X} failed: {}",
                    device_id, address, e
                );
                registry.record_write_failure(device_id, &e);
                Err(e)
            }
        }
    }

    /// Read a configured register now, outside the polling schedule.
    pub async fn read_register(&self, device_id: SlaveId, address: u16) -> ModbusResult<u16> {
        let register = self.get_register(device_id, address).await?;
        let result = self
            .master
            .read_point(device_id, register.kind, address)
            .await;

        let mut registry = self.registry.lock().await;
        match result {
            Ok(raw) => {
                registry.record_success(device_id, address, raw);
                Ok(raw)
            }
            Err(e) => {
                registry.record_failure(device_id, &e);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    pub async fn start_polling(&self) -> ModbusResult<bool> {
        if !self.master.is_initialized().await {
            return Err(ModbusError::NotInitialized);
        }
        Ok(self.poller.start().await)
    }

    pub async fn stop_polling(&self) -> bool {
        self.poller.stop().await
    }

    pub async fn is_polling(&self) -> bool {
        self.poller.is_running().await
    }

    /// One immediate pass over all enabled devices
    pub async fn poll_once(&self) -> usize {
        self.poller.poll_once().await
    }

    pub async fn status(&self) -> GatewayStatus {
        let last_exception = self.master.last_exception();
        let devices = self
            .registry
            .lock()
            .await
            .list_devices()
            .into_iter()
            .map(|d| DeviceSummary {
                device_id: d.device_id,
                name: d.name,
                enabled: d.enabled,
                health: d.health,
            })
            .collect();
        GatewayStatus {
            initialized: self.master.is_initialized().await,
            polling: self.poller.is_running().await,
            last_exception,
            last_exception_text: last_exception.map(ModbusException::description),
            transport: self.master.stats().await,
            devices,
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub async fn save(&self) -> ModbusResult<()> {
        let registry = self.registry.lock().await;
        save_registry(&registry, self.store.as_ref())
    }

    pub async fn load(&self) -> ModbusResult<usize> {
        let mut registry = self.registry.lock().await;
        load_registry(&mut registry, self.store.as_ref())
    }

    /// Drop every device and erase the stored table
    pub async fn clear_all(&self) -> ModbusResult<()> {
        let mut registry = self.registry.lock().await;
        clear_registry(&mut registry, self.store.as_ref())
    }

    /// Stop polling, then release the line
    pub async fn shutdown(&self) -> ModbusResult<()> {
        self.poller.stop().await;
        self.master.shutdown().await
    }
}
