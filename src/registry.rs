//! Device and register registry
//!
//! A bounded table of configured devices, each with a bounded list of
//! registers. Callers always get clones back; live values and health are
//! written only by the polling task and the write path, through crate-private
//! mutators.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::RegistryLimits;
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ResultKind, SlaveId};

/// Registry shared between the poller and request handlers
pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

/// Data table a register lives in; the value matches the read function code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegisterKind {
    Coil = 1,
    DiscreteInput = 2,
    HoldingRegister = 3,
    InputRegister = 4,
}

impl RegisterKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Coil),
            2 => Some(Self::DiscreteInput),
            3 => Some(Self::HoldingRegister),
            4 => Some(Self::InputRegister),
            _ => None,
        }
    }

    pub fn read_function(self) -> ModbusFunction {
        match self {
            Self::Coil => ModbusFunction::ReadCoils,
            Self::DiscreteInput => ModbusFunction::ReadDiscreteInputs,
            Self::HoldingRegister => ModbusFunction::ReadHoldingRegisters,
            Self::InputRegister => ModbusFunction::ReadInputRegisters,
        }
    }

    /// Only coils and holding registers accept writes on the wire
    pub fn is_writable_table(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }
}

/// One addressable data point of a device
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Register {
    pub address: u16,
    pub kind: RegisterKind,
    pub name: String,
    /// Engineering unit label
    pub unit: String,
    pub scale: f32,
    pub offset: f32,
    pub writable: bool,
    pub description: String,
    /// Last raw value read or written
    pub last_raw_value: u16,
    pub last_update: Option<DateTime<Utc>>,
}

impl Register {
    pub fn new<S: Into<String>>(address: u16, kind: RegisterKind, name: S) -> Self {
        Self {
            address,
            kind,
            name: name.into(),
            unit: String::new(),
            scale: 1.0,
            offset: 0.0,
            writable: false,
            description: String::new(),
            last_raw_value: 0,
            last_update: None,
        }
    }

    pub fn with_unit<S: Into<String>>(mut self, unit: S) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_scaling(mut self, scale: f32, offset: f32) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// `raw * scale + offset`
    pub fn scaled_value(&self) -> f32 {
        self.last_raw_value as f32 * self.scale + self.offset
    }

    fn reset_live(&mut self) {
        self.last_raw_value = 0;
        self.last_update = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

/// Live health of a device, maintained by polling and writes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceHealth {
    pub status: DeviceStatus,
    /// Exception code of the last failed transaction, 0 when none
    pub last_error_code: u8,
    pub last_result: Option<ResultKind>,
    pub last_seen: Option<DateTime<Utc>>,
    pub poll_count: u32,
    pub error_count: u32,
}

/// A field device on the bus and its register map
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    pub device_id: SlaveId,
    pub name: String,
    pub description: String,
    pub poll_interval: Duration,
    pub enabled: bool,
    pub baudrate: u32,
    pub registers: Vec<Register>,
    pub health: DeviceHealth,
}

impl Device {
    pub fn new<S: Into<String>>(device_id: SlaveId, name: S) -> Self {
        Self {
            device_id,
            name: name.into(),
            description: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            enabled: true,
            baudrate: DEFAULT_BAUD_RATE,
            registers: Vec::new(),
            health: DeviceHealth::default(),
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }

    pub fn with_register(mut self, register: Register) -> Self {
        self.registers.push(register);
        self
    }

    pub fn register(&self, address: u16) -> Option<&Register> {
        self.registers.iter().find(|r| r.address == address)
    }

    fn register_mut(&mut self, address: u16) -> Option<&mut Register> {
        self.registers.iter_mut().find(|r| r.address == address)
    }

    /// Clear health and every register's live value
    pub(crate) fn reset_live(&mut self) {
        self.health = DeviceHealth::default();
        self.registers.iter_mut().for_each(Register::reset_live);
    }
}

fn check_device_id(device_id: SlaveId) -> ModbusResult<()> {
    if !(MIN_UNIT_ID..=MAX_UNIT_ID).contains(&device_id) {
        return Err(ModbusError::invalid_argument(format!(
            "device id {} outside {}..={}",
            device_id, MIN_UNIT_ID, MAX_UNIT_ID
        )));
    }
    Ok(())
}

fn check_unique_addresses(registers: &[Register]) -> ModbusResult<()> {
    for (i, register) in registers.iter().enumerate() {
        if registers[..i].iter().any(|r| r.address == register.address) {
            return Err(ModbusError::already_exists(format!(
                "register 0x{:04X}",
                register.address
            )));
        }
    }
    Ok(())
}

/// Bounded device table
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    limits: RegistryLimits,
}

impl DeviceRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            devices: Vec::with_capacity(limits.max_devices),
            limits,
        }
    }

    /// Wrap a registry for sharing with the poller
    pub fn shared(limits: RegistryLimits) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(limits)))
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_exists(&self, device_id: SlaveId) -> bool {
        self.index_of(device_id).is_some()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.clone()
    }

    pub fn get_device(&self, device_id: SlaveId) -> ModbusResult<Device> {
        self.device(device_id).cloned()
    }

    pub fn get_register(&self, device_id: SlaveId, address: u16) -> ModbusResult<Register> {
        self.device(device_id)?
            .register(address)
            .cloned()
            .ok_or_else(|| register_not_found(device_id, address))
    }

    fn index_of(&self, device_id: SlaveId) -> Option<usize> {
        self.devices.iter().position(|d| d.device_id == device_id)
    }

    fn device(&self, device_id: SlaveId) -> ModbusResult<&Device> {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| device_not_found(device_id))
    }

    fn device_mut(&mut self, device_id: SlaveId) -> ModbusResult<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| device_not_found(device_id))
    }

    fn check_register_count(&self, count: usize) -> ModbusResult<()> {
        if count > self.limits.max_registers_per_device {
            return Err(ModbusError::invalid_argument(format!(
                "{} registers exceed the per-device limit of {}",
                count, self.limits.max_registers_per_device
            )));
        }
        Ok(())
    }

    /// Add a device; its health and live register values start fresh.
    pub fn add_device(&mut self, mut device: Device) -> ModbusResult<()> {
        check_device_id(device.device_id)?;
        self.check_register_count(device.registers.len())?;
        check_unique_addresses(&device.registers)?;
        if self.devices.len() >= self.limits.max_devices {
            return Err(ModbusError::exhausted(format!(
                "device table full ({} devices)",
                self.limits.max_devices
            )));
        }
        if self.device_exists(device.device_id) {
            return Err(ModbusError::already_exists(format!(
                "device {}",
                device.device_id
            )));
        }
        device.reset_live();
        info!(
            "Device {} ({}) added with {} registers",
            device.device_id,
            device.name,
            device.registers.len()
        );
        self.devices.push(device);
        Ok(())
    }

    /// Replace a device's configuration.
    ///
    /// Health is kept, and registers whose address survives keep their live
    /// value.
    pub fn update_device(&mut self, device_id: SlaveId, mut device: Device) -> ModbusResult<()> {
        check_device_id(device.device_id)?;
        self.check_register_count(device.registers.len())?;
        check_unique_addresses(&device.registers)?;
        let index = self
            .index_of(device_id)
            .ok_or_else(|| device_not_found(device_id))?;
        if device.device_id != device_id && self.device_exists(device.device_id) {
            return Err(ModbusError::already_exists(format!(
                "device {}",
                device.device_id
            )));
        }

        let existing = &self.devices[index];
        device.health = existing.health.clone();
        for register in device.registers.iter_mut() {
            match existing.register(register.address) {
                Some(old) => {
                    register.last_raw_value = old.last_raw_value;
                    register.last_update = old.last_update;
                }
                None => register.reset_live(),
            }
        }

        info!("Device {} updated", device_id);
        self.devices[index] = device;
        Ok(())
    }

    pub fn remove_device(&mut self, device_id: SlaveId) -> ModbusResult<Device> {
        let index = self
            .index_of(device_id)
            .ok_or_else(|| device_not_found(device_id))?;
        info!("Device {} removed", device_id);
        Ok(self.devices.remove(index))
    }

    pub fn add_register(&mut self, device_id: SlaveId, mut register: Register) -> ModbusResult<()> {
        let max = self.limits.max_registers_per_device;
        let device = self.device_mut(device_id)?;
        if device.registers.len() >= max {
            return Err(ModbusError::exhausted(format!(
                "device {} register table full ({} registers)",
                device_id, max
            )));
        }
        if device.register(register.address).is_some() {
            return Err(ModbusError::already_exists(format!(
                "register 0x{:04X} on device {}",
                register.address, device_id
            )));
        }
        register.reset_live();
        debug!(
            "Register 0x{:04X} ({}) added to device {}",
            register.address, register.name, device_id
        );
        device.registers.push(register);
        Ok(())
    }

    /// Replace a register's static fields, keeping its live value.
    pub fn update_register(
        &mut self,
        device_id: SlaveId,
        address: u16,
        mut register: Register,
    ) -> ModbusResult<()> {
        let device = self.device_mut(device_id)?;
        let index = device
            .registers
            .iter()
            .position(|r| r.address == address)
            .ok_or_else(|| register_not_found(device_id, address))?;
        if register.address != address && device.register(register.address).is_some() {
            return Err(ModbusError::already_exists(format!(
                "register 0x{:04X} on device {}",
                register.address, device_id
            )));
        }
        let existing = &device.registers[index];
        register.last_raw_value = existing.last_raw_value;
        register.last_update = existing.last_update;
        device.registers[index] = register;
        Ok(())
    }

    pub fn remove_register(&mut self, device_id: SlaveId, address: u16) -> ModbusResult<Register> {
        let device = self.device_mut(device_id)?;
        let index = device
            .registers
            .iter()
            .position(|r| r.address == address)
            .ok_or_else(|| register_not_found(device_id, address))?;
        Ok(device.registers.remove(index))
    }

    /// Store a freshly read or written raw value, stamped now.
    pub fn update_register_value(
        &mut self,
        device_id: SlaveId,
        address: u16,
        raw: u16,
    ) -> ModbusResult<()> {
        let register = self
            .device_mut(device_id)?
            .register_mut(address)
            .ok_or_else(|| register_not_found(device_id, address))?;
        register.last_raw_value = raw;
        register.last_update = Some(Utc::now());
        Ok(())
    }

    /// Scaled value of a register, 0.0 when device or register is unknown
    pub fn scaled_value(&self, device_id: SlaveId, address: u16) -> f32 {
        self.device(device_id)
            .ok()
            .and_then(|d| d.register(address))
            .map(Register::scaled_value)
            .unwrap_or(0.0)
    }

    /// Raw value of a register, 0 when device or register is unknown
    pub fn raw_value(&self, device_id: SlaveId, address: u16) -> u16 {
        self.device(device_id)
            .ok()
            .and_then(|d| d.register(address))
            .map(|r| r.last_raw_value)
            .unwrap_or(0)
    }

    /// Set a device's status, e.g. to mark it Offline from outside polling
    pub fn set_device_status(
        &mut self,
        device_id: SlaveId,
        status: DeviceStatus,
    ) -> ModbusResult<()> {
        self.device_mut(device_id)?.health.status = status;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        info!("Device registry cleared");
    }

    pub(crate) fn record_success(&mut self, device_id: SlaveId, address: u16, raw: u16) {
        if let Ok(device) = self.device_mut(device_id) {
            let now = Utc::now();
            device.health.poll_count = device.health.poll_count.wrapping_add(1);
            device.health.status = DeviceStatus::Online;
            device.health.last_result = Some(ResultKind::Ok);
            device.health.last_seen = Some(now);
            if let Some(register) = device.register_mut(address) {
                register.last_raw_value = raw;
                register.last_update = Some(now);
            }
        }
    }

    pub(crate) fn record_failure(&mut self, device_id: SlaveId, error: &ModbusError) {
        if let Ok(device) = self.device_mut(device_id) {
            device.health.poll_count = device.health.poll_count.wrapping_add(1);
            device.health.error_count = device.health.error_count.wrapping_add(1);
            device.health.status = DeviceStatus::Error;
            device.health.last_result = Some(error.kind());
            if let Some(code) = error.exception_code() {
                device.health.last_error_code = code;
            }
        }
    }

    /// A confirmed write counts as contact but not as a poll
    pub(crate) fn record_write_success(&mut self, device_id: SlaveId, address: u16, raw: u16) {
        if let Ok(device) = self.device_mut(device_id) {
            let now = Utc::now();
            device.health.status = DeviceStatus::Online;
            device.health.last_result = Some(ResultKind::Ok);
            device.health.last_seen = Some(now);
            if let Some(register) = device.register_mut(address) {
                register.last_raw_value = raw;
                register.last_update = Some(now);
            }
        }
    }

    pub(crate) fn record_write_failure(&mut self, device_id: SlaveId, error: &ModbusError) {
        if let Ok(device) = self.device_mut(device_id) {
            device.health.error_count = device.health.error_count.wrapping_add(1);
            device.health.status = DeviceStatus::Error;
            device.health.last_result = Some(error.kind());
            if let Some(code) = error.exception_code() {
                device.health.last_error_code = code;
            }
        }
    }

    /// Insert a device read back from storage, truncating to the limits
    pub(crate) fn push_loaded(&mut self, mut device: Device) -> ModbusResult<()> {
        check_device_id(device.device_id)?;
        if self.device_exists(device.device_id) {
            return Err(ModbusError::already_exists(format!("device {}", device.device_id)));
        }
        if self.devices.len() >= self.limits.max_devices {
            return Err(ModbusError::exhausted("device table full"));
        }
        device.registers.truncate(self.limits.max_registers_per_device);
        device.reset_live();
        self.devices.push(device);
        Ok(())
    }
}

fn device_not_found(device_id: SlaveId) -> ModbusError {
    ModbusError::not_found(format!("device {}", device_id))
}

fn register_not_found(device_id: SlaveId, address: u16) -> ModbusError {
    ModbusError::not_found(format!("register 0x{:04X} on device {}", address, device_id))
}
