//! Registry persistence on a namespaced key-value store
//!
//! The device table is flattened into scalar keys inside the
//! [`STORAGE_NAMESPACE`] namespace:
//!
//! ```text
//! device_count
//! device_<i>_id | _name | _desc | _poll_interval | _enabled | _baudrate | _reg_count
//! device_<i>_reg_<j>_addr | _type | _name | _unit | _scale | _offset | _writable | _desc
//! ```
//!
//! Floats are stored as their IEEE-754 bit pattern in a `u32`. Loading caps
//! counts at the registry limits, skips corrupt entries and resets all live
//! values and health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::constants::{DEFAULT_BAUD_RATE, DEFAULT_POLL_INTERVAL, STORAGE_NAMESPACE};
use crate::error::{ModbusError, ModbusResult};
use crate::registry::{Device, DeviceRegistry, Register, RegisterKind};

/// Handle to one namespace of a key-value store.
///
/// Writes become durable on [`commit`](Namespace::commit).
pub trait Namespace: Send {
    fn get_u8(&self, key: &str) -> ModbusResult<Option<u8>>;
    fn get_u16(&self, key: &str) -> ModbusResult<Option<u16>>;
    fn get_u32(&self, key: &str) -> ModbusResult<Option<u32>>;
    fn get_str(&self, key: &str) -> ModbusResult<Option<String>>;

    fn set_u8(&mut self, key: &str, value: u8) -> ModbusResult<()>;
    fn set_u16(&mut self, key: &str, value: u16) -> ModbusResult<()>;
    fn set_u32(&mut self, key: &str, value: u32) -> ModbusResult<()>;
    fn set_str(&mut self, key: &str, value: &str) -> ModbusResult<()>;

    fn commit(&mut self) -> ModbusResult<()>;

    /// Remove every key in the namespace
    fn erase_all(&mut self) -> ModbusResult<()>;

    /// Release the handle; uncommitted writes are discarded
    fn close(self: Box<Self>) -> ModbusResult<()> {
        Ok(())
    }
}

/// Namespaced key-value storage backend
pub trait KeyValueStore: Send + Sync {
    fn open(&self, namespace: &str) -> ModbusResult<Box<dyn Namespace + '_>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Str(String),
}

type Tables = HashMap<String, HashMap<String, StoredValue>>;

/// In-memory store; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed keys in a namespace
    pub fn key_count(&self, namespace: &str) -> usize {
        self.tables
            .lock()
            .map(|t| t.get(namespace).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

impl KeyValueStore for MemoryStore {
    fn open(&self, namespace: &str) -> ModbusResult<Box<dyn Namespace + '_>> {
        Ok(Box::new(MemoryNamespace {
            tables: Arc::clone(&self.tables),
            name: namespace.to_string(),
            staged: HashMap::new(),
            erased: false,
        }))
    }
}

struct MemoryNamespace {
    tables: Arc<Mutex<Tables>>,
    name: String,
    staged: HashMap<String, StoredValue>,
    erased: bool,
}

impl MemoryNamespace {
    fn lookup(&self, key: &str) -> ModbusResult<Option<StoredValue>> {
        if let Some(value) = self.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        if self.erased {
            return Ok(None);
        }
        let tables = self
            .tables
            .lock()
            .map_err(|_| ModbusError::storage("memory store poisoned"))?;
        Ok(tables.get(&self.name).and_then(|t| t.get(key)).cloned())
    }
}

fn type_mismatch(key: &str, expected: &str) -> ModbusError {
    ModbusError::storage(format!("key {} is not a {}", key, expected))
}

impl Namespace for MemoryNamespace {
    fn get_u8(&self, key: &str) -> ModbusResult<Option<u8>> {
        match self.lookup(key)? {
            None => Ok(None),
            Some(StoredValue::U8(v)) => Ok(Some(v)),
            Some(_) => Err(type_mismatch(key, "u8")),
        }
    }

    fn get_u16(&self, key: &str) -> ModbusResult<Option<u16>> {
        match self.lookup(key)? {
            None => Ok(None),
            Some(StoredValue::U16(v)) => Ok(Some(v)),
            Some(_) => Err(type_mismatch(key, "u16")),
        }
    }

    fn get_u32(&self, key: &str) -> ModbusResult<Option<u32>> {
        match self.lookup(key)? {
            None => Ok(None),
            Some(StoredValue::U32(v)) => Ok(Some(v)),
            Some(_) => Err(type_mismatch(key, "u32")),
        }
    }

    fn get_str(&self, key: &str) -> ModbusResult<Option<String>> {
        match self.lookup(key)? {
            None => Ok(None),
            Some(StoredValue::Str(v)) => Ok(Some(v)),
            Some(_) => Err(type_mismatch(key, "string")),
        }
    }

    fn set_u8(&mut self, key: &str, value: u8) -> ModbusResult<()> {
        self.staged.insert(key.to_string(), StoredValue::U8(value));
        Ok(())
    }

    fn set_u16(&mut self, key: &str, value: u16) -> ModbusResult<()> {
        self.staged.insert(key.to_string(), StoredValue::U16(value));
        Ok(())
    }

    fn set_u32(&mut self, key: &str, value: u32) -> ModbusResult<()> {
        self.staged.insert(key.to_string(), StoredValue::U32(value));
        Ok(())
    }

    fn set_str(&mut self, key: &str, value: &str) -> ModbusResult<()> {
        self.staged
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> ModbusResult<()> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| ModbusError::storage("memory store poisoned"))?;
        let table = tables.entry(self.name.clone()).or_default();
        if self.erased {
            table.clear();
            self.erased = false;
        }
        table.extend(self.staged.drain());
        Ok(())
    }

    fn erase_all(&mut self) -> ModbusResult<()> {
        self.staged.clear();
        self.erased = true;
        Ok(())
    }
}

fn device_key(index: usize, field: &str) -> String {
    format!("device_{}_{}", index, field)
}

fn register_key(device: usize, register: usize, field: &str) -> String {
    format!("device_{}_reg_{}_{}", device, register, field)
}

/// Write the whole device table and commit.
pub fn save_registry(registry: &DeviceRegistry, store: &dyn KeyValueStore) -> ModbusResult<()> {
    let mut ns = store.open(STORAGE_NAMESPACE)?;
    ns.erase_all()?;

    let devices = registry.list_devices();
    ns.set_u8("device_count", devices.len() as u8)?;
    for (i, device) in devices.iter().enumerate() {
        ns.set_u8(&device_key(i, "id"), device.device_id)?;
        ns.set_str(&device_key(i, "name"), &device.name)?;
        ns.set_str(&device_key(i, "desc"), &device.description)?;
        ns.set_u32(
            &device_key(i, "poll_interval"),
            device.poll_interval.as_millis().min(u32::MAX as u128) as u32,
        )?;
        ns.set_u8(&device_key(i, "enabled"), device.enabled as u8)?;
        ns.set_u32(&device_key(i, "baudrate"), device.baudrate)?;
        ns.set_u8(&device_key(i, "reg_count"), device.registers.len() as u8)?;

        for (j, register) in device.registers.iter().enumerate() {
            ns.set_u16(&register_key(i, j, "addr"), register.address)?;
            ns.set_u8(&register_key(i, j, "type"), register.kind.to_u8())?;
            ns.set_str(&register_key(i, j, "name"), &register.name)?;
            ns.set_str(&register_key(i, j, "unit"), &register.unit)?;
            ns.set_u32(&register_key(i, j, "scale"), register.scale.to_bits())?;
            ns.set_u32(&register_key(i, j, "offset"), register.offset.to_bits())?;
            ns.set_u8(&register_key(i, j, "writable"), register.writable as u8)?;
            ns.set_str(&register_key(i, j, "desc"), &register.description)?;
        }
    }

    ns.commit()?;
    ns.close()?;
    info!("Saved {} devices to storage", devices.len());
    Ok(())
}

/// Replace the registry contents with the stored table.
///
/// Returns the number of devices loaded. A namespace without a device count
/// yields an empty registry. Unreadable fields fall back to their defaults;
/// a device without a readable id or a register without a readable address
/// is skipped.
pub fn load_registry(
    registry: &mut DeviceRegistry,
    store: &dyn KeyValueStore,
) -> ModbusResult<usize> {
    let ns = store.open(STORAGE_NAMESPACE)?;
    let fields = Fields(ns.as_ref());
    let limits = registry.limits();
    let mut loaded = DeviceRegistry::new(limits);

    let stored_count = fields.u8("device_count").unwrap_or(0) as usize;
    if stored_count > limits.max_devices {
        warn!(
            "Stored device count {} exceeds limit {}, truncating",
            stored_count, limits.max_devices
        );
    }

    for i in 0..stored_count.min(limits.max_devices) {
        let Some(device) = load_device(&fields, i, limits.max_registers_per_device) else {
            continue;
        };
        let device_id = device.device_id;
        if let Err(e) = loaded.push_loaded(device) {
            warn!("Skipping stored device {}: {}", device_id, e);
        }
    }

    ns.close()?;
    *registry = loaded;
    info!("Loaded {} devices from storage", registry.device_count());
    Ok(registry.device_count())
}

/// Typed reads that treat an unreadable key as absent
struct Fields<'a>(&'a dyn Namespace);

impl Fields<'_> {
    fn read<T>(&self, key: &str, result: ModbusResult<Option<T>>) -> Option<T> {
        result.unwrap_or_else(|e| {
            warn!("Ignoring stored key {}: {}", key, e);
            None
        })
    }

    fn u8(&self, key: &str) -> Option<u8> {
        self.read(key, self.0.get_u8(key))
    }

    fn u16(&self, key: &str) -> Option<u16> {
        self.read(key, self.0.get_u16(key))
    }

    fn u32(&self, key: &str) -> Option<u32> {
        self.read(key, self.0.get_u32(key))
    }

    fn string(&self, key: &str) -> String {
        self.read(key, self.0.get_str(key)).unwrap_or_default()
    }
}

fn load_device(fields: &Fields<'_>, i: usize, max_registers: usize) -> Option<Device> {
    let Some(device_id) = fields.u8(&device_key(i, "id")) else {
        warn!("Stored device {} has no id, skipping", i);
        return None;
    };

    let mut device = Device::new(device_id, fields.string(&device_key(i, "name")))
        .with_description(fields.string(&device_key(i, "desc")))
        .with_poll_interval(
            fields
                .u32(&device_key(i, "poll_interval"))
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        )
        .with_enabled(fields.u8(&device_key(i, "enabled")).unwrap_or(1) != 0)
        .with_baudrate(
            fields
                .u32(&device_key(i, "baudrate"))
                .unwrap_or(DEFAULT_BAUD_RATE),
        );

    let register_count = fields.u8(&device_key(i, "reg_count")).unwrap_or(0) as usize;
    for j in 0..register_count.min(max_registers) {
        let Some(address) = fields.u16(&register_key(i, j, "addr")) else {
            warn!("Device {} register {} has no address, skipping", device_id, j);
            continue;
        };
        let raw_kind = fields.u8(&register_key(i, j, "type")).unwrap_or(0);
        let Some(kind) = RegisterKind::from_u8(raw_kind) else {
            warn!(
                "Device {} register 0x{:04X} has unknown type {}, skipping",
                device_id, address, raw_kind
            );
            continue;
        };
        if device.register(address).is_some() {
            warn!(
                "Device {} register 0x{:04X} stored twice, skipping",
                device_id, address
            );
            continue;
        }

        let scale = fields
            .u32(&register_key(i, j, "scale"))
            .map(f32::from_bits)
            .unwrap_or(1.0);
        let offset = fields
            .u32(&register_key(i, j, "offset"))
            .map(f32::from_bits)
            .unwrap_or(0.0);
        let register = Register::new(address, kind, fields.string(&register_key(i, j, "name")))
            .with_unit(fields.string(&register_key(i, j, "unit")))
            .with_scaling(scale, offset)
            .with_writable(fields.u8(&register_key(i, j, "writable")).unwrap_or(0) != 0)
            .with_description(fields.string(&register_key(i, j, "desc")));
        device.registers.push(register);
    }

    Some(device)
}

/// Empty the registry and erase the stored table.
pub fn clear_registry(
    registry: &mut DeviceRegistry,
    store: &dyn KeyValueStore,
) -> ModbusResult<()> {
    let mut ns = store.open(STORAGE_NAMESPACE)?;
    ns.erase_all()?;
    ns.commit()?;
    ns.close()?;
    registry.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryLimits;
    use crate::registry::DeviceStatus;

    fn sample_registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(RegistryLimits::default());
        registry
            .add_device(
                Device::new(5, "inverter")
                    .with_description("roof array")
                    .with_poll_interval(Duration::from_millis(2500))
                    .with_baudrate(19_200)
                    .with_register(
                        Register::new(0x0100, RegisterKind::InputRegister, "power")
                            .with_unit("kW")
                            .with_scaling(0.01, -1.5),
                    )
                    .with_register(
                        Register::new(0x0002, RegisterKind::Coil, "enable")
                            .with_writable(true)
                            .with_description("output relay"),
                    ),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_round_trip_resets_health() {
        let store = MemoryStore::new();
        let mut registry = sample_registry();
        registry.record_success(5, 0x0100, 1234);
        save_registry(&registry, &store).unwrap();

        let mut restored = DeviceRegistry::new(RegistryLimits::default());
        assert_eq!(load_registry(&mut restored, &store).unwrap(), 1);

        let device = restored.get_device(5).unwrap();
        assert_eq!(device.name, "inverter");
        assert_eq!(device.description, "roof array");
        assert_eq!(device.poll_interval, Duration::from_millis(2500));
        assert_eq!(device.baudrate, 19_200);
        assert!(device.enabled);
        assert_eq!(device.health.status, DeviceStatus::Unknown);
        assert_eq!(device.health.poll_count, 0);
        assert_eq!(device.registers.len(), 2);

        let power = device.register(0x0100).unwrap();
        assert_eq!(power.kind, RegisterKind::InputRegister);
        assert_eq!(power.unit, "kW");
        assert_eq!(power.scale, 0.01);
        assert_eq!(power.offset, -1.5);
        assert_eq!(power.last_raw_value, 0);
        assert_eq!(power.last_update, None);

        let enable = device.register(0x0002).unwrap();
        assert!(enable.writable);
        assert_eq!(enable.description, "output relay");
    }

    #[test]
    fn test_load_missing_namespace_is_empty() {
        let store = MemoryStore::new();
        let mut registry = sample_registry();
        assert_eq!(load_registry(&mut registry, &store).unwrap(), 0);
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn test_load_caps_counts_and_skips_corrupt() {
        let store = MemoryStore::new();
        {
            let mut ns = store.open(STORAGE_NAMESPACE).unwrap();
            ns.set_u8("device_count", 3).unwrap();
            ns.set_u8("device_0_id", 9).unwrap();
            ns.set_u8("device_0_reg_count", 4).unwrap();
            ns.set_u16("device_0_reg_0_addr", 1).unwrap();
            ns.set_u8("device_0_reg_0_type", 3).unwrap();
            ns.set_u16("device_0_reg_1_addr", 2).unwrap();
            ns.set_u8("device_0_reg_1_type", 9).unwrap();
            ns.set_u16("device_0_reg_2_addr", 1).unwrap();
            ns.set_u8("device_0_reg_2_type", 4).unwrap();
            ns.set_u16("device_0_reg_3_addr", 3).unwrap();
            ns.set_u8("device_0_reg_3_type", 1).unwrap();
            ns.commit().unwrap();
        }

        let limits = RegistryLimits::new().with_max_registers_per_device(3);
        let mut registry = DeviceRegistry::new(limits);
        assert_eq!(load_registry(&mut registry, &store).unwrap(), 1);
        let device = registry.get_device(9).unwrap();
        // unknown type and duplicate address dropped, fourth entry beyond the cap
        assert_eq!(device.registers.len(), 1);
        assert_eq!(device.registers[0].address, 1);
        assert_eq!(device.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_load_tolerates_mistyped_fields() {
        let store = MemoryStore::new();
        save_registry(&sample_registry(), &store).unwrap();
        {
            let mut ns = store.open(STORAGE_NAMESPACE).unwrap();
            ns.set_u16("device_0_reg_0_scale", 7).unwrap();
            ns.set_u32("device_0_name", 1).unwrap();
            ns.set_str("device_0_reg_1_addr", "two").unwrap();
            ns.commit().unwrap();
        }

        let mut registry = DeviceRegistry::new(RegistryLimits::default());
        assert_eq!(load_registry(&mut registry, &store).unwrap(), 1);
        let device = registry.get_device(5).unwrap();
        assert_eq!(device.name, "");
        assert_eq!(device.description, "roof array");
        // unreadable address drops the register, unreadable scale falls back to 1.0
        assert_eq!(device.registers.len(), 1);
        assert_eq!(device.registers[0].address, 0x0100);
        assert_eq!(device.registers[0].scale, 1.0);
        assert_eq!(device.registers[0].offset, -1.5);
    }

    #[test]
    fn test_mistyped_id_skips_device() {
        let store = MemoryStore::new();
        {
            let mut ns = store.open(STORAGE_NAMESPACE).unwrap();
            ns.set_u8("device_count", 1).unwrap();
            ns.set_u16("device_0_id", 5).unwrap();
            ns.commit().unwrap();
        }

        let mut registry = sample_registry();
        assert_eq!(load_registry(&mut registry, &store).unwrap(), 0);
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let mut ns = store.open("scratch").unwrap();
        ns.set_u32("k", 1).unwrap();
        ns.close().unwrap();
        assert_eq!(store.key_count("scratch"), 0);
    }

    #[test]
    fn test_type_mismatch() {
        let store = MemoryStore::new();
        let mut ns = store.open("scratch").unwrap();
        ns.set_u32("k", 1).unwrap();
        assert!(matches!(ns.get_u8("k"), Err(ModbusError::Storage { .. })));
    }

    #[test]
    fn test_clear_erases_namespace() {
        let store = MemoryStore::new();
        let mut registry = sample_registry();
        save_registry(&registry, &store).unwrap();
        assert!(store.key_count(STORAGE_NAMESPACE) > 0);

        clear_registry(&mut registry, &store).unwrap();
        assert_eq!(registry.device_count(), 0);
        assert_eq!(store.key_count(STORAGE_NAMESPACE), 0);
    }

    #[test]
    fn test_save_overwrites_previous_table() {
        let store = MemoryStore::new();
        let mut registry = DeviceRegistry::new(RegistryLimits::new().with_max_devices(2));
        registry.add_device(Device::new(1, "a")).unwrap();
        registry.add_device(Device::new(2, "b")).unwrap();
        save_registry(&registry, &store).unwrap();

        registry.remove_device(1).unwrap();
        save_registry(&registry, &store).unwrap();

        let mut restored = DeviceRegistry::new(RegistryLimits::new().with_max_devices(2));
        load_registry(&mut restored, &store).unwrap();
        let ids: Vec<_> = restored.list_devices().iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec![2]);
    }
}
