//! # Voltage RTU - Modbus RTU Master Stack for RS-485 Gateways
//!
//! The field side of a configuration gateway: it talks Modbus RTU over one
//! half-duplex RS-485 line to a small fleet of pre-registered devices, keeps
//! their register values and health fresh in the background, and persists
//! the device table in a key-value store.
//!
//! ## Features
//!
//! - **Frame Codec**: stack-allocated RTU frames with bit-serial CRC-16
//! - **Transactions**: bounded retries, per-attempt timeout, outcome classification
//! - **Half-Duplex Control**: DE/RE direction switching with 3.5 character gaps
//! - **Device Registry**: bounded device/register table with scaling and health
//! - **Persistence**: flat key layout on any namespaced key-value store
//! - **Polling**: one cooperative background task with bounded shutdown
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_rtu::sim::{SimulatedBus, SimulatedDevice};
//! use voltage_rtu::transport::AutoDirection;
//! use voltage_rtu::{
//!     Device, GatewayConfig, MemoryStore, ModbusGateway, ModbusResult, Register, RegisterKind,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let bus = SimulatedBus::new();
//!     bus.attach(SimulatedDevice::new(1).with_holding(0, 230));
//!
//!     let gateway = ModbusGateway::new(GatewayConfig::default(), Arc::new(MemoryStore::new()));
//!     gateway.init(bus, AutoDirection).await?;
//!     gateway
//!         .add_device(
//!             Device::new(1, "meter")
//!                 .with_register(Register::new(0, RegisterKind::HoldingRegister, "voltage")),
//!         )
//!         .await?;
//!
//!     gateway.start_polling().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//!     println!("voltage = {}", gateway.scaled_value(1, 0).await);
//!
//!     gateway.shutdown().await
//! }
//! ```

// ============================================================================
// Protocol
// ============================================================================

/// Error types and result classification
pub mod error;

/// Protocol constants and line defaults
pub mod constants;

/// Function codes, exception codes and decoded responses
pub mod protocol;

/// RTU frame building, parsing and CRC-16
pub mod frame;

// ============================================================================
// Line and transactions
// ============================================================================

/// Half-duplex serial transport and direction control
pub mod transport;

/// Transaction executor with retries
pub mod master;

// ============================================================================
// Gateway
// ============================================================================

/// Configuration structs
pub mod config;

/// Device and register registry
pub mod registry;

/// Key-value persistence of the registry
pub mod storage;

/// Background polling task
pub mod poller;

/// Facade for configuration front ends
pub mod gateway;

/// Simulated RTU slaves for tests and demos
pub mod sim;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_rtu::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Core types ===
pub use frame::{build_exception_response, build_request, crc16, parse_response, validate_crc};
pub use frame::{RequestPayload, RtuFrame};
pub use protocol::{ModbusException, ModbusFunction, ResultKind, RtuResponse, SlaveId};

// === Master ===
pub use master::ModbusMaster;
pub use transport::{
    AutoDirection, GpioTransceiver, RtuTransport, SerialLine, TransceiverControl, TransportStats,
};

#[cfg(feature = "rtu")]
pub use transport::TokioSerialLine;

// === Gateway ===
pub use config::{GatewayConfig, MasterConfig, PollerConfig, RegistryLimits, TransceiverPins};
pub use gateway::{DeviceSummary, GatewayStatus, ModbusGateway};
pub use poller::Poller;
pub use registry::{
    Device, DeviceHealth, DeviceRegistry, DeviceStatus, Register, RegisterKind, SharedRegistry,
};
pub use storage::{KeyValueStore, MemoryStore, Namespace};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_DATA_LEN, MAX_FRAME_LEN, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage RTU v{} - Modbus RTU master stack for RS-485 gateways", VERSION)
}
