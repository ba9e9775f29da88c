//! # Gateway Configuration
//!
//! Plain configuration structs with `Default` values matching a typical
//! single-port RS-485 gateway, and `with_*` builders for overrides.
//!
//! ```rust
//! use std::time::Duration;
//! use voltage_rtu::MasterConfig;
//!
//! let config = MasterConfig::new("/dev/ttyS1")
//!     .with_baud_rate(19_200)
//!     .with_response_timeout(Duration::from_millis(500))
//!     .with_retry_attempts(2);
//!
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};

/// RS-485 direction pins, as Linux GPIO numbers.
///
/// TX and RX belong to the UART behind `port` and are not configured here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransceiverPins {
    /// Driver enable, active high
    pub de: u32,
    /// Receiver enable, active low
    pub re: u32,
}

impl Default for TransceiverPins {
    fn default() -> Self {
        Self {
            de: DEFAULT_DE_PIN,
            re: DEFAULT_RE_PIN,
        }
    }
}

/// Serial line and transaction settings for the master.
///
/// The frame format is fixed at 8 data bits, no parity, one stop bit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MasterConfig {
    /// Serial device path
    pub port: String,
    pub baud_rate: u32,
    pub pins: TransceiverPins,
    /// Per-attempt wait for a response
    pub response_timeout: Duration,
    /// Send/receive cycles per transaction
    pub retry_attempts: u32,
    /// Bound on waiting for the UART to drain
    pub tx_done_timeout: Duration,
    /// Inter-frame silence; derived from the baud rate when unset
    pub frame_gap: Option<Duration>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            pins: TransceiverPins::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            tx_done_timeout: DEFAULT_TX_DONE_TIMEOUT,
            frame_gap: None,
        }
    }
}

impl MasterConfig {
    pub fn new<S: Into<String>>(port: S) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_pins(mut self, pins: TransceiverPins) -> Self {
        self.pins = pins;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_tx_done_timeout(mut self, timeout: Duration) -> Self {
        self.tx_done_timeout = timeout;
        self
    }

    pub fn with_frame_gap(mut self, gap: Duration) -> Self {
        self.frame_gap = Some(gap);
        self
    }

    /// Silent interval enforced between frames
    pub fn effective_frame_gap(&self) -> Duration {
        self.frame_gap.unwrap_or_else(|| frame_gap(self.baud_rate))
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.port.is_empty() {
            return Err(ModbusError::invalid_argument("serial port path is empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::invalid_argument("baud rate must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(ModbusError::invalid_argument(
                "retry attempts must be at least 1",
            ));
        }
        if self.response_timeout.is_zero() {
            return Err(ModbusError::invalid_argument(
                "response timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Capacity of the device registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistryLimits {
    pub max_devices: usize,
    pub max_registers_per_device: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
            max_registers_per_device: DEFAULT_MAX_REGISTERS_PER_DEVICE,
        }
    }
}

impl RegistryLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_devices(mut self, count: usize) -> Self {
        self.max_devices = count;
        self
    }

    pub fn with_max_registers_per_device(mut self, count: usize) -> Self {
        self.max_registers_per_device = count;
        self
    }
}

/// Timing of the background polling task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollerConfig {
    /// Sleep when no device is due for polling
    pub idle_interval: Duration,
    /// Pause between consecutive register reads
    pub register_gap: Duration,
    /// Bound on waiting for the task in `stop`
    pub stop_grace: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_interval: DEFAULT_IDLE_INTERVAL,
            register_gap: DEFAULT_REGISTER_GAP,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_register_gap(mut self, gap: Duration) -> Self {
        self.register_gap = gap;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Everything a gateway needs, in one place
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GatewayConfig {
    pub master: MasterConfig,
    pub registry: RegistryLimits,
    pub poller: PollerConfig,
}

impl GatewayConfig {
    pub fn new(master: MasterConfig) -> Self {
        Self {
            master,
            ..Self::default()
        }
    }

    pub fn with_registry_limits(mut self, limits: RegistryLimits) -> Self {
        self.registry = limits;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_defaults() {
        let config = MasterConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.pins, TransceiverPins { de: 7, re: 6 });
        assert_eq!(config.response_timeout, Duration::from_millis(1000));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.tx_done_timeout, Duration::from_millis(100));
        assert_eq!(config.effective_frame_gap(), frame_gap(9600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_master_validation() {
        assert!(MasterConfig::default().with_baud_rate(0).validate().is_err());
        assert!(MasterConfig::default().with_retry_attempts(0).validate().is_err());
        assert!(MasterConfig::default()
            .with_response_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(MasterConfig::new("").validate().is_err());

        // Shared pins only matter once GPIO direction control is opened
        let shared = MasterConfig::default().with_pins(TransceiverPins { de: 4, re: 4 });
        assert!(shared.validate().is_ok());
    }

    #[test]
    fn test_frame_gap_override() {
        let config = MasterConfig::default().with_frame_gap(Duration::from_millis(5));
        assert_eq!(config.effective_frame_gap(), Duration::from_millis(5));
    }

    #[test]
    fn test_registry_and_poller_defaults() {
        let limits = RegistryLimits::new();
        assert_eq!(limits.max_devices, 1);
        assert_eq!(limits.max_registers_per_device, 10);

        let poller = PollerConfig::new().with_register_gap(Duration::from_millis(1));
        assert_eq!(poller.idle_interval, Duration::from_secs(1));
        assert_eq!(poller.register_gap, Duration::from_millis(1));
        assert_eq!(poller.stop_grace, Duration::from_secs(5));
    }
}
