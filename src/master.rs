//! Modbus RTU master: transaction execution over one half-duplex line
//!
//! A transaction is one request frame followed by up to `retry_attempts`
//! send/receive cycles. Timeouts, CRC errors, UART failures and malformed or
//! mismatched answers are retried immediately; an exception response ends the
//! transaction and is remembered as the sticky [`ModbusMaster::last_exception`].
//!
//! The line sits behind one async mutex that is held for the whole
//! transaction, so the polling task and user-initiated writes never
//! interleave frames on the bus.
//!
//! # Typed API
//!
//! | Function Code | Method |
//! |---------------|--------|
//! | 0x01 | `read_coils()` |
//! | 0x02 | `read_discrete_inputs()` |
//! | 0x03 | `read_holding_registers()` |
//! | 0x04 | `read_input_registers()` |
//! | 0x05 | `write_single_coil()` |
//! | 0x06 | `write_single_register()` |
//! | 0x0F | `write_multiple_coils()` |
//! | 0x10 | `write_multiple_registers()` |
//!
//! # Example
//!
//! ```rust,no_run
//! use voltage_rtu::{MasterConfig, ModbusMaster, ModbusResult};
//! use voltage_rtu::sim::{SimulatedBus, SimulatedDevice};
//! use voltage_rtu::transport::AutoDirection;
//!
//! # async fn example() -> ModbusResult<()> {
//! let bus = SimulatedBus::new();
//! bus.attach(SimulatedDevice::new(1).with_holding(0, 42));
//!
//! let master = ModbusMaster::new(MasterConfig::default());
//! master.init(bus, AutoDirection).await?;
//! let values = master.read_holding_registers(1, 0, 1).await?;
//! assert_eq!(values, vec![42]);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MasterConfig;
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{build_request, pack_coils, parse_response, RequestPayload};
use crate::protocol::{ModbusException, ModbusFunction, RtuResponse, SlaveId};
use crate::registry::RegisterKind;
use crate::transport::{
    AutoDirection, RtuTransport, SerialLine, TransceiverControl, TransportStats,
};

/// RTU master owning one serial line
pub struct ModbusMaster<L, D = AutoDirection> {
    config: MasterConfig,
    transport: Mutex<Option<RtuTransport<L, D>>>,
    /// 0 when the last transaction did not end in an exception
    last_exception: AtomicU8,
}

impl<L: SerialLine, D: TransceiverControl> ModbusMaster<L, D> {
    /// Create an uninitialized master; call [`init`](Self::init) before use.
    pub fn new(config: MasterConfig) -> Self {
        Self {
            config,
            transport: Mutex::new(None),
            last_exception: AtomicU8::new(0),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Take ownership of the line and direction driver.
    ///
    /// Calling this on an initialized master is a no-op; the extra line is
    /// dropped.
    pub async fn init(&self, line: L, direction: D) -> ModbusResult<()> {
        self.config.validate()?;
        let mut guard = self.transport.lock().await;
        if guard.is_some() {
            info!("Modbus master already initialized");
            return Ok(());
        }
        let transport = RtuTransport::new(line, direction, self.config.baud_rate)?
            .with_frame_gap(self.config.effective_frame_gap())
            .with_tx_done_timeout(self.config.tx_done_timeout);
        *guard = Some(transport);
        info!(
            "Modbus master initialized: port={} baud={} timeout={}ms retries={}",
            self.config.port,
            self.config.baud_rate,
            self.config.response_timeout.as_millis(),
            self.config.retry_attempts
        );
        Ok(())
    }

    /// Close the line and release the direction pins. Idempotent.
    pub async fn shutdown(&self) -> ModbusResult<()> {
        let transport = self.transport.lock().await.take();
        match transport {
            Some(mut transport) => {
                transport.close().await?;
                info!("Modbus master shut down");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Exception code of the most recent transaction, if it ended in one
    pub fn last_exception(&self) -> Option<u8> {
        match self.last_exception.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    /// Snapshot of the line statistics; zeroed when not initialized
    pub async fn stats(&self) -> TransportStats {
        self.transport
            .lock()
            .await
            .as_ref()
            .map(|t| t.stats().clone())
            .unwrap_or_default()
    }

    /// Run one request/response transaction with retries.
    pub async fn execute(
        &self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
        payload: RequestPayload<'_>,
    ) -> ModbusResult<RtuResponse> {
        let frame = build_request(slave_id, function, address, quantity, payload)?;

        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(ModbusError::NotInitialized)?;

        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = ModbusError::timeout(
            "transaction",
            self.config.response_timeout.as_millis() as u64,
        );

        for attempt in 1..=attempts {
            match self
                .attempt(transport, frame.as_slice(), slave_id, function)
                .await
            {
                Ok(response) => {
                    if let Some(code) = response.exception_code {
                        self.last_exception.store(code, Ordering::Release);
                        warn!(
                            "Unit {} answered {} with exception 0x{:02X} ({})",
                            slave_id,
                            function,
                            code,
                            ModbusException::description(code)
                        );
                        return Err(ModbusError::exception(function.to_u8(), code));
                    }
                    self.last_exception.store(0, Ordering::Release);
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Unit {} {} attempt {}/{} failed: {}",
                        slave_id, function, attempt, attempts, e
                    );
                    last_error = e;
                }
                Err(e) => {
                    error!("Unit {} {} failed: {}", slave_id, function, e);
                    return Err(e);
                }
            }
        }

        error!(
            "Unit {} {} at 0x{:04X} failed after {} attempts: {}",
            slave_id, function, address, attempts, last_error
        );
        Err(last_error)
    }

    async fn attempt(
        &self,
        transport: &mut RtuTransport<L, D>,
        frame: &[u8],
        slave_id: SlaveId,
        function: ModbusFunction,
    ) -> ModbusResult<RtuResponse> {
        transport.send(frame).await?;
        let raw = transport.receive(self.config.response_timeout).await?;
        let response = parse_response(&raw).map_err(|e| match e {
            ModbusError::InvalidArgument { message } => ModbusError::invalid_response(message),
            ModbusError::NotSupported { function } => ModbusError::invalid_response(format!(
                "unexpected function code 0x{:02X}",
                function
            )),
            other => other,
        })?;

        if response.slave_id != slave_id {
            return Err(ModbusError::invalid_response(format!(
                "unit id mismatch: expected {}, got {}",
                slave_id, response.slave_id
            )));
        }
        if response.function_code() != function.to_u8() {
            return Err(ModbusError::invalid_response(format!(
                "function mismatch: expected 0x{:02X}, got 0x{:02X}",
                function.to_u8(),
                response.function
            )));
        }
        debug!("Unit {} {} completed", slave_id, function);
        Ok(response)
    }

    /// Typed calls report a missing line before any argument problem
    async fn ensure_initialized(&self) -> ModbusResult<()> {
        if self.transport.lock().await.is_none() {
            return Err(ModbusError::NotInitialized);
        }
        Ok(())
    }

    async fn read_bits(
        &self,
        function: ModbusFunction,
        slave_id: SlaveId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u8>> {
        self.ensure_initialized().await?;
        if count == 0 || count as usize > MAX_READ_COILS.min(MAX_RESPONSE_BITS) {
            return Err(ModbusError::invalid_argument(format!(
                "invalid bit count {}",
                count
            )));
        }
        let response = self
            .execute(slave_id, function, address, count, RequestPayload::None)
            .await?;
        let expected = (count as usize).div_ceil(8);
        if response.data.len() != expected {
            return Err(ModbusError::invalid_response(format!(
                "expected {} data bytes for {} bits, got {}",
                expected,
                count,
                response.data.len()
            )));
        }
        Ok(response.data.to_vec())
    }

    async fn read_words(
        &self,
        function: ModbusFunction,
        slave_id: SlaveId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.ensure_initialized().await?;
        if count == 0 || count as usize > MAX_READ_REGISTERS.min(MAX_RESPONSE_REGISTERS) {
            return Err(ModbusError::invalid_argument(format!(
                "invalid register count {}",
                count
            )));
        }
        let response = self
            .execute(slave_id, function, address, count, RequestPayload::None)
            .await?;
        if response.data.len() != count as usize * 2 {
            return Err(ModbusError::invalid_response(format!(
                "expected {} data bytes for {} registers, got {}",
                count as usize * 2,
                count,
                response.data.len()
            )));
        }
        response.registers()
    }

    /// Read coils (FC01), returned packed LSB-first
    pub async fn read_coils(
        &self,
        slave_id: SlaveId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u8>> {
        self.read_bits(ModbusFunction::ReadCoils, slave_id, address, count)
            .await
    }

    /// Read discrete inputs (FC02), returned packed LSB-first
    pub async fn read_discrete_inputs(
        &self,
        slave_id: SlaveId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u8>> {
        self.read_bits(ModbusFunction::ReadDiscreteInputs, slave_id, address, count)
            .await
    }

    /// Read holding registers (FC03)
    pub async fn read_holding_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_words(ModbusFunction::ReadHoldingRegisters, slave_id, address, count)
            .await
    }

    /// Read input registers (FC04)
    pub async fn read_input_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_words(ModbusFunction::ReadInputRegisters, slave_id, address, count)
            .await
    }

    /// Write a single coil (FC05)
    pub async fn write_single_coil(
        &self,
        slave_id: SlaveId,
        address: u16,
        on: bool,
    ) -> ModbusResult<()> {
        let response = self
            .execute(
                slave_id,
                ModbusFunction::WriteSingleCoil,
                address,
                1,
                RequestPayload::Coil(on),
            )
            .await?;
        check_echo(&response, address, if on { COIL_ON } else { COIL_OFF })
    }

    /// Write a single holding register (FC06)
    pub async fn write_single_register(
        &self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let response = self
            .execute(
                slave_id,
                ModbusFunction::WriteSingleRegister,
                address,
                1,
                RequestPayload::Register(value),
            )
            .await?;
        check_echo(&response, address, value)
    }

    /// Write consecutive coils (FC0F)
    pub async fn write_multiple_coils(
        &self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        self.ensure_initialized().await?;
        if values.is_empty() || values.len() > MAX_WRITE_COILS {
            return Err(ModbusError::invalid_argument(format!(
                "invalid coil count {}",
                values.len()
            )));
        }
        let quantity = values.len() as u16;
        let packed = pack_coils(values);
        let response = self
            .execute(
                slave_id,
                ModbusFunction::WriteMultipleCoils,
                address,
                quantity,
                RequestPayload::Coils(&packed),
            )
            .await?;
        check_echo(&response, address, quantity)
    }

    /// Write consecutive holding registers (FC10)
    pub async fn write_multiple_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.ensure_initialized().await?;
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(ModbusError::invalid_argument(format!(
                "invalid register count {}",
                values.len()
            )));
        }
        let quantity = values.len() as u16;
        let response = self
            .execute(
                slave_id,
                ModbusFunction::WriteMultipleRegisters,
                address,
                quantity,
                RequestPayload::Registers(values),
            )
            .await?;
        check_echo(&response, address, quantity)
    }

    /// Read one point of the given kind; coils and inputs come back as 0 or 1.
    pub async fn read_point(
        &self,
        slave_id: SlaveId,
        kind: RegisterKind,
        address: u16,
    ) -> ModbusResult<u16> {
        let function = kind.read_function();
        match kind {
            RegisterKind::Coil | RegisterKind::DiscreteInput => {
                let packed = self.read_bits(function, slave_id, address, 1).await?;
                Ok((packed[0] & 0x01) as u16)
            }
            RegisterKind::HoldingRegister | RegisterKind::InputRegister => {
                Ok(self.read_words(function, slave_id, address, 1).await?[0])
            }
        }
    }
}

#[cfg(feature = "rtu")]
impl ModbusMaster<crate::transport::TokioSerialLine, crate::transport::GpioTransceiver> {
    /// Open the configured serial port and DE/RE pins and initialize.
    pub async fn init_serial(&self) -> ModbusResult<()> {
        if self.is_initialized().await {
            info!("Modbus master already initialized");
            return Ok(());
        }
        let line = crate::transport::TokioSerialLine::open(
            &self.config.port,
            self.config.baud_rate,
            self.config.response_timeout,
        )?;
        let direction =
            crate::transport::GpioTransceiver::new(self.config.pins.de, self.config.pins.re)?;
        self.init(line, direction).await
    }
}

fn check_echo(response: &RtuResponse, address: u16, value: u16) -> ModbusResult<()> {
    let (echo_address, echo_value) = response.write_echo()?;
    if echo_address != address || echo_value != value {
        return Err(ModbusError::invalid_response(format!(
            "write echo mismatch: sent 0x{:04X}=0x{:04X}, got 0x{:04X}=0x{:04X}",
            address, value, echo_address, echo_value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::build_exception_response;
    use crate::transport::tests::{with_crc, RecordingDirection, Reply, ScriptedLine};
    use std::time::Duration;

    fn config() -> MasterConfig {
        MasterConfig::default().with_response_timeout(Duration::from_millis(200))
    }

    async fn master_with(replies: Vec<Reply>) -> (ModbusMaster<ScriptedLine>, ScriptedLine) {
        let line = ScriptedLine::new(replies);
        let master = ModbusMaster::new(config());
        master.init(line.clone(), AutoDirection).await.unwrap();
        (master, line)
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let master: ModbusMaster<ScriptedLine> = ModbusMaster::new(config());
        assert!(!master.is_initialized().await);
        assert_eq!(
            master.read_holding_registers(1, 0, 1).await,
            Err(ModbusError::NotInitialized)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_holding_register() {
        let (master, line) = master_with(vec![Reply::Frame(with_crc(&[
            0x01, 0x03, 0x02, 0x00, 0x2A,
        ]))])
        .await;

        assert_eq!(master.read_holding_registers(1, 0, 1).await.unwrap(), vec![42]);
        assert_eq!(line.writes(), 1);
        assert_eq!(
            line.written.lock().unwrap()[0],
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_on_silence() {
        let (master, line) =
            master_with(vec![Reply::Silence, Reply::Silence, Reply::Silence, Reply::Silence]).await;

        let err = master.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert_eq!(line.writes(), 3);
        assert_eq!(master.stats().await.timeouts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_short_circuits() {
        let (master, line) = master_with(vec![
            Reply::Frame(build_exception_response(1, 0x03, 0x02).to_vec()),
            Reply::Frame(with_crc(&[0x01, 0x03, 0x02, 0x00, 0x07])),
        ])
        .await;

        let err = master.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert_eq!(err.exception_code(), Some(0x02));
        assert_eq!(line.writes(), 1);
        assert_eq!(master.last_exception(), Some(0x02));

        // success clears the sticky code
        assert_eq!(master.read_holding_registers(1, 0, 1).await.unwrap(), vec![7]);
        assert_eq!(master.last_exception(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crc_error_then_success() {
        let mut corrupted = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        corrupted[4] ^= 0x01;
        let (master, line) = master_with(vec![
            Reply::Frame(corrupted),
            Reply::Frame(with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A])),
        ])
        .await;

        assert_eq!(master.read_holding_registers(1, 0, 1).await.unwrap(), vec![42]);
        assert_eq!(line.writes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_unit_is_retried() {
        let (master, line) = master_with(vec![
            Reply::Frame(with_crc(&[0x02, 0x03, 0x02, 0x00, 0x01])),
            Reply::Frame(with_crc(&[0x01, 0x04, 0x02, 0x00, 0x01])),
            Reply::Frame(with_crc(&[0x01, 0x03, 0x02, 0x00, 0x01])),
        ])
        .await;

        assert_eq!(master.read_holding_registers(1, 0, 1).await.unwrap(), vec![1]);
        assert_eq!(line.writes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_count_mismatch() {
        let (master, _line) = master_with(vec![Reply::Frame(with_crc(&[
            0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02,
        ]))])
        .await;

        let err = master.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidResponse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_single_register_echo() {
        let (master, line) = master_with(vec![Reply::Frame(with_crc(&[
            0x01, 0x06, 0x00, 0x10, 0x01, 0x2C,
        ]))])
        .await;

        master.write_single_register(1, 0x10, 300).await.unwrap();
        assert_eq!(
            &line.written.lock().unwrap()[0][..6],
            &[0x01, 0x06, 0x00, 0x10, 0x01, 0x2C]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_echo_mismatch() {
        let (master, _line) = master_with(vec![Reply::Frame(with_crc(&[
            0x01, 0x06, 0x00, 0x10, 0x00, 0x01,
        ]))])
        .await;

        assert!(matches!(
            master.write_single_register(1, 0x10, 300).await,
            Err(ModbusError::InvalidResponse { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_point_normalizes_bits() {
        let (master, _line) = master_with(vec![
            Reply::Frame(with_crc(&[0x01, 0x01, 0x01, 0xFF])),
            Reply::Frame(with_crc(&[0x01, 0x02, 0x01, 0x00])),
        ])
        .await;

        assert_eq!(master.read_point(1, RegisterKind::Coil, 5).await.unwrap(), 1);
        assert_eq!(
            master.read_point(1, RegisterKind::DiscreteInput, 5).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_invalid_quantity() {
        let (master, line) = master_with(vec![]).await;
        assert!(matches!(
            master.read_holding_registers(1, 0, 126).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            master.write_multiple_registers(1, 0, &[]).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert_eq!(line.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_capped_by_response_size() {
        let bus = crate::sim::SimulatedBus::new();
        bus.attach((0..65).fold(crate::sim::SimulatedDevice::new(1), |d, a| {
            d.with_holding(a, a * 2)
        }));
        let master = ModbusMaster::new(config());
        master.init(bus.clone(), AutoDirection).await.unwrap();

        let values = master.read_holding_registers(1, 0, 64).await.unwrap();
        assert_eq!(values.len(), 64);
        assert_eq!(values[63], 126);
        assert_eq!(bus.request_count(), 1);

        assert!(matches!(
            master.read_holding_registers(1, 0, 65).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            master.read_coils(1, 0, 1025).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert_eq!(bus.request_count(), 1);
    }

    #[tokio::test]
    async fn test_not_initialized_reported_before_arguments() {
        let master: ModbusMaster<ScriptedLine> = ModbusMaster::new(config());
        assert_eq!(
            master.read_holding_registers(1, 0, 0).await,
            Err(ModbusError::NotInitialized)
        );
        assert_eq!(
            master.read_coils(1, 0, 5000).await,
            Err(ModbusError::NotInitialized)
        );
        assert_eq!(
            master.write_multiple_registers(1, 0, &[]).await,
            Err(ModbusError::NotInitialized)
        );
        assert_eq!(
            master.write_multiple_coils(1, 0, &[]).await,
            Err(ModbusError::NotInitialized)
        );
    }

    /// Transceiver whose pins have gone away underneath the master
    #[derive(Clone, Default)]
    struct ReleasedDirection {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl TransceiverControl for ReleasedDirection {
        fn set_transmit(&mut self) -> ModbusResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ModbusError::NotInitialized)
        }

        fn set_receive(&mut self) -> ModbusResult<()> {
            Ok(())
        }

        fn release(&mut self) -> ModbusResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_ends_transaction() {
        let line = ScriptedLine::new(vec![]);
        let direction = ReleasedDirection::default();
        let master = ModbusMaster::new(config().with_retry_attempts(3));
        master.init(line.clone(), direction.clone()).await.unwrap();

        assert_eq!(
            master.read_holding_registers(1, 0, 1).await,
            Err(ModbusError::NotInitialized)
        );
        assert_eq!(direction.calls.load(Ordering::SeqCst), 1);
        assert_eq!(line.writes(), 0);
    }

    #[tokio::test]
    async fn test_init_idempotent_and_shutdown() {
        let direction = RecordingDirection::default();
        let master = ModbusMaster::new(config());
        master
            .init(ScriptedLine::new(vec![]), direction.clone())
            .await
            .unwrap();
        master
            .init(ScriptedLine::new(vec![]), direction.clone())
            .await
            .unwrap();
        assert!(master.is_initialized().await);

        master.shutdown().await.unwrap();
        master.shutdown().await.unwrap();
        assert!(!master.is_initialized().await);
        assert_eq!(direction.events.lock().unwrap().last(), Some(&"release"));
        assert_eq!(
            master.write_single_coil(1, 0, true).await,
            Err(ModbusError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let master: ModbusMaster<ScriptedLine> =
            ModbusMaster::new(MasterConfig::default().with_retry_attempts(0));
        assert!(master
            .init(ScriptedLine::new(vec![]), AutoDirection)
            .await
            .is_err());
    }
}
