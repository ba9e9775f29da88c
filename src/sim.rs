//! In-process RTU bus with simulated slave devices
//!
//! [`SimulatedBus`] implements [`SerialLine`]: every written request frame is
//! decoded and answered by the addressed [`SimulatedDevice`], just like a
//! physical RS-485 segment. Clones share the same bus, so a test or demo can
//! keep a handle to change device tables while the master owns the line.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::constants::*;
use crate::error::ModbusResult;
use crate::frame::{build_exception_response, hex, validate_crc, FrameBuilder};
use crate::protocol::SlaveId;
use crate::transport::SerialLine;

/// Data tables of one simulated slave
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    pub unit_id: SlaveId,
    pub coils: BTreeMap<u16, bool>,
    pub discrete_inputs: BTreeMap<u16, bool>,
    pub holding: BTreeMap<u16, u16>,
    pub input: BTreeMap<u16, u16>,
    /// Offline devices never answer
    pub offline: bool,
    /// Number of upcoming responses sent with a broken CRC
    pub corrupt_responses: u32,
}

impl SimulatedDevice {
    pub fn new(unit_id: SlaveId) -> Self {
        Self {
            unit_id,
            ..Self::default()
        }
    }

    pub fn with_coil(mut self, address: u16, on: bool) -> Self {
        self.coils.insert(address, on);
        self
    }

    pub fn with_discrete_input(mut self, address: u16, on: bool) -> Self {
        self.discrete_inputs.insert(address, on);
        self
    }

    pub fn with_holding(mut self, address: u16, value: u16) -> Self {
        self.holding.insert(address, value);
        self
    }

    pub fn with_input(mut self, address: u16, value: u16) -> Self {
        self.input.insert(address, value);
        self
    }

    fn read_bits(table: &BTreeMap<u16, bool>, address: u16, quantity: u16) -> Result<Vec<u8>, u8> {
        if quantity == 0 || quantity as usize > MAX_READ_COILS {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        let mut packed = vec![0u8; (quantity as usize).div_ceil(8)];
        for i in 0..quantity {
            let on = *table
                .get(&address.wrapping_add(i))
                .ok_or(EXCEPTION_ILLEGAL_DATA_ADDRESS)?;
            if on {
                packed[i as usize / 8] |= 1 << (i % 8);
            }
        }
        Ok(packed)
    }

    fn read_words(table: &BTreeMap<u16, u16>, address: u16, quantity: u16) -> Result<Vec<u8>, u8> {
        if quantity == 0 || quantity as usize > MAX_READ_REGISTERS {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        let mut data = Vec::with_capacity(quantity as usize * 2);
        for i in 0..quantity {
            let value = table
                .get(&address.wrapping_add(i))
                .ok_or(EXCEPTION_ILLEGAL_DATA_ADDRESS)?;
            data.extend_from_slice(&value.to_be_bytes());
        }
        Ok(data)
    }

    /// Answer a request PDU (function code onwards, CRC stripped).
    fn handle(&mut self, pdu: &[u8]) -> Result<Vec<u8>, u8> {
        if pdu.len() < 5 {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        let function = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let word = u16::from_be_bytes([pdu[3], pdu[4]]);

        let with_count = |data: Vec<u8>| {
            let mut body = vec![data.len() as u8];
            body.extend(data);
            body
        };

        match function {
            FC_READ_COILS => Self::read_bits(&self.coils, address, word).map(with_count),
            FC_READ_DISCRETE_INPUTS => {
                Self::read_bits(&self.discrete_inputs, address, word).map(with_count)
            }
            FC_READ_HOLDING_REGISTERS => {
                Self::read_words(&self.holding, address, word).map(with_count)
            }
            FC_READ_INPUT_REGISTERS => Self::read_words(&self.input, address, word).map(with_count),
            FC_WRITE_SINGLE_COIL => {
                let on = match word {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(EXCEPTION_ILLEGAL_DATA_VALUE),
                };
                let coil = self
                    .coils
                    .get_mut(&address)
                    .ok_or(EXCEPTION_ILLEGAL_DATA_ADDRESS)?;
                *coil = on;
                Ok(pdu[1..5].to_vec())
            }
            FC_WRITE_SINGLE_REGISTER => {
                let register = self
                    .holding
                    .get_mut(&address)
                    .ok_or(EXCEPTION_ILLEGAL_DATA_ADDRESS)?;
                *register = word;
                Ok(pdu[1..5].to_vec())
            }
            FC_WRITE_MULTIPLE_COILS => {
                let packed = pdu.get(6..).ok_or(EXCEPTION_ILLEGAL_DATA_VALUE)?;
                if packed.len() < (word as usize).div_ceil(8) {
                    return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
                }
                for i in 0..word {
                    if !self.coils.contains_key(&address.wrapping_add(i)) {
                        return Err(EXCEPTION_ILLEGAL_DATA_ADDRESS);
                    }
                }
                for i in 0..word {
                    let on = packed[i as usize / 8] & (1 << (i % 8)) != 0;
                    self.coils.insert(address.wrapping_add(i), on);
                }
                Ok(pdu[1..5].to_vec())
            }
            FC_WRITE_MULTIPLE_REGISTERS => {
                let values = pdu.get(6..).ok_or(EXCEPTION_ILLEGAL_DATA_VALUE)?;
                if values.len() < word as usize * 2 {
                    return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
                }
                for i in 0..word {
                    if !self.holding.contains_key(&address.wrapping_add(i)) {
                        return Err(EXCEPTION_ILLEGAL_DATA_ADDRESS);
                    }
                }
                for (i, pair) in values.chunks_exact(2).take(word as usize).enumerate() {
                    self.holding.insert(
                        address.wrapping_add(i as u16),
                        u16::from_be_bytes([pair[0], pair[1]]),
                    );
                }
                Ok(pdu[1..5].to_vec())
            }
            _ => Err(EXCEPTION_ILLEGAL_FUNCTION),
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    devices: BTreeMap<SlaveId, SimulatedDevice>,
    pending: Vec<u8>,
    requests: u64,
}

/// Simulated RS-485 segment
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
    /// Artificial turnaround before the answer becomes readable
    latency: Duration,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace a device on the bus
    pub fn attach(&self, device: SimulatedDevice) {
        self.state().devices.insert(device.unit_id, device);
    }

    pub fn detach(&self, unit_id: SlaveId) -> Option<SimulatedDevice> {
        self.state().devices.remove(&unit_id)
    }

    /// Run `f` against a device's tables
    pub fn with_device<R>(
        &self,
        unit_id: SlaveId,
        f: impl FnOnce(&mut SimulatedDevice) -> R,
    ) -> Option<R> {
        self.state().devices.get_mut(&unit_id).map(f)
    }

    pub fn set_holding(&self, unit_id: SlaveId, address: u16, value: u16) {
        self.with_device(unit_id, |d| d.holding.insert(address, value));
    }

    pub fn holding(&self, unit_id: SlaveId, address: u16) -> Option<u16> {
        self.with_device(unit_id, |d| d.holding.get(&address).copied())
            .flatten()
    }

    pub fn coil(&self, unit_id: SlaveId, address: u16) -> Option<bool> {
        self.with_device(unit_id, |d| d.coils.get(&address).copied())
            .flatten()
    }

    pub fn set_offline(&self, unit_id: SlaveId, offline: bool) {
        self.with_device(unit_id, |d| d.offline = offline);
    }

    /// Requests seen on the bus, answered or not
    pub fn request_count(&self) -> u64 {
        self.state().requests
    }

    fn respond(state: &mut BusState, frame: &[u8]) -> Option<Vec<u8>> {
        if !validate_crc(frame) || frame.len() < 4 {
            return None;
        }
        let unit_id = frame[0];
        let device = state.devices.get_mut(&unit_id)?;
        if device.offline {
            return None;
        }

        let pdu = &frame[1..frame.len() - 2];
        let mut response = match device.handle(pdu) {
            Ok(body) => FrameBuilder::new(unit_id)
                .and_then(|b| b.function_code(pdu[0]))
                .and_then(|b| b.data(&body))
                .and_then(|b| b.finish())
                .ok()?
                .as_slice()
                .to_vec(),
            Err(code) => build_exception_response(unit_id, pdu[0], code).to_vec(),
        };

        if device.corrupt_responses > 0 {
            device.corrupt_responses -= 1;
            if let Some(last) = response.last_mut() {
                *last ^= 0xFF;
            }
        }
        Some(response)
    }
}

impl SerialLine for SimulatedBus {
    async fn clear_input(&mut self) -> ModbusResult<()> {
        self.state().pending.clear();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> ModbusResult<usize> {
        let response = {
            let mut state = self.state();
            state.requests += 1;
            Self::respond(&mut state, data)
        };
        debug!("[SIM] request {} -> {:?}", hex(data), response.as_deref().map(hex));
        if let Some(response) = response {
            self.state().pending.extend(response);
        }
        Ok(data.len())
    }

    async fn wait_tx_done(&mut self, _timeout: Duration) -> ModbusResult<()> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let n = {
            let mut state = self.state();
            let n = state.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&state.pending[..n]);
            state.pending.drain(..n);
            n
        };
        if n == 0 {
            // Nothing on the wire; the transport's deadline ends the wait
            std::future::pending::<()>().await;
        }
        Ok(n)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.state().pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{build_request, parse_response, RequestPayload};
    use crate::protocol::ModbusFunction;

    async fn round_trip(bus: &mut SimulatedBus, request: &[u8]) -> Option<Vec<u8>> {
        bus.write(request).await.unwrap();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = tokio::time::timeout(Duration::from_millis(10), bus.read(&mut buf))
            .await
            .ok()?
            .unwrap();
        Some(buf[..n].to_vec())
    }

    fn read_holding(unit_id: SlaveId, address: u16, count: u16) -> Vec<u8> {
        build_request(
            unit_id,
            ModbusFunction::ReadHoldingRegisters,
            address,
            count,
            RequestPayload::None,
        )
        .unwrap()
        .as_slice()
        .to_vec()
    }

    #[tokio::test]
    async fn test_read_holding() {
        let mut bus = SimulatedBus::new();
        bus.attach(SimulatedDevice::new(1).with_holding(0, 42).with_holding(1, 7));

        let response = round_trip(&mut bus, &read_holding(1, 0, 2)).await.unwrap();
        let parsed = parse_response(&response).unwrap();
        assert_eq!(parsed.registers().unwrap(), vec![42, 7]);
    }

    #[tokio::test]
    async fn test_unknown_address_answers_exception() {
        let mut bus = SimulatedBus::new();
        bus.attach(SimulatedDevice::new(1).with_holding(0, 42));

        let response = round_trip(&mut bus, &read_holding(1, 9, 1)).await.unwrap();
        assert_eq!(
            response,
            build_exception_response(1, 0x03, EXCEPTION_ILLEGAL_DATA_ADDRESS).to_vec()
        );
    }

    #[tokio::test]
    async fn test_writes_update_tables() {
        let mut bus = SimulatedBus::new();
        bus.attach(SimulatedDevice::new(3).with_holding(10, 0).with_coil(4, false));

        let request = build_request(
            3,
            ModbusFunction::WriteSingleRegister,
            10,
            1,
            RequestPayload::Register(500),
        )
        .unwrap();
        let response = round_trip(&mut bus, request.as_slice()).await.unwrap();
        assert_eq!(&response[..6], &request.as_slice()[..6]);
        assert_eq!(bus.holding(3, 10), Some(500));

        let request =
            build_request(3, ModbusFunction::WriteSingleCoil, 4, 1, RequestPayload::Coil(true))
                .unwrap();
        round_trip(&mut bus, request.as_slice()).await.unwrap();
        assert_eq!(bus.coil(3, 4), Some(true));
    }

    #[tokio::test]
    async fn test_silent_for_unknown_or_offline_unit() {
        let mut bus = SimulatedBus::new();
        bus.attach(SimulatedDevice::new(1).with_holding(0, 1));
        bus.set_offline(1, true);

        assert_eq!(round_trip(&mut bus, &read_holding(1, 0, 1)).await, None);
        assert_eq!(round_trip(&mut bus, &read_holding(2, 0, 1)).await, None);
        assert_eq!(bus.request_count(), 2);
    }

    #[tokio::test]
    async fn test_detached_unit_goes_silent() {
        let mut bus = SimulatedBus::new();
        bus.attach(SimulatedDevice::new(1).with_holding(0, 9));
        assert!(round_trip(&mut bus, &read_holding(1, 0, 1)).await.is_some());

        let removed = bus.detach(1).unwrap();
        assert_eq!(removed.unit_id, 1);
        assert!(bus.detach(1).is_none());
        assert_eq!(round_trip(&mut bus, &read_holding(1, 0, 1)).await, None);
        assert_eq!(bus.holding(1, 0), None);
    }
}
