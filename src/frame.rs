//! RTU frame codec
//!
//! Frames are built in a fixed-size stack buffer: unit id, PDU, then the
//! CRC-16 appended low byte first. Parsing copies the payload out of the
//! receive buffer so the caller owns the response independently of the line.

use bytes::Bytes;
use tracing::debug;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, RtuResponse, SlaveId};

/// CRC-16/MODBUS: init 0xFFFF, reflected polynomial 0xA001, bit-serial.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Check the little-endian CRC trailer of a frame.
pub fn validate_crc(frame: &[u8]) -> bool {
    if frame.len() < MIN_FRAME_LEN {
        return false;
    }
    let split = frame.len() - 2;
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    crc16(&frame[..split]) == received
}

/// Pack coil states LSB-first into bytes.
pub fn pack_coils(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

/// Stack-allocated RTU frame
#[derive(Clone)]
pub struct RtuFrame {
    data: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl RtuFrame {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_FRAME_LEN],
            len: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_FRAME_LEN {
            return Err(ModbusError::invalid_argument("RTU frame buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_FRAME_LEN {
            return Err(ModbusError::invalid_argument(format!(
                "RTU frame would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_FRAME_LEN
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn slave_id(&self) -> Option<SlaveId> {
        self.as_slice().first().copied()
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().get(1).copied()
    }
}

impl Default for RtuFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RtuFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RtuFrame({})", hex(self.as_slice()))
    }
}

impl AsRef<[u8]> for RtuFrame {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Fluent frame builder; `finish` appends the CRC
pub struct FrameBuilder {
    frame: RtuFrame,
}

impl FrameBuilder {
    #[inline]
    pub fn new(slave_id: SlaveId) -> ModbusResult<Self> {
        let mut frame = RtuFrame::new();
        frame.push(slave_id)?;
        Ok(Self { frame })
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.frame.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.frame.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.frame.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.frame.extend(data)?;
        Ok(self)
    }

    /// Append the CRC (low byte first) and return the frame
    pub fn finish(mut self) -> ModbusResult<RtuFrame> {
        let crc = crc16(self.frame.as_slice());
        self.frame.extend(&crc.to_le_bytes())?;
        debug!(
            "RTU frame built: unit={} FC={:02X} ({}), len={}",
            self.frame.slave_id().unwrap_or(0),
            self.frame.function_code().unwrap_or(0),
            ModbusFunction::description(self.frame.function_code().unwrap_or(0)),
            self.frame.len()
        );
        Ok(self.frame)
    }
}

/// Function-specific request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPayload<'a> {
    /// Reads carry nothing beyond address and quantity
    None,
    /// FC05 coil state, encoded as 0xFF00 / 0x0000
    Coil(bool),
    /// FC06 register value
    Register(u16),
    /// FC0F packed coil bytes
    Coils(&'a [u8]),
    /// FC10 register values
    Registers(&'a [u16]),
}

/// Build a complete request frame.
///
/// For FC05 and FC06 the second word is taken from the payload and
/// `quantity` is ignored.
pub fn build_request(
    slave_id: SlaveId,
    function: ModbusFunction,
    address: u16,
    quantity: u16,
    payload: RequestPayload<'_>,
) -> ModbusResult<RtuFrame> {
    let builder = FrameBuilder::new(slave_id)?
        .function_code(function.to_u8())?
        .word(address)?;

    match (function, payload) {
        (f, RequestPayload::None) if f.is_read() => builder.word(quantity)?.finish(),
        (ModbusFunction::WriteSingleCoil, RequestPayload::Coil(on)) => builder
            .word(if on { COIL_ON } else { COIL_OFF })?
            .finish(),
        (ModbusFunction::WriteSingleRegister, RequestPayload::Register(value)) => {
            builder.word(value)?.finish()
        }
        (ModbusFunction::WriteMultipleCoils, RequestPayload::Coils(packed)) => {
            if packed.len() != (quantity as usize).div_ceil(8) || packed.len() > u8::MAX as usize
            {
                return Err(ModbusError::invalid_argument(format!(
                    "{} coil bytes do not match quantity {}",
                    packed.len(),
                    quantity
                )));
            }
            builder
                .word(quantity)?
                .byte(packed.len() as u8)?
                .data(packed)?
                .finish()
        }
        (ModbusFunction::WriteMultipleRegisters, RequestPayload::Registers(values)) => {
            if values.len() != quantity as usize || values.len() * 2 > u8::MAX as usize {
                return Err(ModbusError::invalid_argument(format!(
                    "{} register values do not match quantity {}",
                    values.len(),
                    quantity
                )));
            }
            let mut builder = builder.word(quantity)?.byte((values.len() * 2) as u8)?;
            for &value in values {
                builder = builder.word(value)?;
            }
            builder.finish()
        }
        (function, payload) => Err(ModbusError::invalid_argument(format!(
            "payload {:?} does not fit {}",
            payload, function
        ))),
    }
}

/// Parse a received frame into an owned response.
pub fn parse_response(frame: &[u8]) -> ModbusResult<RtuResponse> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(ModbusError::invalid_argument(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    if !validate_crc(frame) {
        return Err(ModbusError::invalid_argument("frame CRC invalid"));
    }
    // Unit id and function code must both precede the CRC
    if frame.len() < MIN_FRAME_LEN + 1 {
        return Err(ModbusError::invalid_argument("frame has no function code"));
    }

    let slave_id = frame[0];
    let function = frame[1];
    let body_end = frame.len() - 2;

    if function & EXCEPTION_FLAG != 0 {
        if frame.len() < EXCEPTION_FRAME_LEN {
            return Err(ModbusError::invalid_argument("truncated exception response"));
        }
        let code = frame[2];
        debug!(
            "RTU exception parsed: unit={} FC={:02X} code={:02X}",
            slave_id, function, code
        );
        return Ok(RtuResponse {
            slave_id,
            function,
            data: Bytes::new(),
            exception_code: Some(code),
        });
    }

    let data = match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS => {
            if body_end < 3 {
                return Err(ModbusError::invalid_argument("read response has no byte count"));
            }
            let byte_count = frame[2] as usize;
            if byte_count > MAX_DATA_LEN {
                return Err(ModbusError::invalid_argument(format!(
                    "byte count {} exceeds {}",
                    byte_count, MAX_DATA_LEN
                )));
            }
            if frame.len() < 3 + byte_count + 2 {
                return Err(ModbusError::invalid_argument(format!(
                    "truncated read response: byte count {} in {} byte frame",
                    byte_count,
                    frame.len()
                )));
            }
            Bytes::copy_from_slice(&frame[3..3 + byte_count])
        }
        FC_WRITE_SINGLE_COIL
        | FC_WRITE_SINGLE_REGISTER
        | FC_WRITE_MULTIPLE_COILS
        | FC_WRITE_MULTIPLE_REGISTERS => {
            if frame.len() < WRITE_RESPONSE_LEN {
                return Err(ModbusError::invalid_argument(format!(
                    "truncated write response: {} bytes",
                    frame.len()
                )));
            }
            Bytes::copy_from_slice(&frame[2..6])
        }
        _ => return Err(ModbusError::NotSupported { function }),
    };

    debug!(
        "RTU response parsed: unit={} FC={:02X} ({}), data_len={}",
        slave_id,
        function,
        ModbusFunction::description(function),
        data.len()
    );

    Ok(RtuResponse {
        slave_id,
        function,
        data,
        exception_code: None,
    })
}

/// Build the 5-byte exception response a device sends for `function`.
pub fn build_exception_response(slave_id: SlaveId, function: u8, code: u8) -> [u8; 5] {
    let mut frame = [slave_id, function | EXCEPTION_FLAG, code, 0, 0];
    let crc = crc16(&frame[..3]);
    frame[3..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Space-separated upper-case hex, used for frame logs
pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
