//! Modbus RTU protocol types
//!
//! Function codes, exception codes, the decoded response type and the flat
//! result classification reported to status consumers.

use std::fmt;

use bytes::Bytes;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};

/// Unit identifier of a device on the bus (1-247)
pub type SlaveId = u8;

/// Modbus function codes supported by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Decode a function code, ignoring the exception bit
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        match code & !EXCEPTION_FLAG {
            FC_READ_COILS => Ok(Self::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Ok(Self::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Ok(Self::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Ok(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Ok(Self::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(Self::WriteMultipleRegisters),
            _ => Err(ModbusError::NotSupported { function: code }),
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// Human-readable name of a raw function code
    pub fn description(code: u8) -> &'static str {
        match code & !EXCEPTION_FLAG {
            FC_READ_COILS => "Read Coils",
            FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
            FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
            FC_READ_INPUT_REGISTERS => "Read Input Registers",
            FC_WRITE_SINGLE_COIL => "Write Single Coil",
            FC_WRITE_SINGLE_REGISTER => "Write Single Register",
            FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
            FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
            _ => "Unknown function",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::description(self.to_u8()))
    }
}

/// Exception codes a device may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

impl ModbusException {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Some(Self::IllegalFunction),
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Some(Self::IllegalDataAddress),
            EXCEPTION_ILLEGAL_DATA_VALUE => Some(Self::IllegalDataValue),
            EXCEPTION_SERVER_DEVICE_FAILURE => Some(Self::ServerDeviceFailure),
            EXCEPTION_ACKNOWLEDGE => Some(Self::Acknowledge),
            EXCEPTION_SERVER_DEVICE_BUSY => Some(Self::ServerDeviceBusy),
            EXCEPTION_MEMORY_PARITY_ERROR => Some(Self::MemoryParityError),
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Some(Self::GatewayPathUnavailable),
            EXCEPTION_GATEWAY_TARGET_FAILED => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Human-readable description of a raw exception code
    pub fn description(code: u8) -> &'static str {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => "Illegal function",
            EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal data address",
            EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal data value",
            EXCEPTION_SERVER_DEVICE_FAILURE => "Server device failure",
            EXCEPTION_ACKNOWLEDGE => "Acknowledge",
            EXCEPTION_SERVER_DEVICE_BUSY => "Server device busy",
            EXCEPTION_MEMORY_PARITY_ERROR => "Memory parity error",
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway path unavailable",
            EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway target device failed",
            _ => "Unknown exception",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::description(self.to_u8()))
    }
}

/// Flat classification of a transaction outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResultKind {
    Ok,
    Timeout,
    CrcError,
    Exception,
    InvalidResponse,
    TransportError,
    NotInitialized,
}

impl ResultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Timeout => "Timeout",
            Self::CrcError => "CRC Error",
            Self::Exception => "Exception",
            Self::InvalidResponse => "Invalid Response",
            Self::TransportError => "UART Error",
            Self::NotInitialized => "Not Initialized",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded RTU response frame
///
/// `data` holds the payload only: register/coil bytes for reads (without the
/// byte count), the 4-byte echo for writes, empty for exceptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuResponse {
    pub slave_id: SlaveId,
    /// Function code as received, exception bit included
    pub function: u8,
    pub data: Bytes,
    pub exception_code: Option<u8>,
}

impl RtuResponse {
    pub fn is_exception(&self) -> bool {
        self.exception_code.is_some()
    }

    /// Function code with the exception bit cleared
    pub fn function_code(&self) -> u8 {
        self.function & !EXCEPTION_FLAG
    }

    /// Interpret the payload as big-endian registers
    pub fn registers(&self) -> ModbusResult<Vec<u16>> {
        if self.data.len() % 2 != 0 {
            return Err(ModbusError::invalid_response(format!(
                "odd register payload length {}",
                self.data.len()
            )));
        }
        Ok(self
            .data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Address and value/quantity words of a write echo
    pub fn write_echo(&self) -> ModbusResult<(u16, u16)> {
        if self.data.len() < 4 {
            return Err(ModbusError::invalid_response("write echo shorter than 4 bytes"));
        }
        Ok((
            u16::from_be_bytes([self.data[0], self.data[1]]),
            u16::from_be_bytes([self.data[2], self.data[3]]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_round_trip() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            assert_eq!(ModbusFunction::from_u8(code).unwrap().to_u8(), code);
        }
        assert_eq!(
            ModbusFunction::from_u8(0x83).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert!(matches!(
            ModbusFunction::from_u8(0x2B),
            Err(ModbusError::NotSupported { function: 0x2B })
        ));
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(ModbusFunction::description(0x03), "Read Holding Registers");
        assert_eq!(ModbusFunction::description(0x55), "Unknown function");
        assert_eq!(ModbusException::description(0x0B), "Gateway target device failed");
        assert_eq!(ModbusException::description(0x07), "Unknown exception");
        assert_eq!(ModbusException::from_u8(0x07), None);
    }

    #[test]
    fn test_response_helpers() {
        let response = RtuResponse {
            slave_id: 1,
            function: 0x03,
            data: Bytes::from_static(&[0x00, 0x2A, 0x01, 0x00]),
            exception_code: None,
        };
        assert_eq!(response.registers().unwrap(), vec![42, 256]);
        assert_eq!(response.write_echo().unwrap(), (42, 256));
    }
}
