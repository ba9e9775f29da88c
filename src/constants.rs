//! Modbus RTU protocol constants and gateway defaults
//!
//! Frame limits follow the serial line definition of Modbus:
//! - Maximum ADU size on RS-485: 256 bytes (address + PDU + CRC)
//! - Read payloads are additionally capped at [`MAX_DATA_LEN`] by this stack,
//!   which keeps every response inside a single receive buffer

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum RTU frame (ADU) size on the serial line
/// Slave Address(1) + PDU(253) + CRC(2) = 256 bytes
pub const MAX_FRAME_LEN: usize = 256;

/// Largest PDU the protocol allows
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum byte count accepted in a read response
pub const MAX_DATA_LEN: usize = 128;

/// Smallest frame that can carry a CRC: Slave Address(1) + at least one byte + CRC(2)
pub const MIN_FRAME_LEN: usize = 3;

/// Exception response length: Slave Address(1) + Function(1) + Code(1) + CRC(2)
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Write echo length: Slave Address(1) + Function(1) + Address(2) + Value(2) + CRC(2)
pub const WRITE_RESPONSE_LEN: usize = 8;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Lowest assignable unit id (0 is broadcast)
pub const MIN_UNIT_ID: u8 = 1;

/// Highest assignable unit id (248..=255 are reserved)
pub const MAX_UNIT_ID: u8 = 247;

// ============================================================================
// Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
/// 1 + 1 + (N × 2) ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16
/// 1 + 2 + 2 + 1 + (N × 2) ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum number of coils for FC01/FC02
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15
pub const MAX_WRITE_COILS: usize = 1968;

/// Registers per FC03/FC04 read whose answer fits [`MAX_DATA_LEN`]
pub const MAX_RESPONSE_REGISTERS: usize = MAX_DATA_LEN / 2;

/// Bits per FC01/FC02 read whose answer fits [`MAX_DATA_LEN`]
pub const MAX_RESPONSE_BITS: usize = MAX_DATA_LEN * 8;

/// Coil ON value in FC05 requests
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value in FC05 requests
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Line Defaults
// ============================================================================

/// Default serial device path
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Default line speed
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default driver-enable pin
pub const DEFAULT_DE_PIN: u32 = 7;

/// Default receiver-enable pin (active low)
pub const DEFAULT_RE_PIN: u32 = 6;

/// Default per-attempt response timeout
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of send/receive cycles per transaction
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Upper bound on waiting for the UART to drain after a write
pub const DEFAULT_TX_DONE_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Registry / Polling Defaults
// ============================================================================

/// Default device capacity of the registry
pub const DEFAULT_MAX_DEVICES: usize = 1;

/// Default register capacity per device
pub const DEFAULT_MAX_REGISTERS_PER_DEVICE: usize = 10;

/// Default polling interval for new devices
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Sleep when there is nothing to poll
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Pause between two register reads in one poll cycle
pub const DEFAULT_REGISTER_GAP: Duration = Duration::from_millis(10);

/// How long `stop` waits for the polling task to wind down
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Persistence namespace for the device table
pub const STORAGE_NAMESPACE: &str = "modbus_config";

/// Returns the 3.5 character silent interval for a baud rate.
///
/// One RTU character is 11 bits (start + 8 data + parity/stop + stop). Above
/// 19200 baud the line definition fixes the gap at 1.75 ms.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1750);
    }
    let char_time_us = 11_000_000u64 / baud_rate as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MAX_FRAME_LEN, 1 + MAX_PDU_SIZE + 2);
        assert_eq!(EXCEPTION_FRAME_LEN, 5);
        assert_eq!(WRITE_RESPONSE_LEN, 8);
        assert!(MAX_DATA_LEN + 5 <= MAX_FRAME_LEN);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + MAX_READ_COILS.div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);

        let write_coil_pdu = 1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8);
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_frame_gap() {
        // 9600 baud: 1145us per char, 3.5 chars
        assert_eq!(frame_gap(9600), Duration::from_micros(4007));
        assert_eq!(frame_gap(115_200), Duration::from_micros(1750));
        assert_eq!(frame_gap(0), Duration::from_micros(1750));
    }
}
