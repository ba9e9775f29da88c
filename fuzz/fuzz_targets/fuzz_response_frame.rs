//! Feed arbitrary bytes to the response parser.
//!
//! The parser must never panic, and any frame it accepts must carry a valid
//! CRC and decode consistently.

#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_rtu::{parse_response, validate_crc};

fuzz_target!(|data: &[u8]| {
    if let Ok(response) = parse_response(data) {
        assert!(validate_crc(data));
        assert_eq!(response.slave_id, data[0]);

        if response.is_exception() {
            assert!(response.exception_code.is_some());
            return;
        }
        let _ = response.registers();
        let _ = response.write_echo();
    }
});
