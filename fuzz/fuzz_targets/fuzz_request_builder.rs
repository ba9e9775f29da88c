//! Build requests from arbitrary parameters.
//!
//! Every frame the builder accepts must fit the RTU size limit, end in a
//! valid CRC and address the requested unit and function.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_rtu::{build_request, validate_crc, ModbusFunction, RequestPayload, MAX_FRAME_LEN};

#[derive(Debug, Arbitrary)]
enum Payload {
    None,
    Coil(bool),
    Register(u16),
    Coils(Vec<u8>),
    Registers(Vec<u16>),
}

#[derive(Debug, Arbitrary)]
struct Input {
    slave_id: u8,
    function: u8,
    address: u16,
    quantity: u16,
    payload: Payload,
}

fuzz_target!(|input: Input| {
    let Ok(function) = ModbusFunction::from_u8(input.function) else {
        return;
    };
    let payload = match &input.payload {
        Payload::None => RequestPayload::None,
        Payload::Coil(on) => RequestPayload::Coil(*on),
        Payload::Register(value) => RequestPayload::Register(*value),
        Payload::Coils(packed) => RequestPayload::Coils(packed),
        Payload::Registers(values) => RequestPayload::Registers(values),
    };

    let built = build_request(
        input.slave_id,
        function,
        input.address,
        input.quantity,
        payload,
    );
    if let Ok(frame) = built {
        let bytes = frame.as_slice();
        assert!(bytes.len() <= MAX_FRAME_LEN);
        assert!(validate_crc(bytes));
        assert_eq!(bytes[0], input.slave_id);
        assert_eq!(bytes[1], function.to_u8());
    }
});
