//! Voltage RTU Demo
//!
//! Walks through the RTU master stack against an in-process simulated bus:
//! - Frame building, CRC-16 and response parsing
//! - Device registry with scaling, background polling and device health
//! - Register writes, exception handling and persistence
//!
//! Usage: cargo run --bin demo
//! Log level: RUST_LOG=voltage_rtu=debug cargo run --bin demo

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use voltage_rtu::sim::{SimulatedBus, SimulatedDevice};
use voltage_rtu::{
    build_exception_response, build_request, crc16, parse_response, AutoDirection, Device,
    GatewayConfig, MasterConfig, MemoryStore, ModbusFunction, ModbusGateway, PollerConfig,
    Register, RegisterKind, RequestPayload,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voltage_rtu=info")),
        )
        .init();

    println!("🚀 {}", voltage_rtu::info());
    println!("=============================\n");

    // =========================================================================
    // Part 1: Frame codec (no bus required)
    // =========================================================================
    println!("📦 Part 1: RTU Frames");
    println!("---------------------");

    let request = build_request(
        1,
        ModbusFunction::ReadHoldingRegisters,
        0x0000,
        10,
        RequestPayload::None,
    )?;
    println!("  FC03 request: {:?}", request);
    println!(
        "  CRC over body: 0x{:04X}",
        crc16(&request.as_slice()[..request.len() - 2])
    );

    let exception = build_exception_response(1, 0x03, 0x02);
    let parsed = parse_response(&exception)?;
    println!(
        "  Exception frame {:02X?} -> code {:?}",
        exception, parsed.exception_code
    );

    // =========================================================================
    // Part 2: Gateway on a simulated bus
    // =========================================================================
    println!("\n🔌 Part 2: Gateway");
    println!("------------------");

    let bus = SimulatedBus::new().with_latency(Duration::from_millis(5));
    bus.attach(
        SimulatedDevice::new(1)
            .with_holding(0x0000, 2304)
            .with_holding(0x0010, 50)
            .with_input(0x0001, 1500)
            .with_coil(0x0002, false),
    );

    let store = MemoryStore::new();
    let config = GatewayConfig::new(
        MasterConfig::new("sim0").with_response_timeout(Duration::from_millis(200)),
    )
    .with_poller(PollerConfig::new().with_idle_interval(Duration::from_millis(200)));
    let gateway = ModbusGateway::new(config, Arc::new(store.clone()));
    gateway.init(bus.clone(), AutoDirection).await?;

    gateway
        .add_device(
            Device::new(1, "energy meter")
                .with_description("feeder 3")
                .with_poll_interval(Duration::from_millis(250))
                .with_register(
                    Register::new(0x0000, RegisterKind::HoldingRegister, "voltage")
                        .with_unit("V")
                        .with_scaling(0.1, 0.0),
                )
                .with_register(
                    Register::new(0x0001, RegisterKind::InputRegister, "power")
                        .with_unit("kW")
                        .with_scaling(0.01, 0.0),
                )
                .with_register(
                    Register::new(0x0010, RegisterKind::HoldingRegister, "setpoint")
                        .with_writable(true),
                )
                .with_register(
                    Register::new(0x0002, RegisterKind::Coil, "breaker").with_writable(true),
                ),
        )
        .await?;
    println!("  ✅ Device 1 registered with 4 registers");

    gateway.start_polling().await?;
    sleep(Duration::from_millis(600)).await;

    for register in gateway.get_device(1).await?.registers {
        println!(
            "    {:<10} raw={:<6} scaled={:.2} {}",
            register.name,
            register.last_raw_value,
            register.scaled_value(),
            register.unit
        );
    }

    // =========================================================================
    // Part 3: Writes and exceptions
    // =========================================================================
    println!("\n✏️  Part 3: Writes");
    println!("-----------------");

    gateway.write_register(1, 0x0010, 75).await?;
    println!("  FC06 setpoint = {}", bus.holding(1, 0x0010).unwrap_or_default());
    gateway.write_register(1, 0x0002, 1).await?;
    println!("  FC05 breaker  = {}", bus.coil(1, 0x0002).unwrap_or_default());

    match gateway.write_register(1, 0x0001, 1).await {
        Ok(()) => println!("  unexpected write to read-only register"),
        Err(e) => println!("  ⚠️  Read-only register rejected: {}", e),
    }

    bus.with_device(1, |d| d.holding.remove(&0x0000));
    sleep(Duration::from_millis(400)).await;

    let status = gateway.status().await;
    println!("\n  📊 Status:");
    println!(
        "    Polling: {}, last exception: {:?} ({})",
        status.polling,
        status.last_exception,
        status.last_exception_text.unwrap_or("none")
    );
    for device in &status.devices {
        println!(
            "    Device {} {}: {} polls={} errors={}",
            device.device_id,
            device.name,
            device.health.status.as_str(),
            device.health.poll_count,
            device.health.error_count
        );
    }
    println!(
        "    Requests: {}, Responses: {}, Timeouts: {}",
        status.transport.requests_sent,
        status.transport.responses_received,
        status.transport.timeouts
    );

    // =========================================================================
    // Part 4: Persistence
    // =========================================================================
    println!("\n💾 Part 4: Persistence");
    println!("----------------------");

    gateway.save().await?;
    println!("  Saved {} keys", store.key_count(voltage_rtu::constants::STORAGE_NAMESPACE));
    gateway.remove_device(1).await?;
    let restored = gateway.load().await?;
    println!("  Restored {} device(s) from storage", restored);

    gateway.shutdown().await?;
    println!("\n🎉 Demo completed!");

    Ok(())
}
