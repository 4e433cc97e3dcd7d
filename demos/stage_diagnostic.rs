// Stage diagnostic: READ-ONLY check of the APT controllers
//
// This tool never moves a stage. Use it first before running stage_test.
//
// Usage: cargo run --example stage_diagnostic -- [serial]

use kinesis_tracker::stage::{self, Stage, StageSettings};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let wanted = std::env::args().nth(1);

    println!("=== Stage Diagnostic (READ-ONLY) ===");
    println!();

    println!("Step 1: Probing serial ports...");
    let devices = stage::list_devices()?;
    if devices.is_empty() {
        println!("  ✗ No APT controllers answered");
        println!();
        println!("Troubleshooting:");
        println!("  - Check the controller is powered and the USB cable is connected");
        println!("  - On Linux, make sure you can open /dev/ttyUSB* (dialout group)");
        return Ok(());
    }
    for d in &devices {
        println!(
            "  ✓ {} on {} (serial {}, {} channel(s), firmware {})",
            d.model, d.port, d.serial, d.channels, d.firmware
        );
    }
    println!();

    println!("Step 2: Reading stage state...");
    for d in devices
        .iter()
        .filter(|d| wanted.as_deref().is_none_or(|w| w == d.serial))
    {
        println!("  === {} ===", d.serial);
        let mut stage = match Stage::open(&d.serial, StageSettings::default()) {
            Ok(stage) => stage,
            Err(e) => {
                println!("    ✗ Open failed: {}", e);
                continue;
            }
        };

        match stage.hardware_info() {
            Ok(info) => println!("    Notes:    {}", info.notes),
            Err(e) => println!("    Notes:    ERROR - {}", e),
        }

        match stage.status() {
            Ok(status) => {
                let scale = stage.settings().scale;
                println!("    Position: {:.4}°", scale.to_degrees(status.counts));
                println!("    Moving:   {}", status.is_moving());
                println!("    Status:   {:?}", status.status);
            }
            Err(e) => println!("    Status:   ERROR - {}", e),
        }

        match stage.encoder_position() {
            Ok(deg) => println!("    Encoder:  {:.4}°", deg),
            Err(e) => println!("    Encoder:  ERROR - {}", e),
        }

        stage.close();
        println!();
    }

    println!("Next step: run 'cargo run --example stage_test -- <serial>' with the mount clear");
    Ok(())
}
