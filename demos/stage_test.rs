// Stage test: step-by-step home and move of one stage
//
// IMPORTANT: Run stage_diagnostic FIRST to verify read-only communication.
//
// Usage: cargo run --example stage_test -- <serial> [travel_max_deg]
//
// Every step that moves the stage asks for confirmation; Ctrl+C aborts.

use kinesis_tracker::stage::{Stage, StageSettings, TravelRange};
use std::io::{self, Write};

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(serial) = args.next() else {
        println!("Usage: stage_test <serial> [travel_max_deg]");
        return Ok(());
    };
    let travel_max: f64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(180.0);

    println!("=== Stage Test (WILL MOVE) ===");
    println!("Serial: {}   travel: 0°..{}°", serial, travel_max);
    println!();

    if !confirm("Is the mount clear of obstructions through its full travel?")? {
        return Ok(());
    }

    let settings = StageSettings {
        travel: TravelRange::new(0.0, travel_max),
        ..StageSettings::default()
    };
    let mut stage = Stage::open(&serial, settings)?;
    println!("✓ Connected");

    // ========== STEP 1: Initialize ==========
    println!("Step 1: Initializing controller...");
    stage.initialize()?;
    let info = stage.hardware_info()?;
    println!("  ✓ {} serial {}, firmware {}", info.model, info.serial_number, info.firmware_version());
    println!();

    // ========== STEP 2: Home ==========
    if !confirm("Home the stage?")? {
        stage.close();
        return Ok(());
    }
    stage.home()?;
    println!("  ✓ Homed at {:.4}°", stage.position()?);
    println!();

    // ========== STEP 3: Short moves ==========
    if !confirm("Run move test (10°, 45°, back to 0°)?")? {
        stage.close();
        return Ok(());
    }
    for target in [10.0, 45.0_f64.min(travel_max), 0.0] {
        let settled = stage.move_absolute(target)?;
        println!("  {:>7.3}° -> settled {:.4}° (error {:+.4}°)", target, settled, settled - target);
    }
    println!();

    // ========== STEP 4: Out of range is refused ==========
    println!("Step 4: Requesting {}° (must be refused without moving)...", travel_max + 5.0);
    match stage.move_absolute(travel_max + 5.0) {
        Err(e) => println!("  ✓ Refused: {}", e),
        Ok(p) => println!("  ✗ Stage moved to {:.4}°!", p),
    }

    stage.stop()?;
    stage.close();
    println!();
    println!("Test complete. You can now try: cargo run -- track");
    Ok(())
}
