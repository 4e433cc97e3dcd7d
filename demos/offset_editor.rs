// Keyboard offset editor: arrows/WASD nudge offsets, R reset, X stop tracking, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::Duration;
use tracing::info;

use kinesis_tracker::config::{OFFSET_INCREMENT_DEG, TOPIC_CMD_TRACKER};
use kinesis_tracker::messages::{Axis, TrackerCommand};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_TRACKER).await?;

    info!("Controls: arrows/WASD=nudge, R=reset, X=stop tracking, Q=quit");
    info!("Step: {}°", OFFSET_INCREMENT_DEG);

    enable_raw_mode()?;
    let result = run_editor(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_editor(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Local mirror of what the tracker should hold, for display only
    let mut azimuth = 0.0;
    let mut elevation = 0.0;

    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
            continue;
        }

        let cmd = match code {
            KeyCode::Up | KeyCode::Char('w') => nudge(Axis::Elevation, OFFSET_INCREMENT_DEG),
            KeyCode::Down | KeyCode::Char('s') => nudge(Axis::Elevation, -OFFSET_INCREMENT_DEG),
            KeyCode::Right | KeyCode::Char('d') => nudge(Axis::Azimuth, OFFSET_INCREMENT_DEG),
            KeyCode::Left | KeyCode::Char('a') => nudge(Axis::Azimuth, -OFFSET_INCREMENT_DEG),
            KeyCode::Char('r') => TrackerCommand::ResetOffsets,
            KeyCode::Char('x') => TrackerCommand::StopTracking,
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        match cmd {
            TrackerCommand::Nudge {
                axis: Axis::Azimuth,
                delta_deg,
            } => azimuth += delta_deg,
            TrackerCommand::Nudge {
                axis: Axis::Elevation,
                delta_deg,
            } => elevation += delta_deg,
            TrackerCommand::ResetOffsets => {
                azimuth = 0.0;
                elevation = 0.0;
            }
            _ => {}
        }

        publisher.put(serde_json::to_string(&cmd)?).await?;
        // Raw mode needs an explicit carriage return
        print!("az {:+.2}°  el {:+.2}°\r\n", azimuth, elevation);

        if cmd == TrackerCommand::StopTracking {
            info!("Stop sent");
            break;
        }
    }

    Ok(())
}

fn nudge(axis: Axis, delta_deg: f64) -> TrackerCommand {
    TrackerCommand::Nudge { axis, delta_deg }
}
