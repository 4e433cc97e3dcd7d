// Tracking loop
// Opens and homes both stages, then every update period: drain operator commands,
// compute where the target is, apply offsets, and hand the angles to the axis workers.
// Any axis fault ends the run; there is no retry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::axis::{self, AxisHandle};
use crate::config::{AxisConfig, TOPIC_CMD_TRACKER, TOPIC_HEALTH, TOPIC_STATE_AXES, TrackerConfig};
use crate::ephemeris::{self, Ephemeris};
use crate::messages::{Axis, TrackerCommand, TrackerHealth, TrackerState};
use crate::offsets::{OffsetStore, TrackingOffsets};
use crate::stage::{SimulatedController, Stage, StageError};
use crate::tracking::pointing;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Open, initialize and home one stage. Blocking.
pub fn prepare_stage(
    axis: Axis,
    config: &AxisConfig,
    simulate: bool,
    cancel: CancellationToken,
) -> Result<Stage, StageError> {
    let settings = config.stage_settings();
    let mut stage = if simulate {
        info!("Simulating {} stage {}", axis, config.serial_number);
        let serial = config.serial_number.parse().unwrap_or_default();
        Stage::with_link(
            &config.serial_number,
            Box::new(SimulatedController::new(serial)),
            settings,
        )
    } else {
        Stage::open(&config.serial_number, settings)?
    };
    stage.set_cancel_token(cancel);

    stage.initialize()?;
    info!("Homing {} axis", axis);
    stage.home()?;
    Ok(stage)
}

async fn prepare_in_background(
    axis: Axis,
    config: AxisConfig,
    simulate: bool,
    cancel: CancellationToken,
) -> Result<Stage, BoxError> {
    let stage = tokio::task::spawn_blocking(move || prepare_stage(axis, &config, simulate, cancel))
        .await??;
    Ok(stage)
}

/// Open and home both axes concurrently; each stage is still driven by one thread only.
///
/// If either fails, `cancel` fires so the other stops homing and its stage is
/// stopped on drop before the error is returned.
pub async fn prepare_axes(
    config: &TrackerConfig,
    cancel: &CancellationToken,
) -> Result<(Stage, Stage), BoxError> {
    let prepared = tokio::try_join!(
        prepare_in_background(
            Axis::Azimuth,
            config.azimuth.clone(),
            config.simulate,
            cancel.child_token()
        ),
        prepare_in_background(
            Axis::Elevation,
            config.elevation.clone(),
            config.simulate,
            cancel.child_token()
        ),
    );

    if let Err(e) = &prepared {
        error!("Stage preparation failed, cancelling the other axis: {}", e);
        cancel.cancel();
    }
    prepared
}

/// Loop state: the single owner of the offsets and of both axis workers
pub struct Tracker {
    offsets: OffsetStore,
    ephemeris: Box<dyn Ephemeris>,
    azimuth: AxisHandle,
    elevation: AxisHandle,
}

impl Tracker {
    pub fn new(
        offsets: OffsetStore,
        ephemeris: Box<dyn Ephemeris>,
        azimuth: AxisHandle,
        elevation: AxisHandle,
    ) -> Self {
        Self {
            offsets,
            ephemeris,
            azimuth,
            elevation,
        }
    }

    /// Process an operator command. Returns true when tracking should stop.
    pub fn on_command(&mut self, cmd: &TrackerCommand) -> bool {
        info!("Received command: {:?}", cmd);
        if *cmd == TrackerCommand::StopTracking {
            return true;
        }
        if let Err(e) = self.offsets.apply(cmd) {
            warn!("Could not persist offsets: {}", e);
        }
        false
    }

    pub fn offsets(&self) -> TrackingOffsets {
        self.offsets.current()
    }

    pub fn update_period(&self) -> Duration {
        self.offsets.current().update_period()
    }

    /// First axis that has reported a fault
    pub fn fault(&self) -> Option<(Axis, String)> {
        [&self.azimuth, &self.elevation]
            .into_iter()
            .find_map(|h| h.fault().map(|f| (h.axis(), f)))
    }

    /// Compute where to point at `now` and offer the angles to the workers
    pub fn update(&mut self, now: DateTime<Utc>) -> (TrackerState, TrackerHealth) {
        let sky = self.ephemeris.locate(now);
        let offsets = self.offsets.current();

        let health = match pointing(sky, &offsets) {
            Some(targets) => {
                self.azimuth.command(targets.azimuth_deg);
                self.elevation.command(targets.elevation_deg);
                TrackerHealth::Ok
            }
            None => {
                debug!("Target below horizon (el {:.3}°), holding", sky.elevation_deg);
                TrackerHealth::BelowHorizon
            }
        };

        let state = TrackerState {
            timestamp: now,
            sky_azimuth_deg: sky.azimuth_deg,
            sky_elevation_deg: sky.elevation_deg,
            offsets,
            azimuth: self.azimuth.state(),
            elevation: self.elevation.state(),
        };
        (state, health)
    }

    /// Stop both stages and join their workers. Blocking.
    pub fn shutdown(self) {
        self.azimuth.shutdown();
        self.elevation.shutdown();
    }
}

pub async fn run(config: TrackerConfig, cancel: CancellationToken) -> Result<(), BoxError> {
    config.validate()?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_TRACKER).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE_AXES).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let offsets = OffsetStore::load(&config.offsets_path)?;
    let ephemeris = ephemeris::for_target(&config.target, config.latitude, config.longitude);
    info!(
        "Tracking {:?} from lat {:.4}, lon {:.4} ({})",
        config.target, config.latitude, config.longitude, config.time_zone
    );

    let (az_stage, el_stage) = prepare_axes(&config, &cancel).await?;

    let azimuth = axis::spawn(Axis::Azimuth, az_stage, cancel.child_token())?;
    let elevation = axis::spawn(Axis::Elevation, el_stage, cancel.child_token())?;

    let mut tracker = Tracker::new(offsets, ephemeris, azimuth, elevation);
    let mut period = tracker.update_period();
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Tracking started: every {}ms", period.as_millis());
    info!("Subscribed to: {}", TOPIC_CMD_TRACKER);
    info!("Publishing to: {}, {}", TOPIC_STATE_AXES, TOPIC_HEALTH);

    let result = loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = cancel.cancelled() => {
                info!("Tracking cancelled");
                break Ok(());
            }
        }

        // 1. Drain operator commands (non-blocking)
        let mut stop_requested = false;
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<TrackerCommand>(&payload) {
                Ok(cmd) => stop_requested |= tracker.on_command(&cmd),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }
        if stop_requested {
            info!("Tracking terminated by operator");
            break Ok(());
        }

        if tracker.update_period() != period {
            period = tracker.update_period();
            tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        // 2. Faults end the run
        if let Some((axis, fault)) = tracker.fault() {
            error!("{} axis fault, aborting tracking: {}", axis, fault);
            if let Err(e) = publish(&pub_health, &TrackerHealth::AxisFault).await {
                warn!("Failed to publish health: {}", e);
            }
            break Err(format!("{} axis fault: {}", axis, fault).into());
        }

        // 3. Compute targets and hand them out
        let (state, health) = tracker.update(Utc::now());

        // 4. Publish state and health
        if let Err(e) = publish(&pub_state, &state).await {
            break Err(e);
        }
        if let Err(e) = publish(&pub_health, &health).await {
            break Err(e);
        }
    };

    cancel.cancel();
    if let Err(e) = tokio::task::spawn_blocking(move || tracker.shutdown()).await {
        error!("Axis shutdown task failed: {}", e);
    }
    if let Err(e) = publish(&pub_health, &TrackerHealth::Stopped).await {
        warn!("Failed to publish health: {}", e);
    }
    info!("Tracking stopped");

    result
}

async fn publish<T: Serialize>(
    publisher: &zenoh::pubsub::Publisher<'_>,
    value: &T,
) -> Result<(), BoxError> {
    let json = serde_json::to_string(value)?;
    publisher.put(json).await?;
    Ok(())
}
