// One worker thread per stage
//
// The worker owns its Stage outright and runs blocking moves one at a time.
// The tracking loop hands it targets through a one-slot mailbox and reads its
// state from a watch channel. At most one target is outstanding (queued or
// moving); anything offered meanwhile is dropped, never run late.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::messages::{Axis, AxisState};
use crate::stage::{Stage, StageError};

pub struct AxisHandle {
    axis: Axis,
    targets: mpsc::Sender<f64>,
    in_flight: Arc<AtomicBool>,
    state: watch::Receiver<AxisState>,
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

/// Start a worker that owns `stage`
pub fn spawn(axis: Axis, mut stage: Stage, cancel: CancellationToken) -> std::io::Result<AxisHandle> {
    let (targets_tx, targets_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(AxisState::idle(axis));

    let in_flight = Arc::new(AtomicBool::new(false));

    stage.set_cancel_token(cancel.clone());
    let worker = Worker {
        axis,
        stage,
        targets: targets_rx,
        in_flight: Arc::clone(&in_flight),
        state: state_tx,
        cancel: cancel.clone(),
    };
    let thread = std::thread::Builder::new()
        .name(format!("{}-axis", axis))
        .spawn(move || worker.run())?;

    Ok(AxisHandle {
        axis,
        targets: targets_tx,
        in_flight,
        state: state_rx,
        cancel,
        thread,
    })
}

struct Worker {
    axis: Axis,
    stage: Stage,
    targets: mpsc::Receiver<f64>,
    in_flight: Arc<AtomicBool>,
    state: watch::Sender<AxisState>,
    cancel: CancellationToken,
}

impl Worker {
    fn run(mut self) {
        let axis = self.axis;
        info!("{} worker started for stage {}", axis, self.stage.serial());

        while let Some(target) = self.targets.blocking_recv() {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state.send_modify(|s| {
                s.target_deg = Some(target);
                s.busy = true;
            });

            match self.stage.move_absolute(target) {
                Ok(position) => {
                    debug!("{} settled at {:.4}°", axis, position);
                    self.state.send_modify(|s| {
                        s.position_deg = Some(position);
                        s.busy = false;
                    });
                    self.in_flight.store(false, Ordering::Release);
                }
                Err(StageError::Cancelled) => break,
                Err(e) => {
                    error!("{} stage {} failed: {}", axis, self.stage.serial(), e);
                    self.state.send_modify(|s| {
                        s.busy = false;
                        s.fault = Some(e.to_string());
                    });
                    break;
                }
            }
        }

        self.state.send_modify(|s| s.busy = false);
        if let Err(e) = self.stage.stop() {
            warn!("{} stop on exit failed: {}", axis, e);
        }
        self.stage.close();
        info!("{} worker finished", axis);
    }
}

impl AxisHandle {
    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Offer a new target. Returns false if the previous target is still
    /// queued or moving, or the worker has exited; the target is dropped then.
    pub fn command(&self, target_deg: f64) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("{} busy, skipping target {:.4}°", self.axis, target_deg);
            return false;
        }
        match self.targets.try_send(target_deg) {
            Ok(()) => true,
            Err(_) => {
                self.in_flight.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn state(&self) -> AxisState {
        self.state.borrow().clone()
    }

    pub fn fault(&self) -> Option<String> {
        self.state.borrow().fault.clone()
    }

    /// Cancel any move in flight, stop the stage, and wait for the worker to exit
    pub fn shutdown(self) {
        let AxisHandle {
            axis,
            targets,
            cancel,
            thread,
            ..
        } = self;

        cancel.cancel();
        drop(targets);
        if thread.join().is_err() {
            error!("{} worker panicked", axis);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{SimBehavior, SimulatedController, StageSettings};
    use std::time::{Duration, Instant};

    fn wait_for(handle: &AxisHandle, done: impl Fn(&AxisState) -> bool) -> AxisState {
        let started = Instant::now();
        loop {
            let state = handle.state();
            if done(&state) || started.elapsed() > Duration::from_secs(5) {
                return state;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn sim_stage(behavior: SimBehavior, travel_max: f64) -> Stage {
        let settings = StageSettings {
            travel: crate::stage::TravelRange::new(0.0, travel_max),
            move_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(1),
            ..StageSettings::default()
        };
        let link = SimulatedController::with_behavior(27000002, behavior);
        Stage::with_link("27000002", Box::new(link), settings)
    }

    #[test]
    fn test_worker_moves_to_target() {
        let handle = spawn(
            Axis::Azimuth,
            sim_stage(SimBehavior::default(), 180.0),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(handle.command(42.0));
        let state = wait_for(&handle, |s| s.position_deg.is_some());
        assert!((state.position_deg.unwrap() - 42.0).abs() < 0.01);
        assert_eq!(state.target_deg, Some(42.0));
        assert!(state.fault.is_none());

        handle.shutdown();
    }

    #[test]
    fn test_targets_offered_during_a_move_are_dropped() {
        let behavior = SimBehavior {
            move_latency: 100,
            ..SimBehavior::default()
        };
        let handle = spawn(Axis::Azimuth, sim_stage(behavior, 180.0), CancellationToken::new()).unwrap();

        assert!(handle.command(10.0));
        assert!(!handle.command(20.0));
        assert!(!handle.command(30.0));

        let state = wait_for(&handle, |s| s.position_deg.is_some());
        assert!((state.position_deg.unwrap() - 10.0).abs() < 0.01);

        // Nothing stale runs after the first move finishes
        std::thread::sleep(Duration::from_millis(200));
        let state = handle.state();
        assert_eq!(state.target_deg, Some(10.0));
        assert!(!state.busy);

        assert!(handle.command(40.0));
        let state = wait_for(&handle, |s| s.position_deg.is_some_and(|p| (p - 40.0).abs() < 0.01));
        assert_eq!(state.target_deg, Some(40.0));

        handle.shutdown();
    }

    #[test]
    fn test_out_of_range_target_faults_axis() {
        let handle = spawn(
            Axis::Elevation,
            sim_stage(SimBehavior::default(), 90.0),
            CancellationToken::new(),
        )
        .unwrap();

        handle.command(95.0);
        let state = wait_for(&handle, |s| s.fault.is_some());
        assert!(state.fault.unwrap().contains("outside the travel range"));

        handle.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_move_in_flight() {
        let behavior = SimBehavior {
            move_latency: u32::MAX,
            ..SimBehavior::default()
        };
        let handle = spawn(Axis::Azimuth, sim_stage(behavior, 180.0), CancellationToken::new()).unwrap();

        handle.command(10.0);
        wait_for(&handle, |s| s.busy);

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
