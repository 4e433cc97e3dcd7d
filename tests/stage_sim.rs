// Stage driver against the in-memory controller

use kinesis_tracker::stage::apt::MessageId;
use kinesis_tracker::stage::sim::SimLog;
use kinesis_tracker::stage::{
    SimBehavior, SimulatedController, Stage, StageError, StageSettings, StatusBits, TravelRange,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const SERIAL: u32 = 27005349;

fn settings(travel_max: f64) -> StageSettings {
    StageSettings {
        travel: TravelRange::new(0.0, travel_max),
        home_timeout: Duration::from_millis(300),
        move_timeout: Duration::from_millis(300),
        query_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(1),
        ..StageSettings::default()
    }
}

fn sim_stage(behavior: SimBehavior, travel_max: f64) -> (Stage, SimLog) {
    let sim = SimulatedController::with_behavior(SERIAL, behavior);
    let log = sim.log();
    let stage = Stage::with_link(&SERIAL.to_string(), Box::new(sim), settings(travel_max));
    (stage, log)
}

fn sent(log: &SimLog, id: MessageId) -> usize {
    log.lock().unwrap().iter().filter(|m| **m == id).count()
}

#[test]
fn test_initialize_and_home() {
    let (mut stage, _log) = sim_stage(SimBehavior::default(), 180.0);
    stage.initialize().unwrap();
    stage.home().unwrap();

    let status = stage.status().unwrap();
    assert!(status.status.contains(StatusBits::HOMED | StatusBits::CHANNEL_ENABLED));
    assert!(!status.is_moving());
    assert_eq!(stage.position().unwrap(), 0.0);

    let info = stage.hardware_info().unwrap();
    assert_eq!(info.serial_number, SERIAL);
    assert_eq!(info.model, "KDC101");
}

#[test]
fn test_move_settles_within_tolerance() {
    let (mut stage, _log) = sim_stage(SimBehavior::default(), 180.0);
    stage.initialize().unwrap();
    stage.home().unwrap();

    for target in [0.0, 12.345, 90.0, 179.99, 180.0] {
        let settled = stage.move_absolute(target).unwrap();
        let tolerance = stage.settings().settle_tolerance_deg;
        assert!((settled - target).abs() <= tolerance, "{} -> {}", target, settled);
        assert!((stage.position().unwrap() - target).abs() <= tolerance);
        assert!((stage.encoder_position().unwrap() - target).abs() <= tolerance);
    }
}

#[test]
fn test_move_reports_actual_settled_position() {
    // About half a degree short of the command
    let behavior = SimBehavior {
        settle_error_counts: -1000,
        ..SimBehavior::default()
    };
    let (mut stage, _log) = sim_stage(behavior, 180.0);
    let settled = stage.move_absolute(45.0).unwrap();
    assert!(settled < 45.0 - stage.settings().settle_tolerance_deg);
    assert_eq!(settled, stage.position().unwrap());
}

#[test]
fn test_out_of_range_rejected_before_sending() {
    let (mut stage, log) = sim_stage(SimBehavior::default(), 90.0);

    for bad in [95.0, 90.0001, -0.001, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        match stage.move_absolute(bad) {
            Err(StageError::OutOfRange { min, max, .. }) => {
                assert_eq!(min, 0.0);
                assert_eq!(max, 90.0);
            }
            other => panic!("{} gave {:?}", bad, other),
        }
    }
    assert_eq!(sent(&log, MessageId::MotMoveAbsolute), 0);

    // Both ends of the travel are legal
    stage.move_absolute(0.0).unwrap();
    stage.move_absolute(90.0).unwrap();
    assert_eq!(sent(&log, MessageId::MotMoveAbsolute), 2);
}

#[test]
fn test_silent_controller_times_out() {
    let behavior = SimBehavior {
        silent: true,
        ..SimBehavior::default()
    };
    let (mut stage, _log) = sim_stage(behavior, 180.0);

    let started = Instant::now();
    match stage.home() {
        Err(StageError::Timeout { after, .. }) => assert_eq!(after, Duration::from_millis(300)),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(matches!(stage.position(), Err(StageError::Timeout { .. })));
    assert!(matches!(stage.move_absolute(10.0), Err(StageError::Timeout { .. })));
}

#[test]
fn test_truncated_reply_times_out() {
    let behavior = SimBehavior {
        truncate_replies: 3,
        ..SimBehavior::default()
    };
    let (mut stage, _log) = sim_stage(behavior, 180.0);
    assert!(matches!(stage.position(), Err(StageError::Timeout { .. })));
    assert!(matches!(stage.hardware_info(), Err(StageError::Timeout { .. })));
}

#[test]
fn test_controller_fault_on_home() {
    let behavior = SimBehavior {
        fault_on: Some(MessageId::MotMoveHome),
        ..SimBehavior::default()
    };
    let (mut stage, _log) = sim_stage(behavior, 180.0);
    match stage.home() {
        Err(StageError::Controller { code, message }) => {
            assert_eq!(code, 0x0029);
            assert!(message.contains("motion error"));
        }
        other => panic!("expected controller fault, got {:?}", other),
    }
}

#[test]
fn test_slow_completion_still_succeeds() {
    let behavior = SimBehavior {
        home_latency: 20,
        move_latency: 20,
        ..SimBehavior::default()
    };
    let (mut stage, _log) = sim_stage(behavior, 180.0);
    stage.home().unwrap();
    let settled = stage.move_absolute(33.0).unwrap();
    assert!((settled - 33.0).abs() < 0.01);
}

#[test]
fn test_stop_does_not_wait() {
    let behavior = SimBehavior {
        silent: true,
        ..SimBehavior::default()
    };
    let (mut stage, log) = sim_stage(behavior, 180.0);

    let started = Instant::now();
    stage.stop().unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(sent(&log, MessageId::MotMoveStop), 1);
}

#[test]
fn test_cancel_aborts_move_in_flight() {
    let sim = SimulatedController::with_behavior(
        SERIAL,
        SimBehavior {
            move_latency: u32::MAX,
            ..SimBehavior::default()
        },
    );
    let slow = StageSettings {
        move_timeout: Duration::from_secs(30),
        ..settings(180.0)
    };
    let mut stage = Stage::with_link(&SERIAL.to_string(), Box::new(sim), slow);

    let cancel = CancellationToken::new();
    stage.set_cancel_token(cancel.clone());
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
    });

    let started = Instant::now();
    assert!(matches!(stage.move_absolute(120.0), Err(StageError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    canceller.join().unwrap();
}

#[test]
fn test_status_acknowledged_before_fiftieth_command() {
    let (mut stage, log) = sim_stage(SimBehavior::default(), 180.0);
    for _ in 0..200 {
        stage.position().unwrap();
    }

    let log = log.lock().unwrap();
    let mut since_ack = 0;
    for id in log.iter() {
        if *id == MessageId::MotAckDcStatusUpdate {
            since_ack = 0;
        } else {
            since_ack += 1;
            assert!(since_ack < 50, "{} commands without acknowledgement", since_ack);
        }
    }
    assert!(log.contains(&MessageId::MotAckDcStatusUpdate));
}

#[test]
fn test_drop_stops_stage() {
    let (stage, log) = sim_stage(SimBehavior::default(), 180.0);
    stage.close();
    assert_eq!(log.lock().unwrap().last(), Some(&MessageId::MotMoveStop));
}
