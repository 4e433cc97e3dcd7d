// Motorized rotation stage control over the Thorlabs APT protocol
//
// Provides:
// - APT frame codec and buffered request/response bus
// - Serial port discovery by controller serial number
// - High-level stage driver API (home, move, position, stop)
// - An in-memory controller for running without hardware

pub mod apt;
pub mod discovery;
mod driver;
pub mod link;
pub mod sim;
pub mod units;

pub use apt::{DcStatus, HwInfo, StageError, StatusBits};
pub use discovery::{DeviceInfo, list_devices};
pub use driver::{
    DEFAULT_SETTLE_TOLERANCE_DEG, HOME_TIMEOUT, MOVE_TIMEOUT, QUERY_TIMEOUT, Stage, StageSettings,
};
pub use link::{Link, SerialLink};
pub use sim::{SimBehavior, SimulatedController};
pub use units::{ScaleFactors, TravelRange};
