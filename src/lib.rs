pub mod axis;
pub mod config;
pub mod ephemeris;
pub mod messages;
pub mod offsets;
pub mod runtime;
pub mod stage;
pub mod tracking;
pub mod wait;
