//! Device state module
//!
//! Provides the authoritative device state machine:
//! - `DeviceState`: closed set of device states
//! - `ListeningMode`: how a listening turn terminates
//! - `DeviceStateMachine`: lock-free reads, listener notification on transition

mod machine;

pub use machine::{DeviceState, DeviceStateMachine, ListeningMode};
