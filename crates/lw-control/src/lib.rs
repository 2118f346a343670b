//! ---
//! lw_section: "05-relay-control"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Relay arbitration state machine and the meter node loop."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! The firmware side of LoadWatch: one cooperative loop that measures,
//! arbitrates and switches.
//!
//! [`RelayController`] is a pure per-tick state machine, testable without a
//! runtime or a bus. [`MeterNode`] wraps it in the actual loop: acquire one
//! measurement window, service inbound queues, tick the controller, then
//! publish. Safety enforcement lives in the tick and therefore keeps
//! running when the bus is gone.

pub mod controller;
pub mod node;

pub use controller::{
    AppliedTransition, ChannelReadings, RelayController, SafetyTrip, TickOutcome, TickReadings,
    TripMetric,
};
pub use node::MeterNode;
