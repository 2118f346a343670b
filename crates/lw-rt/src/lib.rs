//! ---
//! lw_section: "01-core-functionality"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Runtime scheduling helpers for the LoadWatch loops."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Scheduling helpers shared by the measurement and detector loops.

pub mod scheduling;

pub use scheduling::RateLimiter;
