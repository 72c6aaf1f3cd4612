// --- File: crates/tutorbook_booking/src/lib.rs ---
//! Slot reservation and settlement engine.
//!
//! - [`plans`]: tutors' weekly availability and slot materialization
//! - [`reservation`]: lock → confirm for direct and package bookings, gateway outcomes
//! - [`sweeper`]: periodic reclaim of expired holds
//! - [`settlement`]: attendance confirmation and wallet recompute
//! - [`refund`]: complaints, plan-change invalidation and admin decisions
//!
//! All coordinators share one [`BookingDeps`] and are bundled in a [`BookingEngine`];
//! [`routes::routes`] exposes them over HTTP.

pub mod auth;
pub mod clock;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod money;
#[cfg(test)]
mod money_proptest;
pub mod plans;
#[cfg(test)]
mod plans_test;
pub mod refund;
pub mod reservation;
pub mod routes;
pub mod settlement;
#[cfg(test)]
mod settlement_test;
pub mod sweeper;
#[cfg(test)]
mod test_support;

pub use auth::{AuthContext, Role};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{BookingDeps, BookingEngine, BookingSettings};
pub use error::BookingError;
pub use reservation::{BookingContext, ConfirmTarget, OutcomeApplied};
pub use settlement::AttendanceParty;
pub use sweeper::{ExpirySweeper, SweepReport, SweeperHandle};
