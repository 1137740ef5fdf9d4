//! Aggregator and client daemons for dropout-tolerant secure aggregation.
//!
//! One aggregator and `n` clients run a five-phase round: advertise keys,
//! share keys, masked input collection, consistency check, unmasking. Each
//! phase is a threshold barrier with an independent timeout; clients that
//! miss a phase are excluded from the rest of the round, and the round
//! still completes as long as at least `t` clients survive to the end.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod framing;
pub mod phase;
pub mod registry;
pub mod round;
