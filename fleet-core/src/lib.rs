//! Fleet core.
//!
//! The cluster configuration convergence engine of a scheduler fleet: units publish facts, the
//! controller derives a node catalog and a partition plan from them, composes one authoritative
//! configuration document, and drives an ordered rollout of every change to the fleet's daemons.
//! Everything in this crate is free of I/O; the operator daemon supplies facts, leadership and
//! a clock.

pub mod apply;
pub mod catalog;
pub mod composer;
pub mod convergence;
pub mod error;
pub mod facts;
#[cfg(test)]
mod facts_test;
pub mod failover;
#[cfg(test)]
mod failover_test;
#[cfg(test)]
mod fixtures;
pub mod health;
#[cfg(test)]
mod health_test;
pub mod planner;

pub use error::{AppError, AppResult};
pub use facts::{Fact, FactStore, Role};
