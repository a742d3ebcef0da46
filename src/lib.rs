//! fleetd is a persistent endpoint agent for a fleet-management control
//! plane: it enrolls a device with a one-time token, keeps a rotating
//! access/refresh credential pair alive, polls for remote tasks, and ships
//! telemetry, device reports, and heartbeats on independent schedules.
//!
//! The [`agent::Agent`] orchestrator wires everything together; the other
//! modules are its components and can be used on their own.

pub mod agent;
pub mod config;
pub mod credentials;
pub mod error;
pub mod facts;
pub mod identity;
pub mod net;
pub mod notifications;
pub mod secrets;
pub mod tasks;

pub use agent::{Agent, ConnectionState};
pub use config::Config;
