//! Telemetry agent for a connected baby-care device.
//!
//! Readings flow from an [`source::EventSource`] into a persisted
//! [`buffer::EventBuffer`], are grouped by the [`batcher::Batcher`] under the
//! quotas enforced by [`governor::RateGovernor`], and are shipped by the
//! [`upload::UploadClient`]. A [`health::HealthMonitor`] pings the liveness
//! endpoint independently. [`scheduler::Agent`] runs all of it on three
//! periodic loops.

pub mod batcher;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod governor;
pub mod health;
pub mod lock;
pub mod paths;
pub mod scheduler;
pub mod source;
pub mod upload;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use event::{Batch, Category, Event, Reading};
pub use scheduler::Agent;
