//! Core domain types for the Flywheel CI/CD persistence layer.
//!
//! This crate contains:
//! - Build identity and status types
//! - Typed build events and their wire envelopes

pub mod build;
pub mod event;

pub use build::{Build, BuildRef, BuildStatus};
pub use event::{BuildEvent, Envelope, EventType};
