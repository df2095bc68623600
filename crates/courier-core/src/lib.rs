//! Core types and error definitions for the courier workspace.
//!
//! Everything that crosses a queue boundary lives here: the data-only
//! [`Envelope`], the validated [`QueueName`], correlation ids, and the
//! [`CourierError`] taxonomy shared by the broker and orchestration crates.
//!
//! # Main types
//!
//! - [`Envelope`]: Immutable unit of work exchanged over a queue.
//! - [`QueueName`]: Stable, validated identifier of a durable queue.
//! - [`CorrelationId`]: Identifier threading every envelope of one pipeline run.
//! - [`CourierError`]: Unified error enum for connection, queue, publish and pipeline failures.
//! - [`HandlerError`]: Failure raised while processing a single delivered message.

/// Error taxonomy and result alias.
pub mod error;
/// The envelope exchanged over queues.
pub mod envelope;
/// Queue names and correlation ids.
pub mod ids;

pub use envelope::Envelope;
pub use error::{CourierError, CourierResult, HandlerError};
pub use ids::{CorrelationId, QueueName};

/// Metadata key counting the pipeline stages an envelope has passed through (`0` for the initial input).
pub const META_STAGE_INDEX: &str = "stage_index";
/// Metadata key under which agents receive the run's correlation id.
pub const META_CORRELATION_ID: &str = "correlation_id";
/// Metadata key stamped on envelopes moved between workers by an explicit handoff.
pub const META_HANDOFF_FROM: &str = "handoff_from";
