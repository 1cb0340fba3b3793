//! `teleop-runtime` – the control loop.
//!
//! Turns the latest VR pose into a stream of robot commands at a fixed rate
//! and keeps an eye on everything else that should be publishing.
//!
//! # Modules
//!
//! - [`operator`] – [`Operator`][operator::Operator]: the per-robot state
//!   machine (`Idle → Tracking ⇄ Paused → Stopped`).  One
//!   [`tick`][operator::Operator::tick] reads the pose non-blocking,
//!   retargets, saturates through the
//!   [`SafetyLimiter`][teleop_kernel::SafetyLimiter] and yields at most one
//!   [`Command`][teleop_types::Command].
//! - [`service`] – [`OperatorService`][service::OperatorService]: the
//!   tokio task that ticks an operator on an interval, publishes commands
//!   and diagnostics, and serves the operator's control endpoint.
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: topic
//!   heartbeats fed into a [`Watchdog`][teleop_kernel::Watchdog].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Safety gating
//!
//! Every command the operator produces from a fresh pose passes the limiter
//! against the previously published payload before it reaches the bus.
//! Repeated and stale commands re-send a payload that already passed it.

pub mod operator;
pub mod service;
pub mod supervisor;
pub mod telemetry;

pub use operator::{
    Operator, OperatorConfig, OperatorDiagnostics, OperatorState, PauseReason, SolverStatus, TickReport,
    TransitionError,
};
pub use service::{OperatorService, OperatorStats, diagnostics_topic};
pub use supervisor::{HealthSnapshot, Supervisor};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
