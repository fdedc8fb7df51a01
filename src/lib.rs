#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! linkhub: multi-session messaging connection orchestrator.
//!
//! One operator account holds several independent linked-device sessions.
//! This crate tracks every session's state machine, mediates QR pairing,
//! supervises reconnection after drops, enforces connection limits,
//! aggregates usage metrics, and health-checks live transports in the
//! background. The messaging protocol itself, persistence, and all
//! presentation layers are injected collaborators.

pub mod activity;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use session::{SessionRecord, SessionState};
