//! ferry-core: job orchestration and transfer engine.
//!
//! Jobs flow registry -> admission queue -> retry supervisor -> transport,
//! with checkpoints for resume, a time scheduler in front and a bandwidth
//! governor pacing the read loop. `engine::Engine` ties them together.

pub mod config;
pub mod logging;

pub mod bandwidth;
pub mod checkpoint;
pub mod checksum;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch_head;
pub mod job;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod url_model;

pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus};
pub use job::{JobId, JobRequest, JobSnapshot, JobStatus, Priority};
