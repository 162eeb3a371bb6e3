//! Data types shared across the event backbone
//!
//! This module contains the event, drop-accounting, and job records.

mod event;
mod job;

pub use event::{DropReason, DroppedEventRecord, StoredEvent};
pub use job::{Job, JobStatus, JobType};
