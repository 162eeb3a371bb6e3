//! Workflow pipelines
//!
//! Workflows are YAML files of ordered steps run against a session. Runs
//! persist their progress after every step, can be cancelled, and can be
//! resumed from the step where they stopped.

mod executor;
mod runner;
mod state;
mod validate;
mod workflow;

pub use executor::{PipelineExecutor, ResumeRequest, RunRequest};
pub use runner::{CommandStepRunner, StepRequest, StepRunner};
pub use state::{ExecutionState, RunStatus, StateStore, StepResult, StepStatus};
pub use validate::{validate, ValidationReport, BUILTIN_VARS};
pub use workflow::{referenced_vars, substitute, OnFailure, Step, Workflow};
