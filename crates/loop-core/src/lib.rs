pub mod config;
pub mod dag;
pub mod events;
pub mod prompt;
pub mod spec_header;
pub mod types;

pub use config::Config;
pub use dag::{build_snapshot, compute_levels, validate as validate_dag, DagError};
pub use events::{Event, EventPayload, EventType};
pub use spec_header::{SpecFile, SpecHeaderError, TaskHeader, UnitHeader};
pub use types::{
    GraphSnapshot, Id, MergeStrategy, PullRequest, ReviewState, Run, RunStatus, Task, TaskStatus,
    Unit, UnitStatus,
};
