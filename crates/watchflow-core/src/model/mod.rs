// Domain entities
//
// Every identifier is a UUID v7 (time-ordered); all instants are UTC.
// Wire representations are snake_case throughout.

mod action;
mod change;
mod run;
mod schedule;
mod step;
mod trigger;
mod workflow;

pub use action::{Action, ActionKind, ActionOutcome, ActionRecord};
pub use change::{
    CaptureMethod, Change, ChangeKind, ChangeSeverity, ContentSnapshot, PageMetadata,
};
pub use run::{Run, RunStatus, RunTrigger};
pub use schedule::Schedule;
pub use step::{Playbook, StepDefinition, StepKind, StepState, StepStatus};
pub use trigger::{Trigger, TriggerConfig, TriggerKind};
pub use workflow::{
    ChangeDetectionConfig, ExecutionConfig, RateLimitConfig, ScheduleKind, Workflow,
    WorkflowMetrics, WorkflowStatus,
};
