//! Persisted schedule state
//!
//! The scheduler's in-memory job index is rebuilt from these rows at boot;
//! `next_run`/`last_run` are written back as firings occur.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::ScheduleKind;

/// Durable schedule record for one workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub kind: ScheduleKind,
    pub spec: Option<String>,
    pub timezone: String,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn for_workflow(
        workflow_id: Uuid,
        kind: ScheduleKind,
        spec: Option<String>,
        timezone: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            kind,
            spec,
            timezone: timezone.into(),
            enabled: true,
            next_run: None,
            last_run: None,
            created_at: now,
            updated_at: now,
        }
    }
}
