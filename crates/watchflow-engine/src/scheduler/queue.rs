//! Priority-ordered ready queue with per-workflow coalescing
//!
//! At most one pending item per workflow sits in the queue at any time,
//! and a workflow with a run in flight is never dispatched again until
//! the run finishes. The queue mutex is strictly bounded: no I/O happens
//! while it is held.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use watchflow_core::model::RunTrigger;

/// Default priorities: scheduled 5, chain/event 3, manual/once 10
pub fn default_priority(trigger: RunTrigger) -> u8 {
    match trigger {
        RunTrigger::Manual => 10,
        RunTrigger::Chain | RunTrigger::Event => 3,
        _ => 5,
    }
}

/// A ready run request produced by the scheduler or the trigger router
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow_id: Uuid,
    pub trigger: RunTrigger,
    pub triggered_by: Option<String>,
    pub data: Option<Value>,
    /// 1..=10, higher dispatches first
    pub priority: u8,
    pub scheduled_time: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl RunRequest {
    pub fn new(workflow_id: Uuid, trigger: RunTrigger) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            trigger,
            triggered_by: None,
            data: None,
            priority: default_priority(trigger),
            scheduled_time: now,
            enqueued_at: now,
        }
    }

    pub fn with_triggered_by(mut self, by: impl Into<String>) -> Self {
        self.triggered_by = Some(by.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = at;
        self
    }
}

struct QueueItem(RunRequest);

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.enqueued_at == other.0.enqueued_at
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then FIFO on enqueue time
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.enqueued_at.cmp(&self.0.enqueued_at))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueueItem>,
    queued: HashSet<Uuid>,
    in_flight: HashSet<Uuid>,
}

/// The shared ready queue
#[derive(Default)]
pub struct RunQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request; returns false when coalesced with an existing
    /// pending item for the same workflow
    pub fn enqueue(&self, request: RunRequest) -> bool {
        let inserted = {
            let mut inner = self.inner.lock();
            if inner.queued.contains(&request.workflow_id) {
                false
            } else {
                inner.queued.insert(request.workflow_id);
                inner.heap.push(QueueItem(request));
                true
            }
        };
        if inserted {
            self.notify.notify_one();
        }
        inserted
    }

    /// Pop the highest-priority request whose workflow is not in flight,
    /// respecting the concurrency cap
    pub fn pop_ready(&self, max_in_flight: usize) -> Option<RunRequest> {
        let mut inner = self.inner.lock();
        if inner.in_flight.len() >= max_in_flight {
            return None;
        }
        let mut deferred = Vec::new();
        let mut found = None;
        while let Some(item) = inner.heap.pop() {
            if inner.in_flight.contains(&item.0.workflow_id) {
                deferred.push(item);
            } else {
                found = Some(item);
                break;
            }
        }
        for item in deferred {
            inner.heap.push(item);
        }
        let item = found?;
        inner.queued.remove(&item.0.workflow_id);
        inner.in_flight.insert(item.0.workflow_id);
        Some(item.0)
    }

    /// Release the workflow's dispatch slot
    pub fn mark_done(&self, workflow_id: Uuid) {
        {
            let mut inner = self.inner.lock();
            inner.in_flight.remove(&workflow_id);
        }
        self.notify.notify_one();
    }

    /// Drop any pending item for the workflow (unschedule path)
    pub fn remove_workflow(&self, workflow_id: Uuid) {
        let mut inner = self.inner.lock();
        if inner.queued.remove(&workflow_id) {
            let remaining: Vec<QueueItem> = inner
                .heap
                .drain()
                .filter(|item| item.0.workflow_id != workflow_id)
                .collect();
            inner.heap.extend(remaining);
        }
    }

    /// Wait for an enqueue or a freed slot
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}
