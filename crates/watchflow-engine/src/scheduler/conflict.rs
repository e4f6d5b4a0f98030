//! Temporal conflict detection between workflow schedules

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Firings closer than this are reported as conflicts
pub const CONFLICT_WINDOW_SECONDS: i64 = 5 * 60;

/// How tight the collision is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    High,
    Medium,
    Low,
}

impl ConflictSeverity {
    pub fn from_gap(gap: Duration) -> Self {
        if gap.num_seconds() < 60 {
            ConflictSeverity::High
        } else if gap.num_seconds() < 3 * 60 {
            ConflictSeverity::Medium
        } else {
            ConflictSeverity::Low
        }
    }
}

/// Two workflows firing too close together
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleConflict {
    pub workflow_a: Uuid,
    pub workflow_b: Uuid,
    pub time_a: DateTime<Utc>,
    pub time_b: DateTime<Utc>,
    pub gap_seconds: i64,
    pub severity: ConflictSeverity,
}

/// Pair the target's firings against every other workflow's firings
pub fn find_conflicts(
    target: Uuid,
    target_times: &[DateTime<Utc>],
    others: &[(Uuid, Vec<DateTime<Utc>>)],
) -> Vec<ScheduleConflict> {
    let mut conflicts = Vec::new();
    for (other_id, other_times) in others {
        if *other_id == target {
            continue;
        }
        for &time_a in target_times {
            for &time_b in other_times {
                let gap = (time_a - time_b).abs();
                if gap.num_seconds() < CONFLICT_WINDOW_SECONDS {
                    conflicts.push(ScheduleConflict {
                        workflow_a: target,
                        workflow_b: *other_id,
                        time_a,
                        time_b,
                        gap_seconds: gap.num_seconds(),
                        severity: ConflictSeverity::from_gap(gap),
                    });
                }
            }
        }
    }
    conflicts.sort_by_key(|c| c.time_a);
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_severity_buckets() {
        assert_eq!(
            ConflictSeverity::from_gap(Duration::seconds(30)),
            ConflictSeverity::High
        );
        assert_eq!(
            ConflictSeverity::from_gap(Duration::seconds(150)),
            ConflictSeverity::Medium
        );
        assert_eq!(
            ConflictSeverity::from_gap(Duration::seconds(250)),
            ConflictSeverity::Low
        );
    }

    #[test]
    fn test_pairs_within_window_only() {
        let target = Uuid::now_v7();
        let other = Uuid::now_v7();
        let base = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();

        let conflicts = find_conflicts(
            target,
            &[base],
            &[(
                other,
                vec![
                    base + Duration::seconds(30),  // high
                    base + Duration::minutes(2),   // medium
                    base + Duration::minutes(10),  // outside window
                ],
            )],
        );

        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].severity, ConflictSeverity::High);
        assert_eq!(conflicts[1].severity, ConflictSeverity::Medium);
    }

    #[test]
    fn test_self_is_skipped() {
        let target = Uuid::now_v7();
        let base = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let conflicts = find_conflicts(target, &[base], &[(target, vec![base])]);
        assert!(conflicts.is_empty());
    }
}
