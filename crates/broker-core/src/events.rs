/// Closed set of event types the Repository accepts. Payloads are
/// free-form; only the `plan` and `status` keys are inspected for
/// derivation (see `crate::derive`).
pub const EVENT_TYPES: &[&str] = &[
    "task.created",
    "task.updated",
    "task.completed",
    "task.failed",
    "task.awaiting_approval",
    "task.approval_resolved",
    "task.artifact_generated",
    "task.file_updated",
    "plan.updated",
    "plan.step_started",
    "plan.step_completed",
    "log.entry",
];

pub fn is_known_event_type(event_type: &str) -> bool {
    EVENT_TYPES.contains(&event_type)
}
