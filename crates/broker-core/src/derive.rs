use crate::model::{PlanStep, TaskStatus};
use serde_json::Value;

/// If `payload.plan` is an array, parse it into the plan steps that should
/// replace `task.plan` wholesale. Returns `None` (leave `plan` untouched)
/// when the key is absent or malformed.
///
/// Must be applied *before* [`status_from_payload`] so that a status
/// transition in the same event sees the just-updated plan.
pub fn plan_from_payload(payload: &Value) -> Option<Vec<PlanStep>> {
    let steps = payload.get("plan")?.as_array()?;
    serde_json::from_value(Value::Array(steps.clone())).ok()
}

/// If `payload.status` names a valid status, the value the task's
/// `status` field should become.
pub fn status_from_payload(payload: &Value) -> Option<TaskStatus> {
    let raw = payload.get("status")?.as_str()?;
    TaskStatus::parse(raw)
}
