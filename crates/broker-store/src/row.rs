use broker_core::model::{CreateTaskInput, StoredTask, Task};
use broker_core::{BrokerError, PlanStep, TaskStatus};
use sqlx::{postgres::PgRow, Row};

/// Classify a raw `sqlx::Error` into the broker's typed error kinds.
///
/// Decode errors indicate a bug in this crate (a row shape we didn't
/// expect), not a store outage, so they map to `Internal`; everything
/// else reaching here is treated as the store being unavailable, per the
/// "Store outage -> StoreUnavailable, callers MAY retry" contract.
pub(crate) fn store_err(err: sqlx::Error) -> BrokerError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            BrokerError::internal(err.to_string())
        }
        other => BrokerError::store_unavailable(other.to_string()),
    }
}

pub(crate) fn stored_task_from_row(row: &PgRow) -> sqlx::Result<StoredTask> {
    let status_raw: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "status".into(),
        source: format!("unrecognized status: {status_raw}").into(),
    })?;

    let plan_raw: serde_json::Value = row.try_get("plan")?;
    let plan: Vec<PlanStep> =
        serde_json::from_value(plan_raw).map_err(|err| sqlx::Error::ColumnDecode {
            index: "plan".into(),
            source: Box::new(err),
        })?;

    let constraints_raw: serde_json::Value = row.try_get("constraints")?;
    let constraints: Vec<String> =
        serde_json::from_value(constraints_raw).map_err(|err| sqlx::Error::ColumnDecode {
            index: "constraints".into(),
            source: Box::new(err),
        })?;

    let input_raw: serde_json::Value = row.try_get("input")?;
    let input: CreateTaskInput =
        serde_json::from_value(input_raw).map_err(|err| sqlx::Error::ColumnDecode {
            index: "input".into(),
            source: Box::new(err),
        })?;

    let task = Task {
        id: row.try_get("task_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        repo_url: row.try_get("repo_url")?,
        branch: row.try_get("branch")?,
        base_branch: row.try_get("base_branch")?,
        constraints,
        status,
        plan,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        assignee: row.try_get("assignee")?,
        latest_event_id: row.try_get("latest_event_id")?,
        risk_score: row.try_get("risk_score")?,
    };

    Ok(StoredTask {
        task,
        input,
        latest_stream_seq: row.try_get("latest_stream_seq")?,
    })
}
