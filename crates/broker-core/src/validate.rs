use crate::error::BrokerError;
use crate::model::{CreateTaskInput, TITLE_MAX_LEN, TITLE_MIN_LEN};

/// Schema checks for `Create`. Title length and `repoUrl` shape are the
/// only constraints named explicitly; everything else is accepted as-is
/// (payloads are otherwise free-form per the event taxonomy).
pub fn validate_create_input(input: &CreateTaskInput) -> Result<(), BrokerError> {
    let len = input.title.chars().count();
    if len < TITLE_MIN_LEN {
        return Err(BrokerError::invalid_input(format!(
            "title must be at least {TITLE_MIN_LEN} characters"
        )));
    }
    if len > TITLE_MAX_LEN {
        return Err(BrokerError::invalid_input(format!(
            "title must be at most {TITLE_MAX_LEN} characters"
        )));
    }

    if let Some(repo_url) = &input.repo_url {
        if url::Url::parse(repo_url).is_err() {
            return Err(BrokerError::invalid_input("repoUrl must be a valid URL"));
        }
    }

    Ok(())
}

/// Validate that an appended event's type belongs to the closed taxonomy.
pub fn validate_event_type(event_type: &str) -> Result<(), BrokerError> {
    if crate::events::is_known_event_type(event_type) {
        Ok(())
    } else {
        Err(BrokerError::invalid_input(format!(
            "unknown event type: {event_type}"
        )))
    }
}
