use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::messages::{HeartbeatRequest, ThrottleRequest};

const MAX_ID_LENGTH: usize = 256;

static ID_PATTERN: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:@/-]+$"));

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation(format!("{} cannot be empty", kind)));
    }

    if id.len() > MAX_ID_LENGTH {
        return Err(Error::Validation(format!(
            "{} cannot be longer than {} bytes",
            kind, MAX_ID_LENGTH
        )));
    }

    let pattern = ID_PATTERN
        .as_ref()
        .map_err(|e| Error::Internal(format!("Invalid id pattern: {}", e)))?;
    if !pattern.is_match(id) {
        return Err(Error::Validation(format!(
            "{} {:?} contains invalid characters",
            kind, id
        )));
    }

    Ok(())
}

pub fn validate_throttler_id(id: &str) -> Result<()> {
    validate_id("Throttler id", id)
}

pub fn validate_member_id(id: &str) -> Result<()> {
    validate_id("Member id", id)
}

pub fn validate_group_id(id: &str) -> Result<()> {
    validate_id("Group id", id)
}

pub fn validate_count(count: i64) -> Result<()> {
    if count < 0 {
        return Err(Error::Validation(format!("Count must be non-negative, got {}", count)));
    }
    Ok(())
}

pub fn validate_heartbeat(request: &HeartbeatRequest) -> Result<()> {
    validate_member_id(&request.member_id)?;
    for usage in &request.throttlers {
        validate_throttler_id(&usage.id)?;
        if !usage.usage_rate.is_finite() || usage.usage_rate < 0.0 {
            return Err(Error::Validation(format!(
                "Usage rate of throttler {:?} must be a non-negative number",
                usage.id
            )));
        }
    }
    Ok(())
}

pub fn validate_throttle(request: &ThrottleRequest) -> Result<()> {
    validate_throttler_id(&request.throttler_id)?;
    validate_count(request.count)
}
