//! Validation of inbound TaskRequests before admission (spec §3 invariants,
//! §7 Validation error class).

use crate::constants::{
    HARD_TIMEOUT_MAX_SECS, HARD_TIMEOUT_MIN_SECS, PRIORITY_MAX, PRIORITY_MIN,
    SLICE_EXPIRATION_MAX_SECS, SLICE_EXPIRATION_MIN_SECS,
};
use crate::error::{MessError, Result};
use crate::models::TaskRequest;

pub fn validate_task_request(request: &TaskRequest) -> Result<()> {
    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&request.priority) {
        return Err(MessError::Validation(format!(
            "priority {} out of range [{PRIORITY_MIN},{PRIORITY_MAX}]",
            request.priority
        )));
    }

    if request.task_slices.is_empty() {
        return Err(MessError::Validation(
            "task_slices must be non-empty".to_string(),
        ));
    }

    for (i, slice) in request.task_slices.iter().enumerate() {
        if slice.properties.command.is_empty() {
            return Err(MessError::Validation(format!(
                "slice {i}: command must be non-empty"
            )));
        }
        if !(SLICE_EXPIRATION_MIN_SECS..=SLICE_EXPIRATION_MAX_SECS).contains(&slice.expiration) {
            return Err(MessError::Validation(format!(
                "slice {i}: expiration {} out of range [{SLICE_EXPIRATION_MIN_SECS},{SLICE_EXPIRATION_MAX_SECS}]",
                slice.expiration
            )));
        }
        if !(HARD_TIMEOUT_MIN_SECS..=HARD_TIMEOUT_MAX_SECS)
            .contains(&slice.properties.hard_timeout)
        {
            return Err(MessError::Validation(format!(
                "slice {i}: hard_timeout {} out of range [{HARD_TIMEOUT_MIN_SECS},{HARD_TIMEOUT_MAX_SECS}]",
                slice.properties.hard_timeout
            )));
        }
        if let Some(digest) = &slice.properties.input {
            if digest.hash.len() != crate::constants::DIGEST_HASH_HEX_LEN
                || !digest.hash.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(MessError::Validation(format!(
                    "slice {i}: input digest hash must be {} hex characters",
                    crate::constants::DIGEST_HASH_HEX_LEN
                )));
            }
        }
    }

    for tag in &request.tags {
        if tag.split_once(':').is_none() {
            return Err(MessError::Validation(format!(
                "tag '{tag}' is not in 'k:v' form"
            )));
        }
    }

    Ok(())
}
