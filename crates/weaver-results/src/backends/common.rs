//! Helpers shared by every adapter: encoding and group aggregation.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{BackendError, BackendResult, TaskState, TaskUuid};

/// Encode a record as JSON bytes.
pub(crate) fn encode<T: Serialize>(value: &T) -> BackendResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Encode a record as JSON text, for stores that keep strings.
pub(crate) fn encode_text<T: Serialize>(value: &T) -> BackendResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode JSON bytes. Numbers keep their full precision.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> BackendResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Number of fetched members that are SUCCESS or FAILURE. Missing members
/// (`None`) are not completed.
pub(crate) fn completed_count(states: &[Option<TaskState>]) -> usize {
    states
        .iter()
        .flatten()
        .filter(|state| state.is_completed())
        .count()
}

/// Turn a batch fetch (one slot per member, same order) into the member
/// states, failing on the first member without a stored state.
pub(crate) fn require_all(
    task_uuids: &[TaskUuid],
    states: Vec<Option<TaskState>>,
) -> BackendResult<Vec<TaskState>> {
    task_uuids
        .iter()
        .zip(states)
        .map(|(task_uuid, state)| {
            state.ok_or_else(|| BackendError::TaskNotFound(task_uuid.clone()))
        })
        .collect()
}
