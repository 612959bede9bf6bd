use serde_json::Value;

use crate::error::{JobError, Result};

/// Set to `"true"` in the environment of every reduce job.
pub const REDUCE_JOB_ENV: &str = "__NIMBUS_REDUCE_JOB";

/// Arranges map results into reduce calls.
///
/// Without grouping, a single call receives every result. With
/// `one_per_object` and a partitioned map job, each object gets its own call
/// receiving the contiguous slice of results produced by its partitions. Each
/// element of the returned input data is a one-element positional argument
/// list holding the group.
pub fn group_reduce_inputs(
    map_results: Vec<Value>,
    parts_per_object: Option<&[usize]>,
    one_per_object: bool,
) -> Result<Vec<Value>> {
    let parts = match parts_per_object {
        Some(parts) if one_per_object => parts,
        _ => return Ok(vec![Value::Array(vec![Value::Array(map_results)])]),
    };

    let expected: usize = parts.iter().sum();
    if expected != map_results.len() {
        return Err(JobError::invalid_arguments(format!(
            "map job produced {} results but its objects have {expected} partitions",
            map_results.len()
        )));
    }

    let mut results = map_results.into_iter();
    Ok(parts
        .iter()
        .map(|&count| {
            let group: Vec<Value> = results.by_ref().take(count).collect();
            Value::Array(vec![Value::Array(group)])
        })
        .collect())
}
