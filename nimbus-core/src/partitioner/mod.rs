//! Splitting of stored objects into byte-range partitions.
//!
//! Object-processing functions receive an object reference in their `obj`
//! parameter. Before such a job is serialized, every reference is resolved
//! against storage and, if a [`ChunkSpec`] asks for it, split into contiguous
//! byte ranges. Each range becomes its own call, with the reference replaced
//! by a [`Partition`] describing the slice to read.
//!
//! A reference ending in `/` names a prefix and expands to every object stored
//! under it.
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    error::{JobError, Result},
    function::{CallArgs, OBJECT_PARAMETER},
    storage::{ObjectRef, Storage},
};

/// How to split each object. At most one of the two may be set; with neither
/// set, every object is processed whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// Split into chunks of this many bytes.
    pub chunk_size: Option<u64>,
    /// Split into at most this many chunks of `ceil(size / n)` bytes. Fewer
    /// partitions result when the rounded-up chunks cover the object early,
    /// e.g. a 3-byte object split into 4 yields 3 one-byte partitions.
    pub chunk_number: Option<u64>,
}

impl ChunkSpec {
    pub fn by_size(chunk_size: u64) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            chunk_number: None,
        }
    }

    pub fn by_number(chunk_number: u64) -> Self {
        Self {
            chunk_size: None,
            chunk_number: Some(chunk_number),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (self.chunk_size, self.chunk_number) {
            (Some(_), Some(_)) => Err(JobError::invalid_arguments(
                "chunk_size and chunk_number are mutually exclusive",
            )),
            (Some(0), None) => Err(JobError::invalid_arguments("chunk_size must be positive")),
            (None, Some(0)) => Err(JobError::invalid_arguments("chunk_number must be positive")),
            _ => Ok(()),
        }
    }

    /// The chunk size to apply to an object of `obj_size` bytes, if any.
    fn chunk_for(&self, obj_size: u64) -> Option<u64> {
        match (self.chunk_size, self.chunk_number) {
            (Some(size), _) => Some(size),
            (None, Some(n)) => Some(obj_size.div_ceil(n).max(1)),
            (None, None) => None,
        }
    }
}

/// One slice of a stored object, handed to the function as its `obj`
/// argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub bucket: String,
    pub key: String,
    pub obj_size: u64,
    /// Half-open `[start, end)` byte range.
    pub data_byte_range: (u64, u64),
    pub chunk_size: u64,
    pub part_number: usize,
}

/// The calls produced by partitioning.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Partitioned {
    pub calls: Vec<CallArgs>,
    /// Number of partitions of each object, in input order.
    pub parts_per_object: Vec<usize>,
}

/// Splits `[0, size)` into contiguous ranges of at most `chunk` bytes.
///
/// Objects no larger than one chunk, empty ones included, yield a single
/// range.
pub fn split_object(size: u64, chunk: Option<u64>) -> Vec<(u64, u64)> {
    match chunk {
        Some(chunk) if chunk > 0 && size > chunk => (0..size.div_ceil(chunk))
            .map(|i| (i * chunk, ((i + 1) * chunk).min(size)))
            .collect(),
        _ => vec![(0, size)],
    }
}

/// Resolves and splits the `obj` argument of every call.
#[instrument(skip_all, fields(calls = calls.len()), level = "debug")]
pub async fn create_partitions(
    storage: &dyn Storage,
    calls: Vec<CallArgs>,
    spec: ChunkSpec,
) -> Result<Partitioned> {
    spec.validate()?;
    let mut partitioned = Partitioned::default();

    for (index, call) in calls.into_iter().enumerate() {
        let reference = call
            .get(OBJECT_PARAMETER)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                JobError::invalid_arguments(format!(
                    "call {index}: `{OBJECT_PARAMETER}` must be an object reference string"
                ))
            })?;
        let object_ref = ObjectRef::parse(reference)
            .map_err(|err| JobError::invalid_arguments(format!("call {index}: {err}")))?;

        for key in resolve_keys(storage, &object_ref, reference).await? {
            let obj_size = storage.head(&object_ref.bucket, &key).await.map_err(|source| {
                JobError::ObjectUnavailable {
                    reference: format!("{}/{key}", object_ref.bucket),
                    source,
                }
            })?;

            let chunk = spec.chunk_for(obj_size);
            let ranges = split_object(obj_size, chunk);
            debug!(
                bucket = %object_ref.bucket,
                key = %key,
                obj_size,
                parts = ranges.len(),
                "partitioned object"
            );

            partitioned.parts_per_object.push(ranges.len());
            for (part_number, data_byte_range) in ranges.into_iter().enumerate() {
                let partition = Partition {
                    bucket: object_ref.bucket.clone(),
                    key: key.clone(),
                    obj_size,
                    data_byte_range,
                    chunk_size: chunk.unwrap_or(obj_size),
                    part_number,
                };
                let mut call = call.clone();
                call.insert(
                    OBJECT_PARAMETER.to_string(),
                    serde_json::to_value(partition)
                        .map_err(|err| JobError::Serialization(err.into()))?,
                );
                partitioned.calls.push(call);
            }
        }
    }

    Ok(partitioned)
}

async fn resolve_keys(
    storage: &dyn Storage,
    object_ref: &ObjectRef,
    reference: &str,
) -> Result<Vec<String>> {
    if !object_ref.is_prefix() {
        return Ok(vec![object_ref.key.clone()]);
    }

    let keys: Vec<String> = storage
        .list(&object_ref.bucket, &object_ref.key)
        .await
        .map_err(|source| JobError::ObjectUnavailable {
            reference: reference.to_string(),
            source,
        })?
        .into_iter()
        .filter(|key| !key.ends_with('/'))
        .collect();

    if keys.is_empty() {
        return Err(JobError::ObjectUnavailable {
            reference: reference.to_string(),
            source: anyhow::anyhow!("no objects under prefix"),
        });
    }
    Ok(keys)
}
