//! Fan-out of a job's calls over the dispatcher.
//!
//! Per-call backends receive one [`CallPayload`] per call, with at most
//! `invoke_pool_threads` invocations in flight. Whole-job backends receive a
//! single [`JobPayload`]. Either way the caller gets one result per call,
//! ordered by call index, and a failed call never affects its siblings.
use std::{collections::BTreeMap, sync::Arc};

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{Compute, InvocationMode};
use crate::{config::Config, error::DispatchError, job::JobDescriptor, payload::ByteRange};

/// What a per-call backend receives for one call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPayload {
    pub executor_id: String,
    pub job_id: String,
    pub call_id: String,
    pub call_index: usize,
    pub function_name: String,
    pub func_key: String,
    pub data_key: String,
    pub data_byte_range: ByteRange,
    pub execution_timeout: u64,
    pub extra_env: BTreeMap<String, String>,
    pub storage_bucket: String,
}

/// What a whole-job backend receives, and what gets written to a job file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub config: Config,
    pub executor_id: String,
    pub job_id: String,
    pub job_description: JobDescriptor,
}

/// A successfully started call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub call_index: usize,
    pub activation_id: String,
}

pub fn call_id(call_index: usize) -> String {
    format!("{call_index:05}")
}

pub struct Invoker {
    compute: Arc<Compute>,
    config: Arc<Config>,
}

impl Invoker {
    pub fn new(compute: Arc<Compute>, config: Arc<Config>) -> Self {
        Self { compute, config }
    }

    /// Start every call of `job`.
    #[instrument(
        skip_all,
        fields(executor_id = %job.executor_id, job_id = %job.job_id, calls = job.total_calls)
    )]
    pub async fn run(&self, job: &JobDescriptor) -> Vec<Result<Invocation, DispatchError>> {
        let results = match self.compute.invocation_mode() {
            InvocationMode::PerCall => self.run_per_call(job).await,
            InvocationMode::PerJob => self.run_per_job(job).await,
        };

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "some calls could not be dispatched");
        } else {
            info!("all calls dispatched");
        }
        results
    }

    async fn run_per_call(&self, job: &JobDescriptor) -> Vec<Result<Invocation, DispatchError>> {
        let mut results: Vec<_> = stream::iter(job.data_ranges.iter().copied().enumerate())
            .map(|(call_index, data_byte_range)| {
                let payload = CallPayload {
                    executor_id: job.executor_id.clone(),
                    job_id: job.job_id.clone(),
                    call_id: call_id(call_index),
                    call_index,
                    function_name: job.function_name.clone(),
                    func_key: job.func_key.clone(),
                    data_key: job.data_key.clone(),
                    data_byte_range,
                    execution_timeout: job.execution_timeout,
                    extra_env: job.extra_env.clone(),
                    storage_bucket: self.config.storage_bucket.clone(),
                };
                async move {
                    let result = self.dispatch(job, call_index, &payload).await;
                    (call_index, result)
                }
            })
            .buffer_unordered(job.invoke_pool_threads.max(1))
            .collect()
            .await;

        results.sort_by_key(|(call_index, _)| *call_index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    async fn run_per_job(&self, job: &JobDescriptor) -> Vec<Result<Invocation, DispatchError>> {
        let payload = JobPayload {
            config: self.config.as_ref().clone(),
            executor_id: job.executor_id.clone(),
            job_id: job.job_id.clone(),
            job_description: job.clone(),
        };
        let result = self.dispatch(job, 0, &payload).await;

        (0..job.total_calls)
            .map(|call_index| {
                result
                    .clone()
                    .map(|started| Invocation {
                        call_index,
                        activation_id: started.activation_id,
                    })
                    .map_err(|err| DispatchError { call_index, ..err })
            })
            .collect()
    }

    async fn dispatch<P: Serialize>(
        &self,
        job: &JobDescriptor,
        call_index: usize,
        payload: &P,
    ) -> Result<Invocation, DispatchError> {
        let error = |reason: String| DispatchError {
            executor_id: job.executor_id.clone(),
            job_id: job.job_id.clone(),
            call_index,
            reason,
        };

        let payload: Value = serde_json::to_value(payload).map_err(|e| error(e.to_string()))?;
        let activation_id = self
            .compute
            .invoke(&job.runtime_name, job.runtime_memory, &payload)
            .await
            .map_err(|e| error(format!("{e:#}")))?;

        Ok(Invocation {
            call_index,
            activation_id,
        })
    }
}
