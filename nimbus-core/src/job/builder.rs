use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument};

use super::{
    group_reduce_inputs, image, stringify_env, JobDescriptor, JobMetadata, JobOptions, JobState,
    REDUCE_JOB_ENV,
};
use crate::{
    common::{sizeof_fmt, JobId},
    compute::{Compute, RuntimeMeta},
    config::{Config, FunctionDelivery},
    error::{JobError, Result},
    function::{normalize_args, CallArgs, RemoteFunction},
    partitioner::create_partitions,
    payload::AggregatedPayload,
    serializer::Serializer,
    storage::{keys, InternalStorage},
    unit::{ComputationSerializer, ModuleCatalog},
};

/// Builds map and reduce jobs for one session.
///
/// The builder holds only shared, read-only state, so concurrent job
/// construction from several tasks is safe.
#[derive(Clone)]
pub struct JobBuilder {
    config: Arc<Config>,
    storage: InternalStorage,
    catalog: Arc<ModuleCatalog>,
    compute: Option<Arc<Compute>>,
}

/// A job whose calls are known, on its way through the common pipeline.
struct PendingJob<'a, F> {
    executor_id: &'a str,
    job_id: &'a JobId,
    function: &'a F,
    calls: Vec<CallArgs>,
    parts_per_object: Option<Vec<usize>>,
    runtime_meta: &'a RuntimeMeta,
    options: JobOptions,
    created: DateTime<Utc>,
    state: JobState,
}

impl JobBuilder {
    pub fn new(config: Arc<Config>, storage: InternalStorage, catalog: ModuleCatalog) -> Self {
        Self {
            config,
            storage,
            catalog: Arc::new(catalog),
            compute: None,
        }
    }

    /// The dispatcher used to build and look up runtime images. Required for
    /// image delivery.
    pub fn with_compute(mut self, compute: Arc<Compute>) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a job calling `function` once per element of `iterdata`.
    ///
    /// Returns `Ok(None)` for empty input, without touching storage.
    #[instrument(skip_all, fields(executor_id = %executor_id, job_id = %job_id, function = F::NAME))]
    pub async fn create_map_job<F: RemoteFunction>(
        &self,
        executor_id: &str,
        job_id: &JobId,
        function: &F,
        iterdata: Vec<Value>,
        runtime_meta: &RuntimeMeta,
        options: JobOptions,
    ) -> Result<Option<JobDescriptor>> {
        let created = Utc::now();
        let mut state = JobState::Created;
        if iterdata.is_empty() {
            return Ok(None);
        }

        let mut calls = normalize_args::<F>(iterdata, options.extra_args.as_ref())?;
        let mut parts_per_object = None;
        if F::is_object_processing() {
            let partitioned =
                create_partitions(self.storage.storage().as_ref(), calls, options.chunks).await?;
            calls = partitioned.calls;
            parts_per_object = Some(partitioned.parts_per_object);
            state.advance(JobState::Partitioned, executor_id, job_id.as_str());
        }

        self.build(PendingJob {
            executor_id,
            job_id,
            function,
            calls,
            parts_per_object,
            runtime_meta,
            options,
            created,
            state,
        })
        .await
    }

    /// Build a job reducing the results of `map_job`.
    ///
    /// With `reducer_one_per_object` set and a partitioned map job, one reduce
    /// call is made per input object; otherwise a single call receives every
    /// result.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(executor_id = %executor_id, job_id = %job_id, function = F::NAME))]
    pub async fn create_reduce_job<F: RemoteFunction>(
        &self,
        executor_id: &str,
        job_id: &JobId,
        function: &F,
        map_job: &JobDescriptor,
        map_results: Vec<Value>,
        runtime_meta: &RuntimeMeta,
        reducer_one_per_object: bool,
        mut options: JobOptions,
    ) -> Result<Option<JobDescriptor>> {
        let created = Utc::now();
        let iterdata = group_reduce_inputs(
            map_results,
            map_job.parts_per_object.as_deref(),
            reducer_one_per_object,
        )?;
        let calls = normalize_args::<F>(iterdata, options.extra_args.as_ref())?;
        options
            .extra_env
            .insert(REDUCE_JOB_ENV.to_string(), Value::Bool(true));

        self.build(PendingJob {
            executor_id,
            job_id,
            function,
            calls,
            parts_per_object: None,
            runtime_meta,
            options,
            created,
            state: JobState::Created,
        })
        .await
    }

    async fn build<F: RemoteFunction>(
        &self,
        mut job: PendingJob<'_, F>,
    ) -> Result<Option<JobDescriptor>> {
        if job.calls.is_empty() {
            return Ok(None);
        }
        let executor_id = job.executor_id;
        let job_id = job.job_id.as_str();
        let config = self.config.as_ref();

        let compute = match (config.function_delivery, &self.compute) {
            (FunctionDelivery::Image, None) => {
                return Err(JobError::configuration(
                    "image delivery requires a compute dispatcher",
                ))
            }
            (FunctionDelivery::Image, Some(compute)) => Some(compute),
            (FunctionDelivery::Upload, _) => None,
        };

        let execution_timeout = job
            .options
            .execution_timeout
            .unwrap_or_else(|| config.runtime_timeout.saturating_sub(5));
        if execution_timeout == 0 {
            return Err(JobError::invalid_arguments(
                "execution timeout must be positive",
            ));
        }

        let serializer = Serializer::from(config);
        let filter = config.module_filter().merge(
            job.options.include_modules.as_ref(),
            &job.options.exclude_modules,
        );
        let serialized = ComputationSerializer::new(
            serializer,
            job.runtime_meta.preinstalled_modules(),
        )
        .serialize(job.function, &job.calls, &self.catalog, &filter)
        .await?;
        job.state
            .advance(JobState::Serialized, executor_id, job_id);

        let payload = AggregatedPayload::aggregate(&serialized.call_blobs);
        let stored_unit = serialized.unit.to_bytes(serializer)?;
        let data_size_bytes = payload.len() as u64;
        let func_module_size_bytes = stored_unit.len() as u64;
        let total_size = data_size_bytes + func_module_size_bytes;

        if let Some(limit) = config.data_limit_bytes() {
            if total_size > limit {
                return Err(JobError::SizeLimitExceeded {
                    executor_id: executor_id.to_string(),
                    job_id: job_id.to_string(),
                    size: total_size,
                    limit,
                });
            }
        }
        job.state
            .advance(JobState::SizeChecked, executor_id, job_id);

        info!(
            total = %sizeof_fmt(total_size),
            "uploading function and data"
        );

        let data_key = keys::agg_data_key(executor_id, job_id);
        let (buffer, data_ranges) = payload.into_parts();
        let started = Instant::now();
        self.storage
            .put_data(&data_key, Bytes::from(buffer))
            .await
            .map_err(|source| JobError::Upload {
                key: data_key.clone(),
                source,
            })?;
        let data_upload_time = started.elapsed().as_secs_f64();

        let runtime_memory = job
            .options
            .runtime_memory
            .unwrap_or(config.runtime_memory);
        let started = Instant::now();
        let (runtime_name, func_key, image_tag) = match compute {
            None => {
                let func_key = keys::func_key(executor_id, job_id);
                self.storage
                    .put_func(&func_key, Bytes::from(stored_unit))
                    .await
                    .map_err(|source| JobError::Upload {
                        key: func_key.clone(),
                        source,
                    })?;
                (config.runtime.clone(), func_key, None)
            }
            Some(compute) => {
                let delivered = image::deliver(
                    compute,
                    config,
                    &config.runtime,
                    runtime_memory,
                    &serialized.unit,
                    &stored_unit,
                )
                .await
                .map_err(|source| JobError::Upload {
                    key: config.runtime.clone(),
                    source,
                })?;
                (
                    delivered.runtime_name,
                    String::new(),
                    Some(delivered.content_hash),
                )
            }
        };
        let func_upload_time = started.elapsed().as_secs_f64();
        job.state.advance(JobState::Uploaded, executor_id, job_id);

        let descriptor = JobDescriptor {
            executor_id: executor_id.to_string(),
            job_id: job_id.to_string(),
            runtime_name,
            runtime_memory,
            execution_timeout,
            function_name: serialized.unit.function_name.clone(),
            total_calls: data_ranges.len(),
            invoke_pool_threads: job
                .options
                .invoke_pool_threads
                .unwrap_or(config.invoke_pool_threads),
            extra_env: stringify_env(&job.options.extra_env),
            data_key,
            data_ranges,
            func_key,
            parts_per_object: job.parts_per_object,
            metadata: JobMetadata {
                job_created: job.created,
                data_size_bytes,
                func_module_size_bytes,
                data_upload_time,
                func_upload_time,
                image_tag,
            },
        };
        job.state
            .advance(JobState::Dispatchable, executor_id, job_id);

        Ok(Some(descriptor))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::{
        compute::test_utils::RecordingBackend,
        config,
        partitioner::{ChunkSpec, Partition},
        serializer::CALL_DATA_SERIALIZER,
        storage::{in_memory::InMemoryStorage, Storage},
        unit::{ModuleSelection, StoredUnit},
    };

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, name = "f", params(x))]
    struct Identity;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, name = "count", params(obj))]
    struct CountBytes;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, name = "sum", params(results))]
    struct Sum;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, name = "scaled_sum", params(results, scale))]
    struct ScaledSum;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, name = "pow", params(base, exp))]
    struct Pow;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, name = "uses_lib", params(x), modules("lib"))]
    struct UsesLib;

    async fn decoded_calls(memory: &InMemoryStorage, job: &JobDescriptor) -> Vec<Value> {
        let data = memory.get("bucket", &job.data_key).await.unwrap();
        job.data_ranges
            .iter()
            .map(|range| {
                let call: CallArgs = CALL_DATA_SERIALIZER
                    .from_bytes(range.slice(&data).unwrap())
                    .unwrap();
                Value::Object(call)
            })
            .collect()
    }

    struct Fixture {
        memory: InMemoryStorage,
        builder: JobBuilder,
    }

    fn fixture(config: Config) -> Fixture {
        let memory = InMemoryStorage::default();
        let storage = InternalStorage::new(Arc::new(memory.clone()), "bucket");
        Fixture {
            memory,
            builder: JobBuilder::new(Arc::new(config), storage, ModuleCatalog::default()),
        }
    }

    async fn map<F: RemoteFunction>(
        builder: &JobBuilder,
        function: &F,
        iterdata: Vec<Value>,
        options: JobOptions,
    ) -> Result<Option<JobDescriptor>> {
        builder
            .create_map_job(
                "exec",
                &JobId::map(0),
                function,
                iterdata,
                &RuntimeMeta::default(),
                options,
            )
            .await
    }

    #[tokio::test]
    async fn map_job_over_three_scalars() {
        let Fixture { memory, builder } = fixture(Config::default());

        let job = map(
            &builder,
            &Identity,
            vec![json!(1), json!(2), json!(3)],
            JobOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(job.total_calls, 3);
        assert_eq!(job.data_ranges.len(), 3);
        assert_eq!(job.data_key, "nimbus.jobs/exec/M000/aggdata.bin");
        assert_eq!(job.func_key, "nimbus.jobs/exec/M000/func.bin");
        assert_eq!(job.execution_timeout, 595);
        assert_eq!(job.runtime_memory, 256);
        assert_eq!(job.invoke_pool_threads, 128);
        assert!(job.parts_per_object.is_none());

        // Each range decodes to the original call.
        let data = memory.get("bucket", &job.data_key).await.unwrap();
        for (i, range) in job.data_ranges.iter().enumerate() {
            let call: CallArgs = Serializer::Cbor
                .from_bytes(range.slice(&data).unwrap())
                .unwrap();
            assert_eq!(call["x"], json!(i + 1));
        }

        let unit: StoredUnit = Serializer::Cbor
            .from_bytes(&memory.get("bucket", &job.func_key).await.unwrap())
            .unwrap();
        assert_eq!(unit.function_name, "f");
        assert_eq!(job.metadata.data_size_bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn call_data_decodes_under_every_serializer() {
        for serializer in [config::Serializer::Cbor, config::Serializer::Postcard] {
            let Fixture { memory, builder } = fixture(Config {
                serializer,
                ..Default::default()
            });

            let job = map(
                &builder,
                &Identity,
                vec![json!(1), json!({"x": {"nested": [1, "two"]}})],
                JobOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();

            assert_eq!(
                decoded_calls(&memory, &job).await,
                vec![json!({"x": 1}), json!({"x": {"nested": [1, "two"]}})]
            );
            let unit: StoredUnit = Serializer::from(serializer)
                .from_bytes(&memory.get("bucket", &job.func_key).await.unwrap())
                .unwrap();
            assert_eq!(unit.function_name, "f");
        }
    }

    #[tokio::test]
    async fn short_positional_calls_are_completed_by_extra_args() {
        let Fixture { memory, builder } = fixture(Config::default());
        let job = map(
            &builder,
            &Pow,
            vec![json!([2]), json!([3])],
            JobOptions {
                extra_args: json!({"exp": 2}).as_object().cloned(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            decoded_calls(&memory, &job).await,
            vec![json!({"base": 2, "exp": 2}), json!({"base": 3, "exp": 2})]
        );
    }

    #[tokio::test]
    async fn empty_input_yields_no_job_and_no_upload() {
        let Fixture { memory, builder } = fixture(Config::default());
        let job = map(&builder, &Identity, vec![], JobOptions::default())
            .await
            .unwrap();
        assert!(job.is_none());
        assert_eq!(memory.object_count(), 0);
    }

    #[tokio::test]
    async fn oversized_job_fails_before_upload() {
        let Fixture { memory, builder } = fixture(Config {
            data_limit: 1,
            ..Default::default()
        });
        let big = "x".repeat(2 * 1024 * 1024);

        let result = map(&builder, &Identity, vec![json!(big)], JobOptions::default()).await;

        assert!(matches!(result, Err(JobError::SizeLimitExceeded { .. })));
        assert_eq!(memory.object_count(), 0);
    }

    #[tokio::test]
    async fn zero_limit_disables_size_check() {
        let Fixture { builder, .. } = fixture(Config {
            data_limit: 0,
            ..Default::default()
        });
        let big = "x".repeat(5 * 1024 * 1024);
        assert!(map(&builder, &Identity, vec![json!(big)], JobOptions::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn invalid_arguments_fail_immediately() {
        let Fixture { memory, builder } = fixture(Config::default());
        let result = map(
            &builder,
            &Identity,
            vec![json!(1), json!(2)],
            JobOptions {
                extra_args: json!({"z": 0}).as_object().cloned(),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(JobError::InvalidArguments(_))));
        assert_eq!(memory.object_count(), 0);
    }

    #[tokio::test]
    async fn overrides_and_env_are_applied() {
        let Fixture { builder, .. } = fixture(Config::default());
        let job = map(
            &builder,
            &Identity,
            vec![json!(1)],
            JobOptions {
                runtime_memory: Some(1024),
                invoke_pool_threads: Some(4),
                execution_timeout: Some(30),
                extra_env: BTreeMap::from([("DEBUG".to_string(), json!(true))]),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(job.runtime_memory, 1024);
        assert_eq!(job.invoke_pool_threads, 4);
        assert_eq!(job.execution_timeout, 30);
        assert_eq!(job.extra_env["DEBUG"], "true");
    }

    #[tokio::test]
    async fn object_processing_jobs_are_partitioned() {
        let Fixture { memory, builder } = fixture(Config::default());
        memory
            .put("data", "a.csv", Bytes::from(vec![b'a'; 10]))
            .await
            .unwrap();
        memory
            .put("data", "b.csv", Bytes::from(vec![b'b'; 4]))
            .await
            .unwrap();

        let job = map(
            &builder,
            &CountBytes,
            vec![json!("data/a.csv"), json!("data/b.csv")],
            JobOptions {
                chunks: ChunkSpec::by_size(4),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(job.parts_per_object, Some(vec![3, 1]));
        assert_eq!(job.total_calls, 4);

        let data = memory.get("bucket", &job.data_key).await.unwrap();
        let last: CallArgs = Serializer::Cbor
            .from_bytes(job.data_ranges[3].slice(&data).unwrap())
            .unwrap();
        let partition: Partition = serde_json::from_value(last["obj"].clone()).unwrap();
        assert_eq!(partition.key, "b.csv");
        assert_eq!(partition.data_byte_range, (0, 4));
    }

    #[tokio::test]
    async fn reduce_job_groups_results_per_object() {
        let Fixture { builder, .. } = fixture(Config::default());
        let mut map_job = map(&builder, &Identity, vec![json!(1)], JobOptions::default())
            .await
            .unwrap()
            .unwrap();
        map_job.parts_per_object = Some(vec![2, 3]);
        let results: Vec<Value> = (0..5).map(|i| json!(i)).collect();

        let reduce = builder
            .create_reduce_job(
                "exec",
                &JobId::reduce(0),
                &Sum,
                &map_job,
                results.clone(),
                &RuntimeMeta::default(),
                true,
                JobOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reduce.total_calls, 2);
        assert_eq!(reduce.job_id, "R000");
        assert_eq!(reduce.extra_env[REDUCE_JOB_ENV], "true");

        let single = builder
            .create_reduce_job(
                "exec",
                &JobId::reduce(1),
                &Sum,
                &map_job,
                results,
                &RuntimeMeta::default(),
                false,
                JobOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(single.total_calls, 1);

        let mismatch = builder
            .create_reduce_job(
                "exec",
                &JobId::reduce(2),
                &Sum,
                &map_job,
                vec![json!(1)],
                &RuntimeMeta::default(),
                true,
                JobOptions::default(),
            )
            .await;
        assert!(matches!(mismatch, Err(JobError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn multi_parameter_reducers_take_extra_args() {
        let Fixture { memory, builder } = fixture(Config::default());
        let mut map_job = map(&builder, &Identity, vec![json!(1)], JobOptions::default())
            .await
            .unwrap()
            .unwrap();
        map_job.parts_per_object = Some(vec![2, 3]);

        let reduce = builder
            .create_reduce_job(
                "exec",
                &JobId::reduce(0),
                &ScaledSum,
                &map_job,
                (0..5).map(|i| json!(i)).collect(),
                &RuntimeMeta::default(),
                true,
                JobOptions {
                    extra_args: json!({"scale": 2}).as_object().cloned(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            decoded_calls(&memory, &reduce).await,
            vec![
                json!({"results": [0, 1], "scale": 2}),
                json!({"results": [2, 3, 4], "scale": 2}),
            ]
        );
    }

    #[tokio::test]
    async fn module_filters_shape_the_unit() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("core.py"), "def f(): pass").unwrap();
        let mut catalog = ModuleCatalog::default();
        catalog.insert("lib", &lib, Vec::<String>::new());

        let memory = InMemoryStorage::default();
        let storage = InternalStorage::new(Arc::new(memory.clone()), "bucket");
        let builder = JobBuilder::new(Arc::new(Config::default()), storage, catalog);

        let unit_files = |job: JobDescriptor| {
            let memory = memory.clone();
            async move {
                let unit: StoredUnit = Serializer::Cbor
                    .from_bytes(&memory.get("bucket", &job.func_key).await.unwrap())
                    .unwrap();
                let files: BTreeMap<String, Bytes> =
                    Serializer::Cbor.from_bytes(&unit.module_data).unwrap();
                files.into_keys().collect::<BTreeSet<_>>()
            }
        };

        let shipped = map(&builder, &UsesLib, vec![json!(1)], JobOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            unit_files(shipped).await,
            BTreeSet::from(["lib/core.py".to_string()])
        );

        let nothing = map(
            &builder,
            &UsesLib,
            vec![json!(1)],
            JobOptions {
                include_modules: Some(ModuleSelection::Only(BTreeSet::new())),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(unit_files(nothing).await.is_empty());

        let excluded = map(
            &builder,
            &UsesLib,
            vec![json!(1)],
            JobOptions {
                include_modules: Some(ModuleSelection::Only(BTreeSet::from(["lib".to_string()]))),
                exclude_modules: vec!["lib".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(unit_files(excluded).await.is_empty());

        // A module preinstalled in the runtime is never shipped.
        let meta: RuntimeMeta = serde_json::from_value(json!({"preinstalls": ["lib"]})).unwrap();
        let preinstalled = builder
            .create_map_job(
                "exec",
                &JobId::map(9),
                &UsesLib,
                vec![json!(1)],
                &meta,
                JobOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(unit_files(preinstalled).await.is_empty());
    }

    #[tokio::test]
    async fn image_delivery_requires_compute() {
        let Fixture { memory, builder } = fixture(Config {
            function_delivery: FunctionDelivery::Image,
            ..Default::default()
        });
        let result = map(&builder, &Identity, vec![json!(1)], JobOptions::default()).await;
        assert!(matches!(result, Err(JobError::Configuration(_))));
        assert_eq!(memory.object_count(), 0);
    }

    #[tokio::test]
    async fn image_delivery_builds_once_per_unit() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            function_delivery: FunctionDelivery::Image,
            runtime: "nimbus/runtime:3.11".to_string(),
            storage_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let backend = Arc::new(RecordingBackend::default());
        let compute = Arc::new(Compute::from_backend(Box::new(backend.clone())));
        let Fixture { memory, builder } = fixture(config);
        let builder = builder.with_compute(compute);

        let first = map(&builder, &Identity, vec![json!(1)], JobOptions::default())
            .await
            .unwrap()
            .unwrap();
        let second = map(&builder, &Identity, vec![json!(2)], JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        let tag = first.metadata.image_tag.clone().unwrap();
        assert_eq!(first.runtime_name, format!("nimbus/runtime:{tag}"));
        assert_eq!(first.runtime_name, second.runtime_name);
        assert!(first.func_key.is_empty());
        assert_eq!(backend.built.lock().unwrap().len(), 1);

        let contexts = backend.contexts.lock().unwrap().clone();
        let (dockerfile, files) = &contexts[0];
        assert!(dockerfile.starts_with("FROM nimbus/runtime:3.11"));
        assert!(files.contains(&format!("ext_mod_path/{tag}.bin")));
        assert_eq!(std::fs::read_dir(dir.path().join("images")).unwrap().count(), 0);

        // Only data blobs were stored.
        let keys = memory.list("bucket", "").await.unwrap();
        assert!(keys.iter().all(|k| k.ends_with("aggdata.bin")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_image_builds_stage_separately() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            function_delivery: FunctionDelivery::Image,
            storage_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let backend = Arc::new(RecordingBackend::default());
        let compute = Arc::new(Compute::from_backend(Box::new(backend.clone())));
        let Fixture { builder, .. } = fixture(config);
        let builder = builder.with_compute(compute);

        let (first, second) = tokio::join!(
            map(&builder, &Identity, vec![json!(1)], JobOptions::default()),
            map(&builder, &Identity, vec![json!(2)], JobOptions::default()),
        );

        let (first, second) = (first.unwrap().unwrap(), second.unwrap().unwrap());
        assert_eq!(first.runtime_name, second.runtime_name);
        for (_, files) in backend.contexts.lock().unwrap().iter() {
            assert!(files.contains(&"Dockerfile".to_string()));
        }
        assert_eq!(std::fs::read_dir(dir.path().join("images")).unwrap().count(), 0);
    }
}
