//! Deterministic storage keys for job artifacts.
//!
//! Every artifact of a job lives under `<JOBS_PREFIX>/<executor>/<job>/`, so
//! that removing a job is a single prefix deletion.

pub const JOBS_PREFIX: &str = "nimbus.jobs";
pub const TEMP_PREFIX: &str = "nimbus.jobs/tmp";

pub const AGG_DATA_FILE: &str = "aggdata.bin";
pub const FUNC_FILE: &str = "func.bin";
pub const JOB_FILE: &str = "job.json";

/// The prefix holding every artifact of one job, with a trailing `/`.
pub fn job_prefix(executor_id: &str, job_id: &str) -> String {
    format!("{JOBS_PREFIX}/{executor_id}/{job_id}/")
}

/// The prefix holding temporary outputs of one job, with a trailing `/`.
pub fn temp_prefix(executor_id: &str, job_id: &str) -> String {
    format!("{TEMP_PREFIX}/{executor_id}/{job_id}/")
}

pub fn agg_data_key(executor_id: &str, job_id: &str) -> String {
    format!("{}{AGG_DATA_FILE}", job_prefix(executor_id, job_id))
}

pub fn func_key(executor_id: &str, job_id: &str) -> String {
    format!("{}{FUNC_FILE}", job_prefix(executor_id, job_id))
}

pub fn job_file_key(executor_id: &str, job_id: &str) -> String {
    format!("{}{JOB_FILE}", job_prefix(executor_id, job_id))
}
