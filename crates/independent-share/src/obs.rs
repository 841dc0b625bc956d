//! Structured lifecycle events for orchestration runs.
//!
//! Every emitter logs an `event` field so runs can be followed in JSON logs
//! (`init_tracing(LogFormat::Json, ..)`).

use tracing::{info, warn};

pub fn emit_discovery_started(host_name: &str, specifiers: usize) {
    info!(event = "discovery.started", host = %host_name, specifiers = specifiers);
}

pub fn emit_discovery_finished(share_keys: usize, requests: usize) {
    info!(event = "discovery.finished", share_keys = share_keys, requests = requests);
}

pub fn emit_job_scheduled(job_id: &str, request: &str) {
    info!(event = "job.scheduled", job = %job_id, request = %request);
}

pub fn emit_job_succeeded(job_id: &str, filename: &str, duration_ms: u64) {
    info!(
        event = "job.succeeded",
        job = %job_id,
        filename = %filename,
        duration_ms = duration_ms,
    );
}

pub fn emit_job_failed(job_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.failed", job = %job_id, error = %error);
}

pub fn emit_orchestration_finished(jobs: usize, succeeded: usize, success: bool) {
    info!(
        event = "orchestration.finished",
        jobs = jobs,
        succeeded = succeeded,
        success = success,
    );
}

pub fn emit_subbuild_closed(name: &str) {
    info!(event = "subbuild.closed", name = %name);
}
