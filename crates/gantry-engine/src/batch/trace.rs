//! Implementation of workload-trace ingestion and replay.
//!
//! Two trace formats are recognized by file extension: the whitespace
//! delimited standard workload format (`.swf`) and a structured format
//! (`.json`). Replay submits each historical job against the service at its
//! submit time as a compound job with a single action covering its runtime.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::bail;
use gantry_sim::SimClock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use super::BatchServiceHandle;
use crate::CompoundJob;

/// Represents one job of a workload trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceJob {
    /// The id of the job within the trace.
    pub id: String,
    /// The submit time of the job, in seconds.
    pub submit_time: f64,
    /// The actual runtime of the job, in seconds.
    pub runtime: f64,
    /// The requested runtime (walltime) of the job, in seconds.
    pub requested_runtime: f64,
    /// The requested number of nodes.
    pub requested_nodes: u64,
    /// The requested RAM per node, in bytes.
    pub requested_ram: u64,
}

/// Loads a workload trace, dispatching on the file extension.
///
/// Jobs are returned sorted by submit time. When
/// `submit_time_of_first_job` is non-negative, all submit times are shifted
/// so the first job submits at that date.
pub fn load_trace_file(
    path: &Path,
    ignore_invalid_jobs: bool,
    submit_time_of_first_job: f64,
) -> anyhow::Result<Vec<TraceJob>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read trace file `{path}`", path = path.display()))?;

    let mut jobs = match path.extension().and_then(|e| e.to_str()) {
        Some("swf") => parse_swf(&contents, ignore_invalid_jobs)?,
        Some("json") => parse_json(&contents, ignore_invalid_jobs)?,
        _ => bail!(
            "unknown trace file extension for `{path}` (expected `.swf` or `.json`)",
            path = path.display()
        ),
    };

    jobs.sort_by(|a, b| a.submit_time.total_cmp(&b.submit_time));

    if submit_time_of_first_job >= 0.0
        && let Some(first) = jobs.first().map(|j| j.submit_time)
    {
        let shift = submit_time_of_first_job - first;
        for job in &mut jobs {
            job.submit_time += shift;
        }
    }

    Ok(jobs)
}

/// Parses a trace in the standard workload format.
///
/// Lines starting with `;` are comments. Each job line carries at least 11
/// whitespace-delimited fields; the consumed ones are the job number (1),
/// submit time (2), run time (4), allocated processors (5), requested
/// processors (8), requested time (9), and requested memory (10), with `-1`
/// denoting a missing value. Missing requested processors fall back to the
/// allocated ones and a missing requested time falls back to the run time.
fn parse_swf(contents: &str, ignore_invalid_jobs: bool) -> anyhow::Result<Vec<TraceJob>> {
    let mut jobs = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        let fields: Vec<f64> = line
            .split_whitespace()
            .map(|f| f.parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("invalid field on trace line {n}", n = lineno + 1))?;

        match swf_job(&fields) {
            Ok(job) => jobs.push(job),
            Err(e) if ignore_invalid_jobs => {
                warn!("ignoring invalid job on trace line {n}: {e}", n = lineno + 1);
            }
            Err(e) => {
                return Err(e.context(format!("invalid job on trace line {n}", n = lineno + 1)));
            }
        }
    }

    Ok(jobs)
}

/// Builds a trace job from the fields of one SWF line.
fn swf_job(fields: &[f64]) -> anyhow::Result<TraceJob> {
    if fields.len() < 11 {
        bail!(
            "expected at least 11 fields, found {count}",
            count = fields.len()
        );
    }

    /// Reads a field, mapping the `-1` missing marker to `None`.
    fn field(fields: &[f64], index: usize) -> Option<f64> {
        let value = fields[index];
        (value >= 0.0).then_some(value)
    }

    let submit_time = field(fields, 1).context("missing submit time")?;
    let runtime = field(fields, 3).context("missing run time")?;
    let requested_nodes = field(fields, 7)
        .or_else(|| field(fields, 4))
        .context("missing requested and allocated processor counts")?;
    let requested_runtime = field(fields, 8).unwrap_or(runtime);
    let requested_ram = field(fields, 9).unwrap_or(0.0);

    if requested_nodes < 1.0 {
        bail!("job requests zero processors");
    }
    if requested_runtime <= 0.0 {
        bail!("job requests a non-positive runtime");
    }

    Ok(TraceJob {
        id: format!("{id}", id = fields[0] as u64),
        submit_time,
        runtime,
        requested_runtime,
        requested_nodes: requested_nodes as u64,
        requested_ram: requested_ram as u64,
    })
}

/// The serialized form of a structured trace.
#[derive(Debug, Deserialize)]
struct JsonTrace {
    /// The jobs of the trace.
    jobs: Vec<JsonTraceJob>,
}

/// The serialized form of one structured trace job.
#[derive(Debug, Deserialize)]
struct JsonTraceJob {
    /// The id of the job.
    id: serde_json::Value,
    /// The submit time, in seconds.
    submit_time: f64,
    /// The actual runtime, in seconds.
    runtime: f64,
    /// The requested runtime, in seconds; defaults to the actual runtime.
    requested_runtime: Option<f64>,
    /// The requested number of nodes.
    requested_nodes: u64,
    /// The requested RAM per node, in bytes.
    #[serde(default)]
    requested_ram: u64,
}

/// Parses a trace in the structured format.
fn parse_json(contents: &str, ignore_invalid_jobs: bool) -> anyhow::Result<Vec<TraceJob>> {
    let trace: JsonTrace =
        serde_json::from_str(contents).context("failed to parse structured trace")?;

    let mut jobs = Vec::new();
    for job in trace.jobs {
        let requested_runtime = job.requested_runtime.unwrap_or(job.runtime);
        if job.requested_nodes == 0 || requested_runtime <= 0.0 || job.submit_time < 0.0 {
            if ignore_invalid_jobs {
                warn!("ignoring invalid trace job `{id}`", id = job.id);
                continue;
            }
            bail!("invalid trace job `{id}`", id = job.id);
        }

        jobs.push(TraceJob {
            id: match &job.id {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            submit_time: job.submit_time,
            runtime: job.runtime,
            requested_runtime,
            requested_nodes: job.requested_nodes,
            requested_ram: job.requested_ram,
        });
    }

    Ok(jobs)
}

/// Replays a workload trace against a batch service.
///
/// Each job is submitted at its submit time with a single action covering
/// its runtime: a plain sleep when computation is simulated as sleep, a
/// compute action sized to the node speed otherwise. Submission failures are
/// logged and skipped, and completion notifications are drained unread.
pub(crate) async fn replay_trace(
    clock: SimClock,
    service: BatchServiceHandle,
    jobs: Vec<TraceJob>,
    cores_per_node: u64,
    speed: f64,
    use_real_runtimes_as_requested: bool,
    simulate_computation_as_sleep: bool,
) {
    info!("replaying {count} trace jobs", count = jobs.len());

    // Notifications of replayed jobs are intentionally dropped.
    let (events, _sink) = mpsc::unbounded_channel();

    for trace_job in jobs {
        clock.sleep_until(trace_job.submit_time).await;

        let job = CompoundJob::new(format!("trace_job_{id}", id = trace_job.id));
        if simulate_computation_as_sleep {
            job.add_sleep_action("work", trace_job.runtime);
        } else {
            job.add_compute_action("work", trace_job.runtime * speed, 1, trace_job.requested_ram);
        }
        job.push_callback_port(events.clone());

        let walltime = if use_real_runtimes_as_requested {
            trace_job.runtime
        } else {
            trace_job.requested_runtime
        };

        let args = HashMap::from([
            ("-N".to_string(), trace_job.requested_nodes.to_string()),
            ("-c".to_string(), cores_per_node.to_string()),
            ("-t".to_string(), (walltime.ceil() as u64).max(1).to_string()),
        ]);

        if let Err(e) = service.submit_compound_job(&job, &args).await {
            warn!(
                "failed to submit trace job `{id}`: {e}",
                id = trace_job.id
            );
        }
    }
}
