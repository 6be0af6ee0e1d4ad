//! Implementation of service configuration.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// The default network timeout for synchronous service calls, in seconds.
pub const DEFAULT_NETWORK_TIMEOUT: f64 = 30.0;

/// The default bandwidth of a compute node's local disk, in bytes per
/// second.
pub const DEFAULT_DISK_BANDWIDTH: f64 = 100e6;

/// Represents the scheduling algorithm of a batch compute service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSchedulingAlgorithm {
    /// First-come-first-serve.
    #[default]
    Fcfs,
    /// Conservative backfilling at node granularity.
    ConservativeBf,
    /// Conservative backfilling at core granularity.
    ConservativeBfCoreLevel,
    /// EASY backfilling without a shadow check.
    EasyBfDepth0,
    /// EASY backfilling that refuses backfills pushing the shadow job.
    EasyBfDepth1,
}

/// Represents how a batch policy picks physical hosts for a job that can
/// start now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HostSelectionAlgorithm {
    /// The first hosts, in index order, with enough free cores.
    #[default]
    #[serde(rename = "FIRSTFIT")]
    FirstFit,
    /// The feasible hosts with the least free-core slack.
    #[serde(rename = "BESTFIT")]
    BestFit,
    /// Feasible hosts starting after the previously selected one.
    #[serde(rename = "ROUNDROBIN")]
    RoundRobin,
}

/// Represents the order in which a one-shot executor runs a job's actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSelectionAlgorithm {
    /// Largest amount of work first.
    #[default]
    MaximumFlops,
    /// Largest minimum-cores requirement first.
    MaximumMinimumCores,
    /// Submission order.
    MinimumTopLevel,
}

/// Represents the configuration of a batch compute service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchServiceConfig {
    /// The scheduling algorithm.
    pub scheduling_algorithm: BatchSchedulingAlgorithm,

    /// The host selection algorithm (honored by the FCFS policy).
    pub host_selection_algorithm: HostSelectionAlgorithm,

    /// The order in which executors run a job's actions.
    pub task_selection_algorithm: TaskSelectionAlgorithm,

    /// The backfilling depth.
    pub backfilling_depth: u64,

    /// A delay, in seconds, added by the resource and job management system
    /// to every requested walltime at admission.
    pub rjms_padding_delay_seconds: u64,

    /// Whether executors simulate computation as a plain sleep.
    pub simulate_computation_as_sleep: bool,

    /// An optional workload trace whose jobs are replayed against the
    /// service.
    pub workload_trace_file: Option<PathBuf>,

    /// Whether trace replay uses each job's real runtime as its requested
    /// walltime.
    pub use_real_runtimes_as_requested: bool,

    /// Whether trace jobs exceeding the cluster's capacity are silently
    /// capped (`true`) or abort service construction (`false`).
    pub ignore_invalid_trace_jobs: bool,

    /// The submit time of the first trace job, in seconds; a negative value
    /// keeps the trace's own submit times.
    pub submit_time_of_first_trace_job: f64,

    /// The timeout for synchronous calls against the service, in seconds;
    /// `None` waits forever.
    pub network_timeout_seconds: Option<f64>,
}

impl Default for BatchServiceConfig {
    fn default() -> Self {
        Self {
            scheduling_algorithm: Default::default(),
            host_selection_algorithm: Default::default(),
            task_selection_algorithm: Default::default(),
            backfilling_depth: 0,
            rjms_padding_delay_seconds: 0,
            simulate_computation_as_sleep: false,
            workload_trace_file: None,
            use_real_runtimes_as_requested: false,
            ignore_invalid_trace_jobs: true,
            submit_time_of_first_trace_job: -1.0,
            network_timeout_seconds: Some(DEFAULT_NETWORK_TIMEOUT),
        }
    }
}

impl BatchServiceConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.network_timeout_seconds
            && !(timeout.is_finite() && timeout > 0.0)
        {
            return Err(Error::InvalidArgument(
                "the network timeout must be a positive number of seconds".to_string(),
            ));
        }

        if !self.submit_time_of_first_trace_job.is_finite() {
            return Err(Error::InvalidArgument(
                "the submit time of the first trace job must be finite".to_string(),
            ));
        }

        Ok(())
    }
}

/// Represents the scheduling policy of a serverless compute service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerlessSchedulingPolicy {
    /// First-come-first-serve image placement and binding.
    #[default]
    Fcfs,
    /// Uniformly random image placement and binding with a reproducible
    /// seed.
    Random,
    /// Proportional workload balancing across function classes.
    Balance,
}

/// Represents the configuration of a serverless compute service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerlessServiceConfig {
    /// The scheduling policy.
    pub scheduler: ServerlessSchedulingPolicy,

    /// The seed for the random policy's generator.
    pub seed: u64,

    /// The bandwidth of each compute node's local disk, in bytes per second.
    ///
    /// Image copies from the head-node cache to a node, and image loads from
    /// a node's disk into its RAM, proceed at this rate.
    pub disk_bandwidth: f64,

    /// The timeout for synchronous calls against the service, in seconds;
    /// `None` waits forever.
    pub network_timeout_seconds: Option<f64>,
}

impl Default for ServerlessServiceConfig {
    fn default() -> Self {
        Self {
            scheduler: Default::default(),
            seed: 0,
            disk_bandwidth: DEFAULT_DISK_BANDWIDTH,
            network_timeout_seconds: Some(DEFAULT_NETWORK_TIMEOUT),
        }
    }
}

impl ServerlessServiceConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.disk_bandwidth.is_finite() && self.disk_bandwidth > 0.0) {
            return Err(Error::InvalidArgument(
                "the disk bandwidth must be a positive number of bytes per second".to_string(),
            ));
        }

        if let Some(timeout) = self.network_timeout_seconds
            && !(timeout.is_finite() && timeout > 0.0)
        {
            return Err(Error::InvalidArgument(
                "the network timeout must be a positive number of seconds".to_string(),
            ));
        }

        Ok(())
    }
}
