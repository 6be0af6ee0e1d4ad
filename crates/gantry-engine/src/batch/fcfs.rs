//! Implementation of the FCFS batch scheduling policy.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use super::job::BatchJob;
use super::job::HostAllocation;
use super::scheduler::BatchScheduler;
use super::scheduler::JobStart;
use super::scheduler::NodePool;
use super::scheduler::StartTimeEstimateSpec;
use super::scheduler::select_hosts_best_fit;
use super::scheduler::select_hosts_first_fit;
use super::scheduler::select_hosts_round_robin;
use crate::Error;
use crate::Result;
use crate::config::HostSelectionAlgorithm;

/// A first-come-first-serve batch scheduling policy.
///
/// On each tick, jobs start in queue order for as long as the next one fits
/// on the cluster right now; the first job that does not fit blocks the rest
/// of the queue. No timeline is kept, so completions and failures require no
/// bookkeeping here.
///
/// Unlike the backfilling policies, FCFS allocates exactly the requested
/// cores per node, so jobs may share nodes, and it honors the configured
/// host selection algorithm.
#[derive(Debug)]
pub struct FcfsBatchScheduler {
    /// How physical hosts are picked for a startable job.
    host_selection: HostSelectionAlgorithm,
    /// The cursor of the round-robin host selection.
    round_robin_cursor: usize,
}

impl FcfsBatchScheduler {
    /// Creates a new FCFS policy with the given host selection algorithm.
    pub fn new(host_selection: HostSelectionAlgorithm) -> Self {
        Self {
            host_selection,
            // Wraps to node 0 on the first selection.
            round_robin_cursor: usize::MAX,
        }
    }

    /// Picks hosts for a job that can start now, committing the allocation
    /// in the pool.
    fn schedule_on_hosts(&mut self, pool: &mut NodePool, job: &BatchJob) -> Option<HostAllocation> {
        let ram = pool.platform().ram_per_node();
        let nodes = job.requested_nodes();
        let cores = job.requested_cores_per_node();

        match self.host_selection {
            HostSelectionAlgorithm::FirstFit => select_hosts_first_fit(pool, nodes, cores, ram),
            HostSelectionAlgorithm::BestFit => select_hosts_best_fit(pool, nodes, cores, ram),
            HostSelectionAlgorithm::RoundRobin => {
                select_hosts_round_robin(pool, &mut self.round_robin_cursor, nodes, cores, ram)
            }
        }
    }
}

impl BatchScheduler for FcfsBatchScheduler {
    fn process_job_submission(&mut self, job: &Arc<BatchJob>, _now: f64) {
        debug!(
            "arrival of job {id} needing {nodes} nodes",
            id = job.id(),
            nodes = job.requested_nodes()
        );
    }

    fn process_job_completion(&mut self, _job: &Arc<BatchJob>, _now: f64) {}

    fn process_queued_jobs(
        &mut self,
        queue: &VecDeque<Arc<BatchJob>>,
        pool: &mut NodePool,
        _now: f64,
    ) -> Vec<JobStart> {
        let mut starts = Vec::new();

        for job in queue {
            if job.has_started() {
                continue;
            }

            match self.schedule_on_hosts(pool, job) {
                Some(allocation) => starts.push(JobStart {
                    job: job.clone(),
                    allocation,
                }),
                // The head of the queue blocks everything behind it.
                None => break,
            }
        }

        starts
    }

    fn start_time_estimates(
        &mut self,
        _specs: &[StartTimeEstimateSpec],
        _now: f64,
        service: &str,
    ) -> Result<HashMap<String, f64>> {
        Err(Error::FunctionalityNotAvailable {
            service: service.to_string(),
            what: "start time estimates".to_string(),
        })
    }
}
