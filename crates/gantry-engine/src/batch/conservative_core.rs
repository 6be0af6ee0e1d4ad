//! Implementation of core-level conservative backfilling.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;
use tracing::info;

use super::core_timeline::CoreAvailabilityTimeline;
use super::job::BatchJob;
use super::job::HostAllocation;
use super::scheduler::BatchScheduler;
use super::scheduler::JobStart;
use super::scheduler::NodePool;
use super::scheduler::StartTimeEstimateSpec;
use crate::Result;

/// Represents a frozen core-level reservation.
#[derive(Debug, Clone)]
struct CoreReservation {
    /// The reserved start date.
    start: u64,
    /// The reserved end date.
    end: u64,
    /// The node indices the job is reserved on.
    node_indices: Vec<usize>,
}

/// A conservative backfilling policy at core granularity.
///
/// Same planning discipline as the node-level policy, but the timeline
/// tracks per-node-index core utilization, each reservation records the
/// specific node indices it covers, and host selection at start time binds
/// the job to exactly those indices.
#[derive(Debug)]
pub struct ConservativeBackfillingCoreLevelScheduler {
    /// The availability timeline the reservations live in.
    timeline: CoreAvailabilityTimeline,
    /// The number of cores on each node.
    cores_per_node: u64,
    /// The frozen reservation per job id.
    reservations: HashMap<u64, CoreReservation>,
    /// Whether an early job exit requires a compaction on the next tick.
    needs_compaction: bool,
}

impl ConservativeBackfillingCoreLevelScheduler {
    /// Creates a new policy over a cluster of the given shape.
    pub fn new(total_nodes: usize, cores_per_node: u64) -> Self {
        Self {
            timeline: CoreAvailabilityTimeline::new(total_nodes, cores_per_node),
            cores_per_node,
            reservations: HashMap::new(),
            needs_compaction: false,
        }
    }

    /// Reserves the job at its earliest feasible start time and records the
    /// reservation.
    fn reserve(&mut self, job: &Arc<BatchJob>) {
        let est = self
            .timeline
            .find_earliest_start_time(
                job.requested_time(),
                job.requested_nodes(),
                job.requested_cores_per_node(),
            )
            .ok()
            .flatten()
            .expect("admission guarantees a feasible request");

        let end = est.start + job.requested_time();
        self.timeline.add(est.start, end, job, &est.node_indices);
        self.reservations.insert(job.id(), CoreReservation {
            start: est.start,
            end,
            node_indices: est.node_indices,
        });
    }

    /// Rebuilds every queued job's reservation, in queue order.
    fn compact_schedule(&mut self, queue: &VecDeque<Arc<BatchJob>>) {
        info!("compacting schedule");

        for job in queue {
            if let Some(reservation) = self.reservations.remove(&job.id()) {
                self.timeline
                    .remove(reservation.start, reservation.end, job.id());
            }
            self.reserve(job);
        }
    }

    /// Binds a startable job to the node indices its reservation records.
    ///
    /// Returns `None` if some reserved node lacks the requested free cores.
    fn bind_reserved_hosts(&self, pool: &mut NodePool, job: &BatchJob) -> Option<HostAllocation> {
        let reservation = self.reservations.get(&job.id())?;
        let cores = job.requested_cores_per_node();

        if reservation
            .node_indices
            .iter()
            .any(|&i| pool.free_cores(i) < cores)
        {
            return None;
        }

        let ram = pool.platform().ram_per_node();
        let mut allocation = HostAllocation::new();
        for &i in &reservation.node_indices {
            pool.allocate(i, cores);
            allocation.insert(i, (cores, ram));
        }
        Some(allocation)
    }
}

impl BatchScheduler for ConservativeBackfillingCoreLevelScheduler {
    fn process_job_submission(&mut self, job: &Arc<BatchJob>, now: f64) {
        info!(
            "scheduling new job {id} that needs {nodes} nodes and {cores} cores per node",
            id = job.id(),
            nodes = job.requested_nodes(),
            cores = job.requested_cores_per_node()
        );

        self.timeline.set_time_origin(now as u64);
        self.reserve(job);

        let reservation = &self.reservations[&job.id()];
        debug!(
            "reserved job {id} on nodes {indices:?} over [{start}, {end})",
            id = job.id(),
            indices = reservation.node_indices,
            start = reservation.start,
            end = reservation.end
        );
    }

    fn process_job_completion(&mut self, job: &Arc<BatchJob>, now: f64) {
        debug!("notified of the exit of job {id}", id = job.id());

        let now = now as u64;
        self.timeline.set_time_origin(now);

        let Some(reservation) = self.reservations.remove(&job.id()) else {
            return;
        };
        self.timeline.remove(now, reservation.end, job.id());

        if now < reservation.end {
            self.needs_compaction = true;
        }
    }

    fn process_queued_jobs(
        &mut self,
        queue: &VecDeque<Arc<BatchJob>>,
        pool: &mut NodePool,
        now: f64,
    ) -> Vec<JobStart> {
        if queue.is_empty() {
            return Vec::new();
        }

        self.timeline.set_time_origin(now as u64);

        if self.needs_compaction {
            self.needs_compaction = false;
            self.compact_schedule(queue);
        }

        let mut next_jobs = self.timeline.jobs_in_first_slot();
        if next_jobs.iter().all(|j| j.has_started()) {
            self.compact_schedule(queue);
            next_jobs = self.timeline.jobs_in_first_slot();
        }

        let mut starts = Vec::new();
        for job in next_jobs {
            if job.has_started() {
                continue;
            }

            let Some(allocation) = self.bind_reserved_hosts(pool, &job) else {
                // The reserved cores are not physically free yet; an update
                // will arrive soon.
                return starts;
            };

            info!("starting job {id}", id = job.id());
            starts.push(JobStart { job, allocation });
        }

        starts
    }

    fn start_time_estimates(
        &mut self,
        specs: &[StartTimeEstimateSpec],
        _now: f64,
        _service: &str,
    ) -> Result<HashMap<String, f64>> {
        let mut estimates = HashMap::new();
        for spec in specs {
            // All cores are assumed, as reservations made on behalf of the
            // estimate would be; an oversized configuration cannot run here
            // at all, which the caller observes as a negative prediction.
            let estimate = self
                .timeline
                .find_earliest_start_time(spec.duration, spec.num_nodes, self.cores_per_node)
                .ok()
                .flatten()
                .map(|est| est.start as f64)
                .unwrap_or(-1.0);
            estimates.insert(spec.id.clone(), estimate);
        }
        Ok(estimates)
    }
}

#[cfg(test)]
mod test {
    use gantry_sim::NodeSpec;
    use gantry_sim::Platform;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::CompoundJob;

    /// Makes a pool of `n` nodes with four cores each.
    fn pool(n: usize) -> NodePool {
        let nodes = (0..n)
            .map(|i| NodeSpec::new(format!("node{i}"), 4, 1_000, 1_000, 1e9))
            .collect();
        NodePool::new(Platform::homogeneous(nodes).unwrap())
    }

    /// Makes a batch job with the given shape.
    fn job(id: u64, nodes: u64, cores: u64, time: u64) -> Arc<BatchJob> {
        BatchJob::new(
            id,
            CompoundJob::new(format!("job-{id}")),
            "you".to_string(),
            None,
            nodes,
            cores,
            time,
            0.0,
        )
    }

    #[test]
    fn jobs_share_nodes_at_core_granularity() {
        let mut scheduler = ConservativeBackfillingCoreLevelScheduler::new(2, 4);

        // Two 2-core jobs fit side by side on node 0.
        let a = job(1, 1, 2, 10);
        let b = job(2, 1, 2, 10);
        scheduler.process_job_submission(&a, 0.0);
        scheduler.process_job_submission(&b, 0.0);

        assert_eq!(scheduler.reservations[&1].node_indices, vec![0]);
        assert_eq!(scheduler.reservations[&2].node_indices, vec![0]);
        assert_eq!(scheduler.reservations[&2].start, 0);
    }

    #[test]
    fn start_binds_the_reserved_indices() {
        let mut scheduler = ConservativeBackfillingCoreLevelScheduler::new(2, 4);
        let mut pool = pool(2);

        let a = job(1, 1, 4, 10);
        let b = job(2, 1, 4, 10);
        scheduler.process_job_submission(&a, 0.0);
        scheduler.process_job_submission(&b, 0.0);

        // A reserved node 0, B reserved node 1; the starts must follow.
        let queue: VecDeque<_> = [a.clone(), b.clone()].into();
        let starts = scheduler.process_queued_jobs(&queue, &mut pool, 0.0);

        assert_eq!(starts.len(), 2);
        let by_id: HashMap<u64, Vec<usize>> = starts
            .iter()
            .map(|s| (s.job.id(), s.allocation.keys().copied().collect()))
            .collect();
        assert_eq!(by_id[&1], vec![0]);
        assert_eq!(by_id[&2], vec![1]);
        assert_eq!(pool.free_cores(0), 0);
        assert_eq!(pool.free_cores(1), 0);
    }

    #[test]
    fn compaction_rebinds_node_indices() {
        let mut scheduler = ConservativeBackfillingCoreLevelScheduler::new(2, 4);
        let mut pool = pool(2);

        // A fills node 0 and node 1; B must wait and reserves both nodes
        // at t=10.
        let a = job(1, 2, 4, 10);
        let b = job(2, 2, 2, 100);
        scheduler.process_job_submission(&a, 0.0);
        let queue: VecDeque<_> = [a.clone()].into();
        for start in scheduler.process_queued_jobs(&queue, &mut pool, 0.0) {
            start.job.start(0.0, 10.0, start.allocation);
        }
        scheduler.process_job_submission(&b, 1.0);
        assert_eq!(scheduler.reservations[&2].start, 10);

        // A exits early: B's reservation moves to t=5 on fresh indices.
        pool.release_allocation(&a.allocation().unwrap());
        scheduler.process_job_completion(&a, 5.0);
        let queue: VecDeque<_> = [b.clone()].into();
        let starts = scheduler.process_queued_jobs(&queue, &mut pool, 5.0);

        assert_eq!(scheduler.reservations[&2].start, 5);
        assert_eq!(scheduler.reservations[&2].node_indices, vec![0, 1]);
        assert_eq!(starts.len(), 1);
    }
}
