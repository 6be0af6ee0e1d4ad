//! Implementation of node-level conservative backfilling.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;
use tracing::info;

use super::job::BatchJob;
use super::scheduler::BatchScheduler;
use super::scheduler::JobStart;
use super::scheduler::NodePool;
use super::scheduler::StartTimeEstimateSpec;
use super::scheduler::select_hosts_first_fit;
use super::timeline::NodeAvailabilityTimeline;
use crate::Result;

/// A conservative backfilling policy at node granularity.
///
/// Every admitted job is placed at its earliest feasible start time in the
/// availability timeline, and that reservation is frozen: later arrivals can
/// only fill holes the reservation leaves open. When capacity frees up
/// earlier than expected, the schedule is *compacted*: every queued job's
/// reservation is rebuilt, in queue order, at its new earliest feasible
/// time. Compaction never postpones a reservation, because each job is
/// re-inserted into a timeline holding at most the jobs that previously
/// preceded it.
#[derive(Debug)]
pub struct ConservativeBackfillingBatchScheduler {
    /// The availability timeline the reservations live in.
    timeline: NodeAvailabilityTimeline,
    /// The frozen reservation per job id: (start date, end date).
    reservations: HashMap<u64, (u64, u64)>,
    /// Whether an early job exit requires a compaction on the next tick.
    needs_compaction: bool,
}

impl ConservativeBackfillingBatchScheduler {
    /// Creates a new policy over a cluster of the given size.
    pub fn new(total_nodes: u64) -> Self {
        Self {
            timeline: NodeAvailabilityTimeline::new(total_nodes),
            reservations: HashMap::new(),
            needs_compaction: false,
        }
    }

    /// Rebuilds every queued job's reservation at its earliest feasible
    /// start time, in queue order.
    fn compact_schedule(&mut self, queue: &VecDeque<Arc<BatchJob>>) {
        info!("compacting schedule");

        for job in queue {
            if let Some((start, end)) = self.reservations.remove(&job.id()) {
                self.timeline.remove(start, end, job.id());
            }

            let est = self
                .timeline
                .find_earliest_start_time(job.requested_time(), job.requested_nodes())
                .ok()
                .flatten()
                .expect("admission guarantees a feasible request");
            let end = est.start + job.requested_time();
            self.timeline.add(est.start, end, job);
            self.reservations.insert(job.id(), (est.start, end));
        }
    }
}

impl BatchScheduler for ConservativeBackfillingBatchScheduler {
    fn process_job_submission(&mut self, job: &Arc<BatchJob>, now: f64) {
        info!(
            "scheduling new job {id} that needs {nodes} nodes",
            id = job.id(),
            nodes = job.requested_nodes()
        );

        self.timeline.set_time_origin(now as u64);

        let est = self
            .timeline
            .find_earliest_start_time(job.requested_time(), job.requested_nodes())
            .ok()
            .flatten()
            .expect("admission guarantees a feasible request");
        let end = est.start + job.requested_time();
        self.timeline.add(est.start, end, job);
        self.reservations.insert(job.id(), (est.start, end));

        debug!(
            "reserved job {id} on {nodes} nodes over [{start}, {end})",
            id = job.id(),
            nodes = job.requested_nodes(),
            start = est.start,
        );
    }

    fn process_job_completion(&mut self, job: &Arc<BatchJob>, now: f64) {
        debug!("notified of the exit of job {id}", id = job.id());

        let now = now as u64;
        self.timeline.set_time_origin(now);

        let Some((_, end)) = self.reservations.remove(&job.id()) else {
            return;
        };
        self.timeline.remove(now, end, job.id());

        // An exit before the reserved end frees capacity other reservations
        // can move into.
        if now < end {
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

        // The whole node goes to a job at this granularity.
        let all_cores = pool.cores_per_node();
        let all_ram = pool.platform().ram_per_node();

        let mut starts = Vec::new();
        for job in next_jobs {
            if job.has_started() {
                continue;
            }

            let Some(allocation) =
                select_hosts_first_fit(pool, job.requested_nodes(), all_cores, all_ram)
            else {
                // The resources are not physically free yet; an update will
                // arrive soon.
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
            // An oversized configuration cannot run here at all, which the
            // caller observes as a negative prediction.
            let estimate = self
                .timeline
                .find_earliest_start_time(spec.duration, spec.num_nodes)
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

    /// Makes a pool of `n` single-core nodes.
    fn pool(n: usize) -> NodePool {
        let nodes = (0..n)
            .map(|i| NodeSpec::new(format!("node{i}"), 1, 1_000, 1_000, 1e9))
            .collect();
        NodePool::new(Platform::homogeneous(nodes).unwrap())
    }

    /// Makes a batch job with the given id, node count, and walltime.
    fn job(id: u64, nodes: u64, time: u64) -> Arc<BatchJob> {
        BatchJob::new(
            id,
            CompoundJob::new(format!("job-{id}")),
            "you".to_string(),
            None,
            nodes,
            1,
            time,
            0.0,
        )
    }

    #[test]
    fn submissions_reserve_earliest_feasible_windows() {
        let mut scheduler = ConservativeBackfillingBatchScheduler::new(4);

        let a = job(1, 4, 10);
        let b = job(2, 1, 100);
        let c = job(3, 3, 5);
        scheduler.process_job_submission(&a, 0.0);
        scheduler.process_job_submission(&b, 1.0);
        scheduler.process_job_submission(&c, 2.0);

        // A runs first; B and C both fit at t=10 (1 + 3 nodes).
        assert_eq!(scheduler.reservations[&1], (0, 10));
        assert_eq!(scheduler.reservations[&2], (10, 110));
        assert_eq!(scheduler.reservations[&3], (10, 15));
    }

    #[test]
    fn early_completion_compacts_reservations_forward() {
        let mut scheduler = ConservativeBackfillingBatchScheduler::new(4);
        let mut pool = pool(4);

        let a = job(1, 4, 10);
        scheduler.process_job_submission(&a, 0.0);
        let queue: VecDeque<_> = [a.clone()].into();
        for start in scheduler.process_queued_jobs(&queue, &mut pool, 0.0) {
            let end = start.job.requested_time() as f64;
            start.job.start(0.0, end, start.allocation);
        }

        let b = job(2, 1, 100);
        let c = job(3, 3, 5);
        scheduler.process_job_submission(&b, 1.0);
        scheduler.process_job_submission(&c, 2.0);

        // A exits early at t=8: both reservations move up to t=8.
        pool.release_allocation(&a.allocation().unwrap());
        scheduler.process_job_completion(&a, 8.0);
        let queue: VecDeque<_> = [b.clone(), c.clone()].into();
        let starts = scheduler.process_queued_jobs(&queue, &mut pool, 8.0);

        assert_eq!(scheduler.reservations[&2], (8, 108));
        assert_eq!(scheduler.reservations[&3], (8, 13));
        assert_eq!(starts.len(), 2);
    }

    #[test]
    fn reservations_use_exact_end_dates() {
        let mut scheduler = ConservativeBackfillingBatchScheduler::new(2);

        // Two back-to-back reservations: [0, 10) and [10, 20).
        let a = job(1, 2, 10);
        let b = job(2, 2, 10);
        scheduler.process_job_submission(&a, 0.0);
        scheduler.process_job_submission(&b, 0.0);
        assert_eq!(scheduler.reservations[&2], (10, 20));

        // Removing A's reservation with its exact end date must leave B's
        // untouched; removal with any slack past t=10 would corrupt it.
        let mut pool = pool(2);
        let queue: VecDeque<_> = [a.clone(), b.clone()].into();
        for start in scheduler.process_queued_jobs(&queue, &mut pool, 0.0) {
            start.job.start(0.0, 10.0, start.allocation);
        }
        pool.release_allocation(&a.allocation().unwrap());
        scheduler.process_job_completion(&a, 10.0);

        let queue: VecDeque<_> = [b.clone()].into();
        let starts = scheduler.process_queued_jobs(&queue, &mut pool, 10.0);
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].job.id(), 2);
        assert_eq!(scheduler.reservations[&2], (10, 20));
    }

    #[test]
    fn full_cluster_jobs_are_never_backfilled_past() {
        let mut scheduler = ConservativeBackfillingBatchScheduler::new(4);

        // B needs the whole cluster; C must queue behind it even though a
        // single node would be free during B's wait.
        let a = job(1, 4, 10);
        let b = job(2, 4, 10);
        let c = job(3, 1, 100);
        scheduler.process_job_submission(&a, 0.0);
        scheduler.process_job_submission(&b, 0.0);
        scheduler.process_job_submission(&c, 0.0);

        assert_eq!(scheduler.reservations[&2], (10, 20));
        assert_eq!(scheduler.reservations[&3], (20, 120));
    }

    #[test]
    fn compaction_never_postpones_a_reservation() {
        let mut scheduler = ConservativeBackfillingBatchScheduler::new(4);
        let mut pool = pool(4);

        let a = job(1, 4, 10);
        let b = job(2, 2, 20);
        let c = job(3, 2, 30);
        scheduler.process_job_submission(&a, 0.0);
        let queue: VecDeque<_> = [a.clone()].into();
        for start in scheduler.process_queued_jobs(&queue, &mut pool, 0.0) {
            start.job.start(0.0, 10.0, start.allocation);
        }
        scheduler.process_job_submission(&b, 1.0);
        scheduler.process_job_submission(&c, 2.0);

        // B and C fit side by side at t=10.
        assert_eq!(scheduler.reservations[&3], (10, 40));

        // Terminating pending B frees capacity; the rebuilt reservation for
        // C starts no later than before.
        scheduler.process_job_termination(&b, 3.0);
        let queue: VecDeque<_> = [c.clone()].into();
        scheduler.process_queued_jobs(&queue, &mut pool, 3.0);

        assert_eq!(scheduler.reservations[&3], (10, 40));
    }

    #[test]
    fn estimates_come_from_the_timeline() {
        let mut scheduler = ConservativeBackfillingBatchScheduler::new(4);
        scheduler.process_job_submission(&job(1, 4, 10), 0.0);

        let estimates = scheduler
            .start_time_estimates(
                &[
                    StartTimeEstimateSpec {
                        id: "fits-later".to_string(),
                        num_nodes: 2,
                        cores_per_node: 1,
                        duration: 5,
                    },
                    StartTimeEstimateSpec {
                        id: "never".to_string(),
                        num_nodes: 5,
                        cores_per_node: 1,
                        duration: 5,
                    },
                ],
                0.0,
                "batch",
            )
            .unwrap();

        assert_eq!(estimates["fits-later"], 10.0);
        assert_eq!(estimates["never"], -1.0);
    }
}
