//! Implementation of EASY backfilling.

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
use crate::Error;
use crate::Result;

/// An EASY backfilling policy at node granularity.
///
/// Unlike conservative backfilling, only started jobs occupy the timeline;
/// nothing is promised to queued jobs except, at depth 1, the head of the
/// queue. On each tick the policy starts jobs from the head while they fit,
/// then computes the *shadow time* (the earliest start of the first job that
/// does not fit) and scans the rest of the queue for backfill candidates
/// that fit right now. At depth 1 a candidate is refused when it would push
/// the shadow job: it runs past the shadow time and takes nodes the shadow
/// job needs. Depth 0 skips the shadow check entirely.
#[derive(Debug)]
pub struct EasyBackfillingBatchScheduler {
    /// The backfilling depth (0 or 1).
    depth: u32,
    /// The availability timeline of the started jobs.
    timeline: NodeAvailabilityTimeline,
    /// The scheduled end date per job id.
    expected_ends: HashMap<u64, u64>,
}

impl EasyBackfillingBatchScheduler {
    /// Creates a new policy over a cluster of the given size.
    pub fn new(total_nodes: u64, depth: u32) -> Self {
        assert!(depth <= 1, "EASY backfilling supports depths 0 and 1");

        Self {
            depth,
            timeline: NodeAvailabilityTimeline::new(total_nodes),
            expected_ends: HashMap::new(),
        }
    }

    /// Schedules the job in the first slot of the timeline.
    fn schedule_now(&mut self, job: &Arc<BatchJob>) {
        let origin = self.timeline.time_origin();
        let end = origin + job.requested_time();
        self.timeline.add(origin, end, job);
        self.expected_ends.insert(job.id(), end);

        info!(
            "scheduled job {id} on {nodes} nodes over [{origin}, {end})",
            id = job.id(),
            nodes = job.requested_nodes(),
        );
    }
}

impl BatchScheduler for EasyBackfillingBatchScheduler {
    fn process_job_submission(&mut self, job: &Arc<BatchJob>, _now: f64) {
        debug!(
            "arrival of job {id} that needs {nodes} nodes",
            id = job.id(),
            nodes = job.requested_nodes()
        );
    }

    fn process_job_completion(&mut self, job: &Arc<BatchJob>, now: f64) {
        debug!("notified of the exit of job {id}", id = job.id());

        let now = now as u64;
        self.timeline.set_time_origin(now);
        if let Some(end) = self.expected_ends.remove(&job.id()) {
            self.timeline.remove(now, end, job.id());
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

        let origin = now as u64;
        self.timeline.set_time_origin(origin);

        // Schedule jobs from the head of the queue while they fit now.
        let mut first_not_started = None;
        for (i, job) in queue.iter().enumerate() {
            if job.has_started() || self.timeline.first_slot_contains(job.id()) {
                continue;
            }

            if self.timeline.num_available_nodes_in_first_slot() < job.requested_nodes() {
                first_not_started = Some(i);
                break;
            }

            self.schedule_now(job);
        }

        // The first job that does not fit bounds the backfilling of the
        // rest of the queue.
        if let Some(first_idx) = first_not_started {
            let first = &queue[first_idx];
            let est = self
                .timeline
                .find_earliest_start_time(first.requested_time(), first.requested_nodes())
                .ok()
                .flatten()
                .expect("admission guarantees a feasible request");
            let shadow_time = est.start;
            let mut nodes_at_shadow = est.available_nodes - first.requested_nodes();
            let mut nodes_now = self.timeline.num_available_nodes_in_first_slot();

            debug!(
                "shadow job {id} is guaranteed to start at {shadow_time} with {nodes_at_shadow} \
                 nodes left over",
                id = first.id()
            );

            let candidates: Vec<_> = queue.iter().skip(first_idx + 1).cloned().collect();
            for job in candidates {
                if job.has_started() || self.timeline.first_slot_contains(job.id()) {
                    continue;
                }

                if job.requested_nodes() > nodes_now {
                    continue;
                }

                let runs_past_shadow = origin + job.requested_time() > shadow_time;
                if self.depth == 1 && runs_past_shadow && job.requested_nodes() > nodes_at_shadow {
                    debug!(
                        "refusing to backfill job {id}: it would push the shadow job",
                        id = job.id()
                    );
                    continue;
                }

                self.schedule_now(&job);
                nodes_now -= job.requested_nodes();
                if runs_past_shadow {
                    nodes_at_shadow = nodes_at_shadow.saturating_sub(job.requested_nodes());
                }
            }
        }

        // Start every scheduled job in the first slot; whole nodes go to
        // each job at this granularity.
        let all_cores = pool.cores_per_node();
        let all_ram = pool.platform().ram_per_node();

        let mut starts = Vec::new();
        for job in self.timeline.jobs_in_first_slot() {
            if job.has_started() {
                continue;
            }

            let Some(allocation) =
                select_hosts_first_fit(pool, job.requested_nodes(), all_cores, all_ram)
            else {
                return starts;
            };

            info!("starting job {id}", id = job.id());
            starts.push(JobStart { job, allocation });
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

    /// Runs one tick and starts the returned jobs.
    fn tick(
        scheduler: &mut EasyBackfillingBatchScheduler,
        queue: &mut VecDeque<Arc<BatchJob>>,
        pool: &mut NodePool,
        now: f64,
    ) -> Vec<u64> {
        let starts = scheduler.process_queued_jobs(queue, pool, now);
        let mut started = Vec::new();
        for start in starts {
            let end = now + start.job.requested_time() as f64;
            start.job.start(now, end, start.allocation);
            queue.retain(|j| j.id() != start.job.id());
            started.push(start.job.id());
        }
        started
    }

    /// Sets up the common topology: A holds 3 of 4 nodes until t=10, B
    /// (the shadow job) needs all 4, C is a 50-second single-node
    /// candidate.
    fn shadow_setup(depth: u32) -> (EasyBackfillingBatchScheduler, VecDeque<Arc<BatchJob>>, NodePool)
    {
        let mut scheduler = EasyBackfillingBatchScheduler::new(4, depth);
        let mut pool = pool(4);
        let mut queue: VecDeque<_> = [job(1, 3, 10)].into();

        assert_eq!(tick(&mut scheduler, &mut queue, &mut pool, 0.0), vec![1]);

        queue.push_back(job(2, 4, 100));
        queue.push_back(job(3, 1, 50));
        (scheduler, queue, pool)
    }

    #[test]
    fn depth_one_refuses_harmful_backfill() {
        let (mut scheduler, mut queue, mut pool) = shadow_setup(1);

        // Shadow time is 10 with 0 nodes left over; C runs past it and
        // would steal a node B needs.
        let started = tick(&mut scheduler, &mut queue, &mut pool, 2.0);
        assert_eq!(started, Vec::<u64>::new());
    }

    #[test]
    fn depth_zero_backfills_anyway() {
        let (mut scheduler, mut queue, mut pool) = shadow_setup(0);

        let started = tick(&mut scheduler, &mut queue, &mut pool, 2.0);
        assert_eq!(started, vec![3]);
    }

    #[test]
    fn harmless_backfill_is_taken_at_depth_one() {
        let mut scheduler = EasyBackfillingBatchScheduler::new(4, 1);
        let mut pool = pool(4);
        let mut queue: VecDeque<_> = [job(1, 3, 10)].into();
        assert_eq!(tick(&mut scheduler, &mut queue, &mut pool, 0.0), vec![1]);

        // The shadow job leaves one node over at its start; a candidate
        // fitting in that leftover may run past the shadow time.
        queue.push_back(job(2, 3, 100));
        queue.push_back(job(3, 1, 50));

        let started = tick(&mut scheduler, &mut queue, &mut pool, 2.0);
        assert_eq!(started, vec![3]);
    }

    #[test]
    fn short_backfill_before_the_shadow_is_taken() {
        let mut scheduler = EasyBackfillingBatchScheduler::new(4, 1);
        let mut pool = pool(4);
        let mut queue: VecDeque<_> = [job(1, 3, 10)].into();
        assert_eq!(tick(&mut scheduler, &mut queue, &mut pool, 0.0), vec![1]);

        // C finishes by the shadow time, so it cannot push B.
        queue.push_back(job(2, 4, 100));
        queue.push_back(job(3, 1, 5));

        let started = tick(&mut scheduler, &mut queue, &mut pool, 2.0);
        assert_eq!(started, vec![3]);
    }

    #[test]
    fn head_jobs_start_in_order_when_they_fit() {
        let mut scheduler = EasyBackfillingBatchScheduler::new(4, 1);
        let mut pool = pool(4);
        let mut queue: VecDeque<_> = [job(1, 2, 10), job(2, 2, 10), job(3, 1, 10)].into();

        let started = tick(&mut scheduler, &mut queue, &mut pool, 0.0);
        assert_eq!(started, vec![1, 2]);
        assert_eq!(queue.len(), 1);
    }
}
