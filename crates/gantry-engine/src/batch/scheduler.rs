//! Implementation of the batch scheduler interface and host selection.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use gantry_sim::Platform;

use super::conservative::ConservativeBackfillingBatchScheduler;
use super::conservative_core::ConservativeBackfillingCoreLevelScheduler;
use super::easy::EasyBackfillingBatchScheduler;
use super::fcfs::FcfsBatchScheduler;
use super::job::BatchJob;
use super::job::HostAllocation;
use crate::Result;
use crate::config::BatchSchedulingAlgorithm;
use crate::config::BatchServiceConfig;

/// The live free-core table of a batch compute service.
///
/// The pool is owned by the service and lent to the scheduling policy during
/// each call; committing an allocation through the pool is what reserves the
/// cores, so a policy that selects hosts and a service that starts the job
/// always agree.
#[derive(Debug)]
pub struct NodePool {
    /// The platform the pool covers.
    platform: Platform,
    /// The free core count per node index.
    free_cores: Vec<u64>,
}

impl NodePool {
    /// Creates a pool with all cores free.
    pub fn new(platform: Platform) -> Self {
        let free_cores = platform.nodes().iter().map(|n| n.cores).collect();
        Self {
            platform,
            free_cores,
        }
    }

    /// Gets the platform the pool covers.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Gets the number of nodes of the pool.
    pub fn num_nodes(&self) -> usize {
        self.free_cores.len()
    }

    /// Gets the core count of each node.
    pub fn cores_per_node(&self) -> u64 {
        self.platform.cores_per_node()
    }

    /// Gets the free core count of the given node.
    pub fn free_cores(&self, index: usize) -> u64 {
        self.free_cores[index]
    }

    /// Reserves cores on the given node.
    ///
    /// # Panics
    ///
    /// Panics if the node does not have that many cores free.
    pub fn allocate(&mut self, index: usize, cores: u64) {
        assert!(
            self.free_cores[index] >= cores,
            "node {index} does not have {cores} free cores"
        );
        self.free_cores[index] -= cores;
    }

    /// Releases previously reserved cores on the given node.
    ///
    /// # Panics
    ///
    /// Panics if the release would exceed the node's capacity.
    pub fn release(&mut self, index: usize, cores: u64) {
        self.free_cores[index] += cores;
        assert!(
            self.free_cores[index] <= self.platform.node(index).cores,
            "released more cores than node {index} has"
        );
    }

    /// Releases every node of a previously committed allocation.
    pub fn release_allocation(&mut self, allocation: &HostAllocation) {
        for (&index, &(cores, _)) in allocation {
            self.release(index, cores);
        }
    }
}

/// Represents a policy's decision to start a job now on a committed
/// allocation.
#[derive(Debug)]
pub struct JobStart {
    /// The job to start.
    pub job: Arc<BatchJob>,
    /// The allocation the job runs on; its cores are already reserved in
    /// the pool.
    pub allocation: HostAllocation,
}

/// Represents one job configuration of a start-time-estimate query.
#[derive(Debug, Clone)]
pub struct StartTimeEstimateSpec {
    /// The configuration id the estimate is reported under.
    pub id: String,
    /// The number of nodes of the configuration.
    pub num_nodes: u64,
    /// The number of cores per node of the configuration.
    pub cores_per_node: u64,
    /// The duration of the configuration, in seconds.
    pub duration: u64,
}

/// The interface every batch scheduling policy implements.
///
/// Policies never hold a reference to their service. The service lends them
/// its queue and node pool at each call and executes the start decisions
/// they return.
pub trait BatchScheduler: Send {
    /// Called once before the service starts processing messages.
    fn init(&mut self) {}

    /// Called when the service's main loop launches.
    fn launch(&mut self) {}

    /// Called when the service shuts down.
    fn shutdown(&mut self) {}

    /// Called when a job is admitted into the queue.
    fn process_job_submission(&mut self, job: &Arc<BatchJob>, now: f64);

    /// Called when a running job completes.
    fn process_job_completion(&mut self, job: &Arc<BatchJob>, now: f64);

    /// Called when a running job fails.
    fn process_job_failure(&mut self, job: &Arc<BatchJob>, now: f64) {
        self.process_job_completion(job, now);
    }

    /// Called when a pending or running job is terminated.
    fn process_job_termination(&mut self, job: &Arc<BatchJob>, now: f64) {
        self.process_job_completion(job, now);
    }

    /// The main scheduling tick: decides which queued jobs start now.
    ///
    /// Returned decisions carry allocations already committed in the pool;
    /// the service removes the jobs from its queue and launches their
    /// executors.
    fn process_queued_jobs(
        &mut self,
        queue: &VecDeque<Arc<BatchJob>>,
        pool: &mut NodePool,
        now: f64,
    ) -> Vec<JobStart>;

    /// Predicts the start date of each given job configuration.
    ///
    /// A negative prediction means the configuration cannot run on the
    /// service. Policies without planning state answer
    /// [`Error::FunctionalityNotAvailable`](crate::Error::FunctionalityNotAvailable).
    fn start_time_estimates(
        &mut self,
        specs: &[StartTimeEstimateSpec],
        now: f64,
        service: &str,
    ) -> Result<HashMap<String, f64>>;
}

/// Creates the scheduling policy named by the service configuration.
pub(crate) fn create_scheduler(
    config: &BatchServiceConfig,
    platform: &Platform,
) -> Box<dyn BatchScheduler> {
    match config.scheduling_algorithm {
        BatchSchedulingAlgorithm::Fcfs => {
            Box::new(FcfsBatchScheduler::new(config.host_selection_algorithm))
        }
        BatchSchedulingAlgorithm::ConservativeBf => Box::new(
            ConservativeBackfillingBatchScheduler::new(platform.num_nodes()),
        ),
        BatchSchedulingAlgorithm::ConservativeBfCoreLevel => {
            Box::new(ConservativeBackfillingCoreLevelScheduler::new(
                platform.num_nodes() as usize,
                platform.cores_per_node(),
            ))
        }
        BatchSchedulingAlgorithm::EasyBfDepth0 => {
            Box::new(EasyBackfillingBatchScheduler::new(platform.num_nodes(), 0))
        }
        BatchSchedulingAlgorithm::EasyBfDepth1 => {
            Box::new(EasyBackfillingBatchScheduler::new(platform.num_nodes(), 1))
        }
    }
}

/// Selects the first `num_nodes` nodes, in index order, with enough free
/// cores, committing the allocation in the pool.
///
/// Returns `None`, with the pool untouched, if fewer than `num_nodes` nodes
/// qualify.
pub fn select_hosts_first_fit(
    pool: &mut NodePool,
    num_nodes: u64,
    cores_per_node: u64,
    ram_per_node: u64,
) -> Option<HostAllocation> {
    let chosen: Vec<usize> = (0..pool.num_nodes())
        .filter(|&i| pool.free_cores(i) >= cores_per_node)
        .take(num_nodes as usize)
        .collect();

    commit(pool, chosen, num_nodes, cores_per_node, ram_per_node)
}

/// Selects the feasible nodes with the least free-core slack, committing the
/// allocation in the pool.
pub fn select_hosts_best_fit(
    pool: &mut NodePool,
    num_nodes: u64,
    cores_per_node: u64,
    ram_per_node: u64,
) -> Option<HostAllocation> {
    let mut candidates: Vec<(u64, usize)> = (0..pool.num_nodes())
        .filter(|&i| pool.free_cores(i) >= cores_per_node)
        .map(|i| (pool.free_cores(i) - cores_per_node, i))
        .collect();
    candidates.sort();

    let chosen = candidates
        .into_iter()
        .take(num_nodes as usize)
        .map(|(_, i)| i)
        .collect();
    commit(pool, chosen, num_nodes, cores_per_node, ram_per_node)
}

/// Selects feasible nodes starting after the cursor's position, wrapping
/// around, and advances the cursor to the last selected node.
pub fn select_hosts_round_robin(
    pool: &mut NodePool,
    cursor: &mut usize,
    num_nodes: u64,
    cores_per_node: u64,
    ram_per_node: u64,
) -> Option<HostAllocation> {
    let n = pool.num_nodes();
    let start = cursor.wrapping_add(1) % n;
    let mut chosen = Vec::new();
    for offset in 0..n {
        let i = (start + offset) % n;
        if pool.free_cores(i) >= cores_per_node {
            chosen.push(i);
            if chosen.len() as u64 == num_nodes {
                break;
            }
        }
    }

    if let Some(&last) = chosen.last()
        && chosen.len() as u64 == num_nodes
    {
        *cursor = last;
    }

    commit(pool, chosen, num_nodes, cores_per_node, ram_per_node)
}

/// Commits a host selection in the pool, or returns `None` if the selection
/// is short.
fn commit(
    pool: &mut NodePool,
    chosen: Vec<usize>,
    num_nodes: u64,
    cores_per_node: u64,
    ram_per_node: u64,
) -> Option<HostAllocation> {
    if (chosen.len() as u64) < num_nodes {
        return None;
    }

    let mut allocation = HostAllocation::new();
    for i in chosen {
        pool.allocate(i, cores_per_node);
        allocation.insert(i, (cores_per_node, ram_per_node));
    }
    Some(allocation)
}

#[cfg(test)]
mod test {
    use gantry_sim::NodeSpec;
    use gantry_sim::Platform;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Makes a pool of `n` nodes with 4 cores each.
    fn pool(n: usize) -> NodePool {
        let nodes = (0..n)
            .map(|i| NodeSpec::new(format!("node{i}"), 4, 1_000, 1_000, 1e9))
            .collect();
        NodePool::new(Platform::homogeneous(nodes).unwrap())
    }

    #[test]
    fn first_fit_takes_lowest_indices() {
        let mut pool = pool(4);
        pool.allocate(0, 4);

        let allocation = select_hosts_first_fit(&mut pool, 2, 4, 1_000).unwrap();
        assert_eq!(allocation.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(pool.free_cores(1), 0);
        assert_eq!(pool.free_cores(3), 4);
    }

    #[test]
    fn short_selection_leaves_the_pool_untouched() {
        let mut pool = pool(2);
        pool.allocate(0, 3);

        assert!(select_hosts_first_fit(&mut pool, 2, 4, 1_000).is_none());
        assert_eq!(pool.free_cores(0), 1);
        assert_eq!(pool.free_cores(1), 4);
    }

    #[test]
    fn best_fit_prefers_least_slack() {
        let mut pool = pool(3);
        pool.allocate(0, 1);
        pool.allocate(2, 3);

        // Node 2 has one free core (zero slack for a one-core job).
        let allocation = select_hosts_best_fit(&mut pool, 1, 1, 1_000).unwrap();
        assert_eq!(allocation.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn round_robin_advances_its_cursor() {
        let mut pool = pool(3);
        let mut cursor = 2;

        let a = select_hosts_round_robin(&mut pool, &mut cursor, 1, 4, 1_000).unwrap();
        assert_eq!(a.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(cursor, 0);

        let b = select_hosts_round_robin(&mut pool, &mut cursor, 1, 4, 1_000).unwrap();
        assert_eq!(b.keys().copied().collect::<Vec<_>>(), vec![1]);

        let c = select_hosts_round_robin(&mut pool, &mut cursor, 1, 4, 1_000).unwrap();
        assert_eq!(c.keys().copied().collect::<Vec<_>>(), vec![2]);

        assert!(select_hosts_round_robin(&mut pool, &mut cursor, 1, 4, 1_000).is_none());
    }

    #[test]
    fn release_restores_capacity() {
        let mut pool = pool(2);
        let allocation = select_hosts_first_fit(&mut pool, 2, 4, 1_000).unwrap();
        pool.release_allocation(&allocation);
        assert_eq!(pool.free_cores(0), 4);
        assert_eq!(pool.free_cores(1), 4);
    }
}
