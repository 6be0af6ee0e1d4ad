//! Implementation of the scheduler-side batch-job wrapper.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::CompoundJob;

/// A binding of a job to physical hosts: node index to allocated
/// (cores, RAM in bytes).
pub type HostAllocation = IndexMap<usize, (u64, u64)>;

/// Represents the run-time information recorded when a batch job starts.
#[derive(Debug, Clone)]
pub struct RunInfo {
    /// The date the job started.
    pub begin: f64,
    /// The date the job's walltime expires.
    pub expected_end: f64,
    /// The hosts the job runs on.
    pub allocation: HostAllocation,
}

/// Represents a batch compute service's wrapper over a compound job.
///
/// The requested shape of the job (`-N`, `-c`, `-t`) is fixed at admission;
/// the requested walltime already includes the service's padding delay.
/// A batch job is present in at most one of the service's queue and running
/// table at any time.
#[derive(Debug)]
pub struct BatchJob {
    /// The service-scoped, monotonically increasing job id.
    id: u64,
    /// The wrapped compound job.
    compound: Arc<CompoundJob>,
    /// The submitting user.
    username: String,
    /// An optional diagnostic display color.
    color: Option<String>,
    /// The requested number of nodes.
    requested_nodes: u64,
    /// The requested number of cores per node.
    requested_cores_per_node: u64,
    /// The requested walltime, in seconds, after padding.
    requested_time: u64,
    /// The date the job was admitted.
    arrival: f64,
    /// The run-time information, set when the job starts.
    run: Mutex<Option<RunInfo>>,
}

impl BatchJob {
    /// Creates a new batch job.
    pub fn new(
        id: u64,
        compound: Arc<CompoundJob>,
        username: String,
        color: Option<String>,
        requested_nodes: u64,
        requested_cores_per_node: u64,
        requested_time: u64,
        arrival: f64,
    ) -> Arc<Self> {
        assert!(requested_nodes > 0, "a batch job requests at least one node");
        assert!(
            requested_cores_per_node > 0,
            "a batch job requests at least one core per node"
        );

        Arc::new(Self {
            id,
            compound,
            username,
            color,
            requested_nodes,
            requested_cores_per_node,
            requested_time,
            arrival,
            run: Mutex::new(None),
        })
    }

    /// Gets the id of the job.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Gets the wrapped compound job.
    pub fn compound(&self) -> &Arc<CompoundJob> {
        &self.compound
    }

    /// Gets the submitting user.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Gets the diagnostic display color, if one was requested.
    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }

    /// Gets the requested number of nodes.
    pub fn requested_nodes(&self) -> u64 {
        self.requested_nodes
    }

    /// Gets the requested number of cores per node.
    pub fn requested_cores_per_node(&self) -> u64 {
        self.requested_cores_per_node
    }

    /// Gets the requested walltime, in seconds, after padding.
    pub fn requested_time(&self) -> u64 {
        self.requested_time
    }

    /// Gets the date the job was admitted.
    pub fn arrival(&self) -> f64 {
        self.arrival
    }

    /// Determines if the job has started.
    pub fn has_started(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Gets the date the job started, if it has.
    pub fn begin(&self) -> Option<f64> {
        self.run.lock().as_ref().map(|r| r.begin)
    }

    /// Gets the date the job's walltime expires, if it has started.
    pub fn expected_end(&self) -> Option<f64> {
        self.run.lock().as_ref().map(|r| r.expected_end)
    }

    /// Gets the job's host allocation, if it has started.
    pub fn allocation(&self) -> Option<HostAllocation> {
        self.run.lock().as_ref().map(|r| r.allocation.clone())
    }

    /// Records the job's start.
    ///
    /// # Panics
    ///
    /// Panics if the job has already started.
    pub fn start(&self, begin: f64, expected_end: f64, allocation: HostAllocation) {
        let mut run = self.run.lock();
        assert!(run.is_none(), "a batch job can only start once");
        *run = Some(RunInfo {
            begin,
            expected_end,
            allocation,
        });
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn run_info_is_recorded_once() {
        let job = BatchJob::new(
            1,
            CompoundJob::new("job"),
            "you".to_string(),
            None,
            2,
            4,
            60,
            0.0,
        );

        assert!(!job.has_started());
        assert_eq!(job.begin(), None);

        let mut allocation = HostAllocation::new();
        allocation.insert(0, (4, 1_000));
        allocation.insert(1, (4, 1_000));
        job.start(5.0, 65.0, allocation);

        assert!(job.has_started());
        assert_eq!(job.begin(), Some(5.0));
        assert_eq!(job.expected_end(), Some(65.0));
        assert_eq!(job.allocation().unwrap().len(), 2);
    }

    #[test]
    #[should_panic(expected = "only start once")]
    fn double_start_panics() {
        let job = BatchJob::new(
            1,
            CompoundJob::new("job"),
            "you".to_string(),
            None,
            1,
            1,
            60,
            0.0,
        );
        job.start(0.0, 60.0, HostAllocation::new());
        job.start(1.0, 61.0, HostAllocation::new());
    }
}
