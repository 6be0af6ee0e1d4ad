//! Implementation of the core-level availability timeline.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::job::BatchJob;
use super::timeline::HORIZON;
use crate::Error;
use crate::Result;

/// Represents the jobs occupying one interval along with the cores they
/// utilize on each node.
#[derive(Debug, Clone)]
pub struct CoreJobSet {
    /// The jobs of the set, keyed by job id, with the node indices each was
    /// reserved on.
    jobs: BTreeMap<u64, (Arc<BatchJob>, Vec<usize>)>,
    /// The utilized core count per node index.
    core_use: Vec<u64>,
}

impl CoreJobSet {
    /// Creates an empty set over a cluster of the given size.
    fn new(total_nodes: usize) -> Self {
        Self {
            jobs: BTreeMap::new(),
            core_use: vec![0; total_nodes],
        }
    }

    /// Adds a job reserved on the given node indices; adding a member again
    /// is a no-op.
    fn add(&mut self, job: &Arc<BatchJob>, indices: &[usize]) {
        if self.jobs.contains_key(&job.id()) {
            return;
        }

        for &i in indices {
            self.core_use[i] += job.requested_cores_per_node();
        }
        self.jobs.insert(job.id(), (job.clone(), indices.to_vec()));
    }

    /// Removes a job from the set; removing a non-member is a no-op.
    fn remove(&mut self, id: u64) {
        if let Some((job, indices)) = self.jobs.remove(&id) {
            for i in indices {
                self.core_use[i] -= job.requested_cores_per_node();
            }
        }
    }

    /// Gets the jobs of the set, in job-id order.
    pub fn jobs(&self) -> impl Iterator<Item = &Arc<BatchJob>> {
        self.jobs.values().map(|(job, _)| job)
    }

    /// Gets the utilized core count of the given node index.
    pub fn core_use(&self, index: usize) -> u64 {
        self.core_use[index]
    }
}

impl PartialEq for CoreJobSet {
    fn eq(&self, other: &Self) -> bool {
        self.jobs.len() == other.jobs.len()
            && self.jobs.keys().zip(other.jobs.keys()).all(|(a, b)| a == b)
    }
}

/// Represents the result of a core-level earliest-start-time query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreEarliestStart {
    /// The earliest feasible start date.
    pub start: u64,
    /// The numerically smallest node indices feasible across the whole
    /// window, truncated to the requested node count.
    pub node_indices: Vec<usize>,
}

/// An interval map over future simulated time recording, for each interval,
/// the reserved batch jobs and a per-node-index core-utilization vector.
///
/// Same boundary-map representation as the node-level timeline; occupancy is
/// tracked per core rather than per whole node, so jobs from different
/// reservations may share a node.
#[derive(Debug, Clone)]
pub struct CoreAvailabilityTimeline {
    /// The total number of nodes on the cluster.
    total_nodes: usize,
    /// The number of cores on each node.
    cores_per_node: u64,
    /// The current time origin.
    origin: u64,
    /// The boundary map; always contains a boundary at the origin.
    slots: BTreeMap<u64, CoreJobSet>,
}

impl CoreAvailabilityTimeline {
    /// Creates an empty timeline over a cluster of the given shape.
    pub fn new(total_nodes: usize, cores_per_node: u64) -> Self {
        assert!(total_nodes > 0, "a timeline requires at least one node");
        assert!(cores_per_node > 0, "nodes require at least one core");

        let mut slots = BTreeMap::new();
        slots.insert(0, CoreJobSet::new(total_nodes));
        Self {
            total_nodes,
            cores_per_node,
            origin: 0,
            slots,
        }
    }

    /// Gets the current time origin.
    pub fn time_origin(&self) -> u64 {
        self.origin
    }

    /// Advances the time origin to `t`; see the node-level timeline for the
    /// truncation rules.
    pub fn set_time_origin(&mut self, t: u64) {
        if t <= self.origin {
            return;
        }

        self.split_at(t);
        self.slots.retain(|&k, _| k >= t);
        self.origin = t;
    }

    /// Ensures a boundary exists at `t`.
    fn split_at(&mut self, t: u64) {
        if t >= HORIZON || self.slots.contains_key(&t) {
            return;
        }

        let set = self
            .slots
            .range(..t)
            .next_back()
            .map(|(_, set)| set.clone())
            .expect("the origin boundary always precedes a split point");
        self.slots.insert(t, set);
    }

    /// Removes every boundary whose occupancy equals its predecessor's.
    fn coalesce(&mut self) {
        let keys: Vec<u64> = self.slots.keys().copied().collect();
        let mut prev = keys[0];
        for &k in &keys[1..] {
            if self.slots[&prev] == self.slots[&k] {
                self.slots.remove(&k);
            } else {
                prev = k;
            }
        }
    }

    /// Unions the job across `[start, end)` on the given node indices.
    ///
    /// # Panics
    ///
    /// Panics if the addition would utilize more cores than some node has on
    /// some interval.
    pub fn add(&mut self, start: u64, end: u64, job: &Arc<BatchJob>, indices: &[usize]) {
        let start = start.max(self.origin);
        if start >= end {
            return;
        }

        self.split_at(start);
        self.split_at(end);
        for (_, set) in self.slots.range_mut(start..end) {
            set.add(job, indices);
            for &i in indices {
                assert!(
                    set.core_use(i) <= self.cores_per_node,
                    "adding job {id} would exceed the core capacity of node {i}",
                    id = job.id()
                );
            }
        }
    }

    /// Subtracts the job across `[start, end)`.
    pub fn remove(&mut self, start: u64, end: u64, job_id: u64) {
        let start = start.max(self.origin);
        if start >= end {
            return;
        }

        self.split_at(start);
        self.split_at(end);
        for (_, set) in self.slots.range_mut(start..end) {
            set.remove(job_id);
        }

        self.coalesce();
    }

    /// Finds the smallest `t >= origin` such that at least `num_nodes` node
    /// indices have `cores_per_node` cores free on every interval
    /// intersecting `[t, t + duration)`, along with those indices.
    ///
    /// The feasible-index set is intersected across intervals as the scan
    /// progresses and restored to all nodes on reset; the returned indices
    /// are the numerically smallest feasible ones.
    ///
    /// A request for more nodes than the cluster has, or more cores per
    /// node than a node has, fails synchronously with
    /// [`Error::InvalidArgument`]; `Ok(None)` means a valid request has no
    /// feasible window.
    pub fn find_earliest_start_time(
        &self,
        duration: u64,
        num_nodes: u64,
        cores_per_node: u64,
    ) -> Result<Option<CoreEarliestStart>> {
        if num_nodes as usize > self.total_nodes {
            return Err(Error::InvalidArgument(format!(
                "requested {num_nodes} nodes but the cluster has {total}",
                total = self.total_nodes
            )));
        }
        if cores_per_node > self.cores_per_node {
            return Err(Error::InvalidArgument(format!(
                "requested {cores_per_node} cores per node but nodes have {cores}",
                cores = self.cores_per_node
            )));
        }

        let all: BTreeSet<usize> = (0..self.total_nodes).collect();
        let mut candidates = all.clone();
        let mut start = None;
        let mut remaining = duration;

        let mut iter = self.slots.iter().peekable();
        while let Some((&k, set)) = iter.next() {
            let next = iter.peek().map(|&(&n, _)| n).unwrap_or(HORIZON);

            candidates.retain(|&i| set.core_use(i) + cores_per_node <= self.cores_per_node);

            if (candidates.len() as u64) < num_nodes {
                start = None;
                remaining = duration;
                candidates = all.clone();
                continue;
            }

            if start.is_none() {
                start = Some(k);
            }

            let length = next - k;
            if length >= remaining {
                break;
            }
            remaining -= length;
        }

        Ok(start.map(|start| CoreEarliestStart {
            start,
            node_indices: candidates.into_iter().take(num_nodes as usize).collect(),
        }))
    }

    /// Gets the jobs of the interval starting at the current origin.
    pub fn jobs_in_first_slot(&self) -> Vec<Arc<BatchJob>> {
        self.slots
            .values()
            .next()
            .map(|set| set.jobs().cloned().collect())
            .unwrap_or_default()
    }

    /// Resets the timeline to a single empty interval starting at the
    /// current origin.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.slots.insert(self.origin, CoreJobSet::new(self.total_nodes));
    }
}

impl fmt::Display for CoreAvailabilityTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------ SCHEDULE -----")?;
        let mut iter = self.slots.iter().peekable();
        while let Some((&k, set)) = iter.next() {
            let next = iter.peek().map(|&(&n, _)| n).unwrap_or(HORIZON);
            write!(f, "[{k}, {next}) (")?;
            for i in 0..self.total_nodes {
                write!(f, "{use_} ", use_ = set.core_use(i))?;
            }
            write!(f, ") |")?;
            for job in set.jobs() {
                write!(
                    f,
                    " j={id}({n}/{c})",
                    id = job.id(),
                    n = job.requested_nodes(),
                    c = job.requested_cores_per_node()
                )?;
            }
            writeln!(f)?;
        }
        write!(f, "---- END SCHEDULE ---")
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::CompoundJob;

    /// Makes a batch job with the given id, node count, and cores per node.
    fn job(id: u64, nodes: u64, cores: u64) -> Arc<BatchJob> {
        BatchJob::new(
            id,
            CompoundJob::new(format!("job-{id}")),
            "who".to_string(),
            None,
            nodes,
            cores,
            10,
            0.0,
        )
    }

    #[test]
    fn core_use_tracks_indices() {
        let mut tl = CoreAvailabilityTimeline::new(4, 6);
        let a = job(1, 2, 4);

        tl.add(0, 10, &a, &[0, 1]);

        let est = tl.find_earliest_start_time(10, 2, 4).unwrap().unwrap();
        assert_eq!(est.start, 0);
        assert_eq!(est.node_indices, vec![2, 3]);

        // Only two cores are left on nodes 0 and 1 before t=10.
        let est = tl.find_earliest_start_time(10, 4, 4).unwrap().unwrap();
        assert_eq!(est.start, 10);
        assert_eq!(est.node_indices, vec![0, 1, 2, 3]);

        // But two cores per node are still feasible everywhere.
        let est = tl.find_earliest_start_time(10, 4, 2).unwrap().unwrap();
        assert_eq!(est.start, 0);
    }

    #[test]
    fn smallest_indices_are_preferred() {
        let mut tl = CoreAvailabilityTimeline::new(4, 6);
        tl.add(0, 10, &job(1, 1, 6), &[1]);

        let est = tl.find_earliest_start_time(5, 2, 6).unwrap().unwrap();
        assert_eq!(est.start, 0);
        assert_eq!(est.node_indices, vec![0, 2]);
    }

    #[test]
    fn removal_restores_capacity() {
        let mut tl = CoreAvailabilityTimeline::new(2, 4);
        let a = job(1, 2, 4);
        tl.add(0, 10, &a, &[0, 1]);
        tl.remove(0, 10, 1);

        let est = tl.find_earliest_start_time(10, 2, 4).unwrap().unwrap();
        assert_eq!(est.start, 0);
    }

    #[test]
    #[should_panic(expected = "exceed the core capacity")]
    fn per_node_overflow_aborts() {
        let mut tl = CoreAvailabilityTimeline::new(2, 4);
        tl.add(0, 10, &job(1, 1, 3), &[0]);
        tl.add(0, 10, &job(2, 1, 3), &[0]);
    }

    #[test]
    fn oversized_requests_fail_with_invalid_argument() {
        let tl = CoreAvailabilityTimeline::new(2, 4);

        // Shapes the cluster could never hold are invalid requests, not
        // windows that merely do not exist yet.
        assert!(matches!(
            tl.find_earliest_start_time(1, 3, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            tl.find_earliest_start_time(1, 1, 5),
            Err(Error::InvalidArgument(_))
        ));
    }
}
