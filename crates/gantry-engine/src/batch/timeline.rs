//! Implementation of the node-level availability timeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::job::BatchJob;
use crate::Error;
use crate::Result;

/// The open right end of the timeline.
pub(crate) const HORIZON: u64 = u64::MAX;

/// Represents the set of jobs occupying one interval of the timeline.
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    /// The jobs of the set, keyed by job id.
    jobs: BTreeMap<u64, Arc<BatchJob>>,
    /// The number of nodes utilized by the jobs of the set.
    nodes_used: u64,
}

impl JobSet {
    /// Adds a job to the set; adding a member again is a no-op.
    fn add(&mut self, job: &Arc<BatchJob>) {
        if self.jobs.insert(job.id(), job.clone()).is_none() {
            self.nodes_used += job.requested_nodes();
        }
    }

    /// Removes a job from the set; removing a non-member is a no-op.
    fn remove(&mut self, id: u64) {
        if let Some(job) = self.jobs.remove(&id) {
            self.nodes_used -= job.requested_nodes();
        }
    }

    /// Determines if the set contains the given job.
    pub fn contains(&self, id: u64) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Gets the jobs of the set, in job-id order.
    pub fn jobs(&self) -> impl Iterator<Item = &Arc<BatchJob>> {
        self.jobs.values()
    }

    /// Gets the number of nodes utilized by the jobs of the set.
    pub fn nodes_used(&self) -> u64 {
        self.nodes_used
    }
}

impl PartialEq for JobSet {
    fn eq(&self, other: &Self) -> bool {
        self.jobs.len() == other.jobs.len()
            && self.jobs.keys().zip(other.jobs.keys()).all(|(a, b)| a == b)
    }
}

/// Represents the result of an earliest-start-time query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarliestStart {
    /// The earliest feasible start date.
    pub start: u64,
    /// The smallest number of available nodes across the found window.
    pub available_nodes: u64,
}

/// An interval map over future simulated time recording, for each interval,
/// the set of batch jobs reserved on the cluster and the node count they
/// utilize.
///
/// The timeline is a total cover of `[origin, horizon)` by non-overlapping
/// right-open intervals. It is backed by a boundary map: each key starts an
/// interval that extends to the next key, and the last interval extends to
/// the horizon.
#[derive(Debug, Clone)]
pub struct NodeAvailabilityTimeline {
    /// The total number of nodes on the cluster.
    total_nodes: u64,
    /// The current time origin.
    origin: u64,
    /// The boundary map; always contains a boundary at the origin.
    slots: BTreeMap<u64, JobSet>,
}

impl NodeAvailabilityTimeline {
    /// Creates an empty timeline over a cluster of the given size.
    pub fn new(total_nodes: u64) -> Self {
        assert!(total_nodes > 0, "a timeline requires at least one node");

        let mut slots = BTreeMap::new();
        slots.insert(0, JobSet::default());
        Self {
            total_nodes,
            origin: 0,
            slots,
        }
    }

    /// Gets the total number of nodes on the cluster.
    pub fn total_nodes(&self) -> u64 {
        self.total_nodes
    }

    /// Gets the current time origin.
    pub fn time_origin(&self) -> u64 {
        self.origin
    }

    /// Advances the time origin to `t`.
    ///
    /// Intervals ending at or before `t` are dropped; an interval straddling
    /// `t` is truncated on the left. Moving the origin backwards is a no-op,
    /// so the origin is monotonically non-decreasing.
    pub fn set_time_origin(&mut self, t: u64) {
        if t <= self.origin {
            return;
        }

        self.split_at(t);
        self.slots.retain(|&k, _| k >= t);
        self.origin = t;
    }

    /// Ensures a boundary exists at `t`, cloning the occupancy of the
    /// interval that straddles it.
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

    /// Unions the job across `[start, end)`, splitting intervals as needed.
    ///
    /// The start is clamped to the time origin; an empty interval is a
    /// no-op.
    ///
    /// # Panics
    ///
    /// Panics if the addition would utilize more nodes than the cluster has
    /// on some interval.
    pub fn add(&mut self, start: u64, end: u64, job: &Arc<BatchJob>) {
        let start = start.max(self.origin);
        if start >= end {
            return;
        }

        self.split_at(start);
        self.split_at(end);
        for (_, set) in self.slots.range_mut(start..end) {
            set.add(job);
            assert!(
                set.nodes_used() <= self.total_nodes,
                "adding job {id} would exceed the cluster's node capacity",
                id = job.id()
            );
        }
    }

    /// Subtracts the job across `[start, end)`.
    ///
    /// Intervals where the job is absent are unaffected; adjacent intervals
    /// with equal occupancy are coalesced afterwards.
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

    /// Finds the smallest `t >= origin` such that every interval
    /// intersecting `[t, t + duration)` has at least `num_nodes` available
    /// nodes.
    ///
    /// A request for more nodes than the cluster has fails synchronously
    /// with [`Error::InvalidArgument`]; `Ok(None)` means a valid request
    /// has no feasible window.
    ///
    /// The scan proceeds left to right, accumulating remaining duration
    /// across consecutive feasible intervals and resetting whenever an
    /// interval is infeasible. The reported available-node count is the
    /// minimum across the found window, which is what EASY backfilling needs
    /// to compute the nodes free at the shadow time.
    pub fn find_earliest_start_time(
        &self,
        duration: u64,
        num_nodes: u64,
    ) -> Result<Option<EarliestStart>> {
        if num_nodes > self.total_nodes {
            return Err(Error::InvalidArgument(format!(
                "requested {num_nodes} nodes but the cluster has {total}",
                total = self.total_nodes
            )));
        }

        let mut start = None;
        let mut remaining = duration;
        let mut min_available = self.total_nodes;

        let mut iter = self.slots.iter().peekable();
        while let Some((&k, set)) = iter.next() {
            let next = iter.peek().map(|&(&n, _)| n).unwrap_or(HORIZON);
            let available = self.total_nodes - set.nodes_used();

            if available < num_nodes {
                start = None;
                remaining = duration;
                min_available = self.total_nodes;
                continue;
            }

            if start.is_none() {
                start = Some(k);
            }
            min_available = min_available.min(available);

            let length = next - k;
            if length >= remaining {
                break;
            }
            remaining -= length;
        }

        Ok(start.map(|start| EarliestStart {
            start,
            available_nodes: min_available,
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

    /// Determines if the job is present in the interval starting at the
    /// current origin.
    pub fn first_slot_contains(&self, job_id: u64) -> bool {
        self.slots
            .values()
            .next()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    /// Gets the number of available nodes in the interval starting at the
    /// current origin.
    pub fn num_available_nodes_in_first_slot(&self) -> u64 {
        self.slots
            .values()
            .next()
            .map(|set| self.total_nodes - set.nodes_used())
            .unwrap_or(self.total_nodes)
    }

    /// Resets the timeline to a single empty interval starting at the
    /// current origin.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.slots.insert(self.origin, JobSet::default());
    }

    /// Gets the intervals of the timeline as `(start, end, job ids)`
    /// triples.
    pub fn intervals(&self) -> Vec<(u64, u64, Vec<u64>)> {
        let mut out = Vec::new();
        let mut iter = self.slots.iter().peekable();
        while let Some((&k, set)) = iter.next() {
            let next = iter.peek().map(|&(&n, _)| n).unwrap_or(HORIZON);
            out.push((k, next, set.jobs().map(|j| j.id()).collect()));
        }
        out
    }
}

impl fmt::Display for NodeAvailabilityTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------ SCHEDULE -----")?;
        for (start, end, ids) in self.intervals() {
            write!(f, "[{start}, {end}) |")?;
            for id in ids {
                write!(f, " j={id}")?;
            }
            writeln!(f)?;
        }
        write!(f, "---- END SCHEDULE ---")
    }
}
