//! Implementation of the workload-balancing serverless scheduling policy.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use super::function::ImageFile;
use super::function::Invocation;
use super::scheduler::ImageManagementDecision;
use super::scheduler::ServerlessScheduler;
use super::state::SystemState;

/// A serverless scheduling policy that balances the pending workload across
/// function classes to minimize the overall makespan.
///
/// Each pass aggregates the pending workload per function (the sum of the
/// time limits of its pending invocations), allocates cores to functions
/// proportionally to their workload share (capped by their pending count),
/// and bin-packs the per-function core budgets onto nodes greedily, largest
/// budget first. Image copies are requested for every (node, function) pair
/// with a positive budget whose image is neither resident nor in flight.
#[derive(Debug, Default)]
pub struct WorkloadBalancingServerlessScheduler {
    /// The pending workload per function name, in time-limit seconds.
    function_workloads: HashMap<String, f64>,
    /// The pending invocation count per function name.
    function_pending: HashMap<String, usize>,
    /// The image of each pending function.
    function_images: HashMap<String, ImageFile>,
    /// The allocation plan of the current pass: node to function to cores.
    allocation_plan: IndexMap<String, IndexMap<String, u64>>,
}

impl WorkloadBalancingServerlessScheduler {
    /// Creates a new workload-balancing policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregates the pending workload per function.
    fn calculate_function_workloads(&mut self, invocations: &[Arc<Invocation>]) {
        self.function_workloads.clear();
        self.function_pending.clear();
        self.function_images.clear();

        for invocation in invocations {
            let registration = invocation.registered_function();
            let name = registration.function().name().to_string();

            self.function_images
                .entry(name.clone())
                .or_insert_with(|| registration.function().image().clone());

            // The time limit stands in for the runtime.
            *self.function_workloads.entry(name.clone()).or_default() +=
                registration.time_limit();
            *self.function_pending.entry(name).or_default() += 1;
        }
    }

    /// Builds the allocation plan for the current pass.
    fn create_allocation_plan(&mut self, state: &SystemState) {
        self.allocation_plan.clear();

        let available_cores = state.available_cores();
        let total_cores: u64 = available_cores.values().sum();
        for node in available_cores.keys() {
            self.allocation_plan.insert(node.clone(), IndexMap::new());
        }

        let total_workload: f64 = self.function_workloads.values().sum();
        if total_workload == 0.0 {
            return;
        }

        // Allocate cores proportionally to each function's workload share,
        // never more than it has pending invocations.
        let mut function_cores: Vec<(String, u64)> = self
            .function_workloads
            .iter()
            .filter_map(|(name, workload)| {
                let proportion = workload / total_workload;
                let cores = (proportion * total_cores as f64).ceil() as u64;
                let cores = cores.min(self.function_pending[name] as u64);
                (cores > 0).then(|| (name.clone(), cores))
            })
            .collect();

        // Largest budgets first; names break ties so the plan is stable.
        function_cores.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        // Greedy bin packing: each budget repeatedly goes to the node with
        // the most unallocated cores.
        for (function, cores_needed) in function_cores {
            let mut remaining = cores_needed;
            while remaining > 0 {
                let best = available_cores
                    .iter()
                    .map(|(node, &cores)| {
                        let allocated: u64 = self.allocation_plan[node].values().sum();
                        (node.clone(), cores.saturating_sub(allocated))
                    })
                    .max_by_key(|(_, available)| *available)
                    .filter(|(_, available)| *available > 0);

                let Some((node, available)) = best else {
                    break;
                };

                let granted = remaining.min(available);
                *self.allocation_plan[&node]
                    .entry(function.clone())
                    .or_default() += granted;
                remaining -= granted;
            }
        }
    }
}

impl ServerlessScheduler for WorkloadBalancingServerlessScheduler {
    fn manage_images(
        &mut self,
        schedulable: &[Arc<Invocation>],
        state: &SystemState,
    ) -> ImageManagementDecision {
        let mut decision = ImageManagementDecision::default();

        self.calculate_function_workloads(schedulable);
        self.create_allocation_plan(state);

        for (node, function_allocation) in &self.allocation_plan {
            // Copy each image a planned function needs, unless the node
            // already has it or is already receiving it.
            for (function, &cores) in function_allocation {
                if cores == 0 {
                    continue;
                }

                let image = &self.function_images[function];
                if !state.is_image_on_node(node, image)
                    && !state.is_image_being_copied_to_node(node, image)
                {
                    decision
                        .copies
                        .entry(node.clone())
                        .or_default()
                        .push(image.clone());
                }
            }

            // Storage is treated as plentiful; nothing is removed.
            decision.removals.entry(node.clone()).or_default();
        }

        decision
    }

    fn schedule_functions(
        &mut self,
        schedulable: &[Arc<Invocation>],
        state: &SystemState,
    ) -> Vec<(Arc<Invocation>, String)> {
        let mut bindings = Vec::new();
        let mut available_cores = state.available_cores();

        // Group the pending invocations by function, consumed from the
        // back.
        let mut by_function: HashMap<String, Vec<Arc<Invocation>>> = HashMap::new();
        for invocation in schedulable {
            let name = invocation
                .registered_function()
                .function()
                .name()
                .to_string();
            by_function.entry(name).or_default().push(invocation.clone());
        }

        for (node, function_allocation) in &self.allocation_plan {
            for (function, &cores_allocated) in function_allocation {
                let Some(invocations) = by_function.get_mut(function) else {
                    continue;
                };

                let mut scheduled = 0;
                while scheduled < cores_allocated
                    && !invocations.is_empty()
                    && available_cores[node] > 0
                {
                    let invocation = invocations.pop().expect("checked non-empty");

                    let image = invocation.registered_function().function().image();
                    if state.is_image_on_node(node, image) {
                        bindings.push((invocation, node.clone()));
                        available_cores[node] -= 1;
                        scheduled += 1;
                    }
                }
            }
        }

        bindings
    }
}
