//! Implementation of the FCFS serverless scheduling policy.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use super::function::Invocation;
use super::scheduler::ImageManagementDecision;
use super::scheduler::ServerlessScheduler;
use super::state::SystemState;

/// A first-come-first-serve serverless scheduling policy.
///
/// Image management walks the pending invocations in queue order and, for
/// every image present nowhere on the cluster, requests one copy onto the
/// first node whose disk could ever hold it; images are never removed.
/// Binding walks the invocations in queue order and picks, for each, the
/// first node holding its image with a free core and enough free RAM.
#[derive(Debug)]
pub struct FcfsServerlessScheduler;

impl FcfsServerlessScheduler {
    /// Creates a new FCFS policy.
    pub fn new() -> Self {
        Self
    }
}

impl ServerlessScheduler for FcfsServerlessScheduler {
    fn manage_images(
        &mut self,
        schedulable: &[Arc<Invocation>],
        state: &SystemState,
    ) -> ImageManagementDecision {
        let mut decision = ImageManagementDecision::default();
        let mut planned: HashSet<String> = HashSet::new();

        for invocation in schedulable {
            let image = invocation.registered_function().function().image();
            if planned.contains(image.name()) {
                continue;
            }

            // An image already somewhere on the cluster, or on its way
            // there, needs no new copy.
            let handled = state.node_names().any(|node| {
                state.is_image_on_node(node, image) || state.is_image_being_copied_to_node(node, image)
            });
            if handled {
                continue;
            }

            let target = state
                .node_names()
                .find(|&node| state.node(node).total_disk >= image.size())
                .map(|n| n.to_string());
            if let Some(node) = target {
                decision
                    .copies
                    .entry(node)
                    .or_default()
                    .push(image.clone());
                planned.insert(image.name().to_string());
            }
        }

        decision
    }

    fn schedule_functions(
        &mut self,
        schedulable: &[Arc<Invocation>],
        state: &SystemState,
    ) -> Vec<(Arc<Invocation>, String)> {
        let mut bindings = Vec::new();
        let mut free_cores = state.available_cores();
        let mut free_ram: IndexMap<String, u64> = state
            .node_names()
            .map(|n| (n.to_string(), state.node(n).available_ram))
            .collect();

        for invocation in schedulable {
            let registration = invocation.registered_function();
            let image = registration.function().image();

            let target = state
                .node_names()
                .find(|&node| {
                    state.is_image_on_node(node, image)
                        && free_cores[node] > 0
                        && free_ram[node] >= registration.ram_limit()
                })
                .map(|n| n.to_string());

            // A binding that fits nowhere is deferred; a later
            // resource-freeing event retries.
            if let Some(node) = target {
                free_cores[&node] -= 1;
                free_ram[&node] -= registration.ram_limit();
                bindings.push((invocation.clone(), node));
            }
        }

        bindings
    }
}
