//! Implementation of the random serverless scheduling policy.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use rand::rngs::StdRng;

use super::function::Invocation;
use super::scheduler::ImageManagementDecision;
use super::scheduler::ServerlessScheduler;
use super::state::SystemState;

/// A serverless scheduling policy that picks nodes uniformly at random.
///
/// The generator is seeded by the service configuration, so simulations
/// remain reproducible run to run.
#[derive(Debug)]
pub struct RandomServerlessScheduler {
    /// The seeded generator behind every choice.
    rng: StdRng,
}

impl RandomServerlessScheduler {
    /// Creates a new random policy over the given seeded generator.
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    /// Picks one element of a non-empty candidate list.
    fn pick<T: Clone>(&mut self, candidates: &[T]) -> Option<T> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..candidates.len());
        Some(candidates[index].clone())
    }
}

impl ServerlessScheduler for RandomServerlessScheduler {
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

            let handled = state.node_names().any(|node| {
                state.is_image_on_node(node, image) || state.is_image_being_copied_to_node(node, image)
            });
            if handled {
                continue;
            }

            let candidates: Vec<String> = state
                .node_names()
                .filter(|&node| state.node(node).total_disk >= image.size())
                .map(|n| n.to_string())
                .collect();

            if let Some(node) = self.pick(&candidates) {
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

        for invocation in schedulable {
            let registration = invocation.registered_function();
            let image = registration.function().image();

            let candidates: Vec<String> = state
                .node_names()
                .filter(|&node| {
                    state.is_image_on_node(node, image)
                        && free_cores[node] > 0
                        && state.node(node).available_ram >= registration.ram_limit()
                })
                .map(|n| n.to_string())
                .collect();

            if let Some(node) = self.pick(&candidates) {
                free_cores[&node] -= 1;
                bindings.push((invocation.clone(), node));
            }
        }

        bindings
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::Payload;
    use crate::serverless::Function;
    use crate::serverless::ImageFile;
    use crate::serverless::NodeSnapshot;
    use crate::serverless::RegisteredFunction;
    use crate::serverless::StorageVolume;
    use crate::serverless::SystemState;

    /// Makes a snapshot of idle nodes that all hold the image.
    fn snapshot(names: &[&str]) -> SystemState {
        SystemState::new(
            names
                .iter()
                .map(|name| {
                    (name.to_string(), NodeSnapshot {
                        total_cores: 4,
                        available_cores: 4,
                        total_ram: u64::MAX,
                        available_ram: u64::MAX,
                        total_disk: u64::MAX,
                        available_disk: u64::MAX,
                        resident_images: ["f.img".to_string()].into(),
                        copying_images: Default::default(),
                    })
                })
                .collect(),
        )
    }

    /// Makes `count` invocations of one function.
    fn invocations(count: usize) -> Vec<Arc<Invocation>> {
        let volume = StorageVolume::new("store", 100e6);
        let function = Function::new(
            "f",
            |input, _| Box::pin(async move { Ok(input) }),
            ImageFile::new("f.img", 100),
            volume,
        );
        let registration =
            RegisteredFunction::new(function, "serverless".to_string(), 10.0, 0, 0, 0, 0);

        (0..count)
            .map(|i| Invocation::new(i as u64, registration.clone(), Payload::new(()), 0.0))
            .collect()
    }

    #[test]
    fn identical_seeds_make_identical_choices() {
        let state = snapshot(&["node0", "node1", "node2"]);
        let pending = invocations(8);

        let choose = |seed: u64| {
            let mut scheduler = RandomServerlessScheduler::new(StdRng::seed_from_u64(seed));
            scheduler
                .schedule_functions(&pending, &state)
                .into_iter()
                .map(|(invocation, node)| (invocation.id(), node))
                .collect::<Vec<_>>()
        };

        assert_eq!(choose(42), choose(42));
    }

    #[test]
    fn choices_respect_core_availability() {
        let state = snapshot(&["node0", "node1"]);
        let pending = invocations(12);

        let mut scheduler = RandomServerlessScheduler::new(StdRng::seed_from_u64(0));
        let bindings = scheduler.schedule_functions(&pending, &state);

        // Eight cores exist in total; the rest defer.
        assert_eq!(bindings.len(), 8);
        for node in ["node0", "node1"] {
            assert_eq!(bindings.iter().filter(|(_, n)| n == node).count(), 4);
        }
    }
}
