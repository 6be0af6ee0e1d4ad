//! Implementation of the serverless scheduler interface.

use std::sync::Arc;

use indexmap::IndexMap;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::balance::WorkloadBalancingServerlessScheduler;
use super::fcfs::FcfsServerlessScheduler;
use super::function::ImageFile;
use super::function::Invocation;
use super::random::RandomServerlessScheduler;
use super::state::SystemState;
use crate::config::ServerlessSchedulingPolicy;
use crate::config::ServerlessServiceConfig;

/// Represents a scheduler's image-placement decision: which images to copy
/// to and remove from each node.
#[derive(Debug, Default)]
pub struct ImageManagementDecision {
    /// The images to copy, per node name.
    pub copies: IndexMap<String, Vec<ImageFile>>,
    /// The images to remove, per node name.
    pub removals: IndexMap<String, Vec<ImageFile>>,
}

/// The interface every serverless scheduling policy implements.
///
/// A scheduling pass is two calls against one immutable snapshot: an
/// image-placement decision, then a set of invocation-to-node bindings. The
/// service executes whatever subset of the decisions is feasible and defers
/// the rest; schedulers therefore never hold write access to the system
/// state.
pub trait ServerlessScheduler: Send {
    /// Decides image copies and removals for the pending invocations.
    fn manage_images(
        &mut self,
        schedulable: &[Arc<Invocation>],
        state: &SystemState,
    ) -> ImageManagementDecision;

    /// Binds pending invocations to nodes.
    ///
    /// A binding is only honored if the target node holds the invocation's
    /// image and a free core at execution time; infeasible bindings are
    /// deferred, not errors.
    fn schedule_functions(
        &mut self,
        schedulable: &[Arc<Invocation>],
        state: &SystemState,
    ) -> Vec<(Arc<Invocation>, String)>;
}

/// Creates the scheduling policy named by the service configuration.
pub(crate) fn create_serverless_scheduler(
    config: &ServerlessServiceConfig,
) -> Box<dyn ServerlessScheduler> {
    match config.scheduler {
        ServerlessSchedulingPolicy::Fcfs => Box::new(FcfsServerlessScheduler::new()),
        ServerlessSchedulingPolicy::Random => Box::new(RandomServerlessScheduler::new(
            StdRng::seed_from_u64(config.seed),
        )),
        ServerlessSchedulingPolicy::Balance => {
            Box::new(WorkloadBalancingServerlessScheduler::new())
        }
    }
}
