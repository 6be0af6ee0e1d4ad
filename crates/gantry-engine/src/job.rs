//! Implementation of the compound-job model shared by submitters and
//! compute services.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::Error;

/// The port on which a submitter receives job notifications.
pub type JobCallbackPort = mpsc::UnboundedSender<JobEvent>;

/// Represents a notification delivered on a job's callback port.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job has completed successfully.
    Done {
        /// The completed job.
        job: Arc<CompoundJob>,
        /// The name of the service that ran the job.
        service: String,
    },
    /// The job has failed.
    Failed {
        /// The failed job.
        job: Arc<CompoundJob>,
        /// The name of the service that ran the job.
        service: String,
        /// The cause of the failure.
        cause: Error,
    },
}

/// Represents what an action simulates when it executes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionKind {
    /// A computation of the given amount of work, in flop.
    ///
    /// The simulated duration is the work divided by the per-core speed of
    /// the node the action runs on.
    Compute(f64),
    /// A plain sleep of the given duration, in seconds.
    Sleep(f64),
}

/// Represents one action of a compound job.
///
/// Actions are opaque to the scheduling core: beyond its resource minimums
/// and its failure-cause slot, what an action does is only relevant to the
/// executor that runs it.
#[derive(Debug)]
pub struct Action {
    /// The name of the action, unique within its job.
    name: String,
    /// What the action simulates.
    kind: ActionKind,
    /// The minimum number of cores the action requires.
    min_cores: u64,
    /// The minimum amount of RAM the action requires, in bytes.
    min_ram: u64,
    /// The failure cause of the action, if any.
    failure_cause: Mutex<Option<Error>>,
}

impl Action {
    /// Creates a new action.
    fn new(name: impl Into<String>, kind: ActionKind, min_cores: u64, min_ram: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            min_cores,
            min_ram,
            failure_cause: Mutex::new(None),
        }
    }

    /// Gets the name of the action.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets what the action simulates.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Gets the minimum number of cores the action requires.
    pub fn min_cores(&self) -> u64 {
        self.min_cores
    }

    /// Gets the minimum amount of RAM the action requires, in bytes.
    pub fn min_ram(&self) -> u64 {
        self.min_ram
    }

    /// Gets the failure cause of the action, if one was recorded.
    pub fn failure_cause(&self) -> Option<Error> {
        self.failure_cause.lock().clone()
    }

    /// Sets the failure cause of the action, replacing any previous one.
    pub fn set_failure_cause(&self, cause: Error) {
        *self.failure_cause.lock() = Some(cause);
    }
}

/// Represents the lifecycle state of a compound job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundJobState {
    /// The job has not been submitted to a service yet.
    NotSubmitted,
    /// The job was admitted by a service and is pending or running.
    Submitted,
    /// The job completed successfully.
    Done,
    /// The job failed, timed out, or was terminated.
    Failed,
}

/// Represents a user-submitted unit of work: a named, ordered list of
/// actions with shared failure semantics.
///
/// A compound job carries a stack of callback ports. The top of the stack is
/// the port that receives the job's next notification; a compute service
/// pushes its own port before handing the job to an executor, becoming the
/// temporary submitter, and pops it again when the executor reports back.
#[derive(Debug)]
pub struct CompoundJob {
    /// The name of the job.
    name: String,
    /// The actions of the job, in submission order.
    actions: Mutex<Vec<Arc<Action>>>,
    /// The lifecycle state of the job.
    state: Mutex<CompoundJobState>,
    /// The stack of callback ports; the last element is the current
    /// notification target.
    callbacks: Mutex<Vec<JobCallbackPort>>,
}

impl CompoundJob {
    /// Creates a new, empty compound job with the given name.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            actions: Mutex::new(Vec::new()),
            state: Mutex::new(CompoundJobState::NotSubmitted),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Gets the name of the job.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a compute action to the job and returns it.
    pub fn add_compute_action(
        &self,
        name: impl Into<String>,
        flops: f64,
        min_cores: u64,
        min_ram: u64,
    ) -> Arc<Action> {
        self.add_action(Action::new(
            name,
            ActionKind::Compute(flops),
            min_cores,
            min_ram,
        ))
    }

    /// Adds a sleep action to the job and returns it.
    pub fn add_sleep_action(&self, name: impl Into<String>, seconds: f64) -> Arc<Action> {
        self.add_action(Action::new(name, ActionKind::Sleep(seconds), 1, 0))
    }

    /// Adds an action to the job.
    fn add_action(&self, action: Action) -> Arc<Action> {
        let action = Arc::new(action);
        self.actions.lock().push(action.clone());
        action
    }

    /// Gets the actions of the job, in submission order.
    pub fn actions(&self) -> Vec<Arc<Action>> {
        self.actions.lock().clone()
    }

    /// Gets the action with the given name, if any.
    pub fn action(&self, name: &str) -> Option<Arc<Action>> {
        self.actions
            .lock()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// Gets the largest minimum-cores requirement across the job's actions.
    ///
    /// An empty job requires one core.
    pub fn minimum_required_cores(&self) -> u64 {
        self.actions
            .lock()
            .iter()
            .map(|a| a.min_cores())
            .max()
            .unwrap_or(1)
    }

    /// Gets the largest minimum-RAM requirement across the job's actions, in
    /// bytes.
    pub fn minimum_required_ram(&self) -> u64 {
        self.actions
            .lock()
            .iter()
            .map(|a| a.min_ram())
            .max()
            .unwrap_or(0)
    }

    /// Gets the lifecycle state of the job.
    pub fn state(&self) -> CompoundJobState {
        *self.state.lock()
    }

    /// Sets the lifecycle state of the job.
    ///
    /// Only the job's current owner may call this.
    pub fn set_state(&self, state: CompoundJobState) {
        *self.state.lock() = state;
    }

    /// Pushes a callback port, making it the job's notification target.
    pub fn push_callback_port(&self, port: JobCallbackPort) {
        self.callbacks.lock().push(port);
    }

    /// Pops the current callback port, restoring the previous one.
    pub fn pop_callback_port(&self) -> Option<JobCallbackPort> {
        self.callbacks.lock().pop()
    }

    /// Gets a clone of the current callback port, if any.
    pub fn current_callback_port(&self) -> Option<JobCallbackPort> {
        self.callbacks.lock().last().cloned()
    }

    /// Records the given failure cause on every action that has none yet.
    pub fn propagate_failure_cause(&self, cause: &Error) {
        for action in self.actions.lock().iter() {
            if action.failure_cause().is_none() {
                action.set_failure_cause(cause.clone());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn aggregates_derive_from_actions() {
        let job = CompoundJob::new("job");
        assert_eq!(job.minimum_required_cores(), 1);
        assert_eq!(job.minimum_required_ram(), 0);

        job.add_compute_action("a", 1e9, 2, 1_000);
        job.add_compute_action("b", 1e9, 4, 500);
        job.add_sleep_action("c", 10.0);

        assert_eq!(job.minimum_required_cores(), 4);
        assert_eq!(job.minimum_required_ram(), 1_000);
        assert!(job.action("b").is_some());
        assert!(job.action("d").is_none());
    }

    #[test]
    fn callback_ports_form_a_stack() {
        let job = CompoundJob::new("job");
        let (submitter, _submitter_rx) = mpsc::unbounded_channel();
        let (service, _service_rx) = mpsc::unbounded_channel();

        job.push_callback_port(submitter.clone());
        job.push_callback_port(service.clone());

        assert!(
            job.current_callback_port()
                .unwrap()
                .same_channel(&service)
        );
        job.pop_callback_port();
        assert!(
            job.current_callback_port()
                .unwrap()
                .same_channel(&submitter)
        );
        job.pop_callback_port();
        assert!(job.current_callback_port().is_none());
    }

    #[test]
    fn failure_causes_propagate_to_unset_actions() {
        let job = CompoundJob::new("job");
        let a = job.add_sleep_action("a", 1.0);
        let b = job.add_sleep_action("b", 1.0);

        a.set_failure_cause(Error::InvalidArgument("explicit".to_string()));
        job.propagate_failure_cause(&Error::JobKilled {
            job: "job".to_string(),
        });

        assert_eq!(
            a.failure_cause().unwrap(),
            Error::InvalidArgument("explicit".to_string())
        );
        assert_eq!(
            b.failure_cause().unwrap(),
            Error::JobKilled {
                job: "job".to_string()
            }
        );
    }
}
