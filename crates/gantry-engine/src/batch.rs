//! Implementation of the batch compute service.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use gantry_sim::Alarm;
use gantry_sim::NodeSpec;
use gantry_sim::Platform;
use gantry_sim::SimClock;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CompoundJob;
use crate::CompoundJobState;
use crate::Error;
use crate::JobEvent;
use crate::Result;
use crate::TerminationCause;
use crate::config::BatchServiceConfig;

mod conservative;
mod conservative_core;
mod core_timeline;
mod easy;
mod executor;
mod fcfs;
mod job;
mod scheduler;
mod timeline;
mod trace;

pub use conservative::*;
pub use conservative_core::*;
pub use core_timeline::*;
pub use easy::*;
pub use fcfs::*;
pub use job::*;
pub use scheduler::*;
pub use timeline::*;
pub use trace::TraceJob;
pub use trace::load_trace_file;

use executor::ExecutorHandle;
use executor::spawn_one_shot_executor;

/// The username assumed when a submission carries no `-u` argument.
const DEFAULT_USERNAME: &str = "you";

/// Represents one entry of a batch queue snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchQueueEntry {
    /// The submitting user.
    pub username: String,
    /// The name of the compound job.
    pub job_name: String,
    /// The requested number of nodes.
    pub num_nodes: u64,
    /// The requested number of cores per node.
    pub cores_per_node: u64,
    /// The requested walltime, in seconds, after padding.
    pub walltime: u64,
    /// The date the job was admitted.
    pub arrival: f64,
    /// The date the job started, or `-1.0` if it has not.
    pub start: f64,
}

/// Represents a message on the batch service's port.
#[derive(Debug)]
enum BatchServiceMessage {
    /// Stop the service, terminating its jobs.
    Stop {
        /// Whether failure notifications go out for terminated jobs.
        send_failure_notifications: bool,
        /// Why the service is stopping.
        cause: TerminationCause,
        /// Acknowledged once the service is down.
        reply: oneshot::Sender<()>,
    },
    /// Submit a compound job.
    Submit {
        /// The job to admit.
        job: Arc<CompoundJob>,
        /// The service-specific arguments of the submission.
        args: HashMap<String, String>,
        /// Answered with the admission outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Terminate a pending or running job.
    Terminate {
        /// The job to terminate.
        job: Arc<CompoundJob>,
        /// Answered with the termination outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Snapshot the queue.
    Queue {
        /// Answered with the snapshot.
        reply: oneshot::Sender<Vec<BatchQueueEntry>>,
    },
    /// Describe one aspect of the service's resources.
    ResourceInformation {
        /// The requested aspect.
        key: String,
        /// Answered with a per-host dictionary.
        reply: oneshot::Sender<Result<IndexMap<String, f64>>>,
    },
    /// Predict start dates for a set of job configurations.
    StartTimeEstimates {
        /// The configurations to predict for.
        specs: Vec<StartTimeEstimateSpec>,
        /// Answered with a per-id prediction.
        reply: oneshot::Sender<Result<HashMap<String, f64>>>,
    },
    /// A job's walltime alarm fired.
    AlarmTimeout {
        /// The id of the batch job.
        job_id: u64,
    },
}

/// Represents a job in the service's running table.
#[derive(Debug)]
struct RunningJob {
    /// The batch job.
    job: Arc<BatchJob>,
    /// The handle of the job's one-shot executor.
    executor: ExecutorHandle,
    /// The job's walltime alarm.
    alarm: Alarm,
}

/// A cloneable handle for interacting with a batch compute service.
///
/// Synchronous calls send a request and await the reply, observing
/// [`Error::NetworkTimeout`] if the configured network timeout elapses
/// first and [`Error::ServiceIsDown`] if the service is gone.
#[derive(Debug, Clone)]
pub struct BatchServiceHandle {
    /// The name of the service.
    name: String,
    /// The service's port.
    tx: mpsc::UnboundedSender<BatchServiceMessage>,
    /// The network timeout for synchronous calls, in seconds.
    network_timeout: Option<f64>,
}

impl BatchServiceHandle {
    /// Gets the name of the service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a request and awaits its reply.
    async fn request<T>(
        &self,
        message: BatchServiceMessage,
        rx: oneshot::Receiver<T>,
    ) -> Result<T> {
        let down = || Error::ServiceIsDown {
            service: self.name.clone(),
        };

        self.tx.send(message).map_err(|_| down())?;

        match self.network_timeout {
            Some(seconds) => match tokio::time::timeout(Duration::from_secs_f64(seconds), rx).await
            {
                Ok(reply) => reply.map_err(|_| down()),
                Err(_) => Err(Error::NetworkTimeout {
                    service: self.name.clone(),
                }),
            },
            None => rx.await.map_err(|_| down()),
        }
    }

    /// Submits a compound job with the given service-specific arguments.
    ///
    /// The arguments must carry positive integers under `-N` (nodes), `-c`
    /// (cores per node), and `-t` (walltime in seconds); `-u` (username) and
    /// `-color` are optional, and any other key must name an action of the
    /// job. Admission errors are returned here, before the job enters the
    /// queue; runtime outcomes arrive on the job's callback port.
    pub async fn submit_compound_job(
        &self,
        job: &Arc<CompoundJob>,
        args: &HashMap<String, String>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(
            BatchServiceMessage::Submit {
                job: job.clone(),
                args: args.clone(),
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Terminates a pending or running job.
    ///
    /// Terminating a job the service does not know answers
    /// [`Error::NotAllowed`].
    pub async fn terminate_compound_job(&self, job: &Arc<CompoundJob>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(
            BatchServiceMessage::Terminate {
                job: job.clone(),
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Snapshots the queue: every known job across pending and running,
    /// sorted by descending arrival date (ties broken by descending job
    /// name).
    pub async fn queue(&self) -> Result<Vec<BatchQueueEntry>> {
        let (tx, rx) = oneshot::channel();
        self.request(BatchServiceMessage::Queue { reply: tx }, rx).await
    }

    /// Describes one aspect of the service's resources.
    ///
    /// Recognized keys: `num_hosts`, `num_cores`, `num_idle_cores`,
    /// `ram_capacities`, and `ram_availabilities`.
    pub async fn resource_information(&self, key: &str) -> Result<IndexMap<String, f64>> {
        let (tx, rx) = oneshot::channel();
        self.request(
            BatchServiceMessage::ResourceInformation {
                key: key.to_string(),
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Predicts the start date of each given job configuration.
    pub async fn start_time_estimates(
        &self,
        specs: Vec<StartTimeEstimateSpec>,
    ) -> Result<HashMap<String, f64>> {
        let (tx, rx) = oneshot::channel();
        self.request(BatchServiceMessage::StartTimeEstimates { specs, reply: tx }, rx)
            .await?
    }

    /// Stops the service, terminating all of its jobs with the given cause.
    pub async fn stop(
        &self,
        send_failure_notifications: bool,
        cause: TerminationCause,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(
            BatchServiceMessage::Stop {
                send_failure_notifications,
                cause,
                reply: tx,
            },
            rx,
        )
        .await
    }
}

/// A batch compute service managing a homogeneous cluster.
///
/// The service is a single cooperative actor: it blocks on its port,
/// dispatches exactly one message, and then lets its scheduling policy
/// promote queued jobs. Started jobs run on ephemeral one-shot executors
/// that report back on the service's own callback port, and every start arms
/// a walltime alarm.
pub struct BatchComputeService {
    /// The name of the service.
    name: String,
    /// The simulation clock.
    clock: SimClock,
    /// The service configuration.
    config: BatchServiceConfig,
    /// The live free-core table.
    pool: NodePool,
    /// The scheduling policy.
    scheduler: Box<dyn BatchScheduler>,
    /// The pending jobs, in admission order.
    queue: VecDeque<Arc<BatchJob>>,
    /// The running jobs, by batch job id.
    running: HashMap<u64, RunningJob>,
    /// The next batch job id.
    next_job_id: u64,
    /// The service's port.
    rx: mpsc::UnboundedReceiver<BatchServiceMessage>,
    /// A sender for the service's own port, handed to alarms.
    self_tx: mpsc::UnboundedSender<BatchServiceMessage>,
    /// The callback port the service pushes onto jobs it starts.
    events_tx: mpsc::UnboundedSender<JobEvent>,
    /// The receiving side of the service's callback port.
    events_rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl BatchComputeService {
    /// Starts a batch compute service over the given nodes and returns a
    /// handle to it.
    ///
    /// The nodes must be homogeneous. When the configuration names a
    /// workload trace, the trace is loaded here (construction fails on
    /// invalid jobs unless they are ignored, and oversized jobs are silently
    /// capped to the cluster's shape) and a background replayer submits its
    /// jobs at their submit times.
    pub fn start(
        name: impl Into<String>,
        nodes: Vec<NodeSpec>,
        clock: &SimClock,
        config: BatchServiceConfig,
    ) -> Result<BatchServiceHandle> {
        let name = name.into();
        config.validate()?;

        let platform = Platform::homogeneous(nodes)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        let trace_jobs = match &config.workload_trace_file {
            Some(path) => {
                let mut jobs = load_trace_file(
                    path,
                    config.ignore_invalid_trace_jobs,
                    config.submit_time_of_first_trace_job,
                )
                .map_err(|e| Error::InvalidArgument(format!("{e:#}")))?;

                for job in &mut jobs {
                    job.requested_nodes = job.requested_nodes.min(platform.num_nodes());
                    job.requested_ram = job.requested_ram.min(platform.ram_per_node());
                }
                jobs
            }
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut scheduler = create_scheduler(&config, &platform);
        scheduler.init();

        let handle = BatchServiceHandle {
            name: name.clone(),
            tx: tx.clone(),
            network_timeout: config.network_timeout_seconds,
        };

        if !trace_jobs.is_empty() {
            tokio::spawn(trace::replay_trace(
                clock.clone(),
                handle.clone(),
                trace_jobs,
                platform.cores_per_node(),
                platform.speed(),
                config.use_real_runtimes_as_requested,
                config.simulate_computation_as_sleep,
            ));
        }

        let service = Self {
            name,
            clock: clock.clone(),
            config,
            pool: NodePool::new(platform),
            scheduler,
            queue: VecDeque::new(),
            running: HashMap::new(),
            next_job_id: 1,
            rx,
            self_tx: tx,
            events_tx,
            events_rx,
        };
        tokio::spawn(service.run());

        Ok(handle)
    }

    /// The service's main loop.
    async fn run(mut self) {
        info!("batch service `{name}` starting", name = self.name);
        self.scheduler.launch();

        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    match message {
                        Some(BatchServiceMessage::Stop {
                            send_failure_notifications,
                            cause,
                            reply,
                        }) => {
                            self.terminate_all(send_failure_notifications, cause);
                            reply.send(()).ok();
                            break;
                        }
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }

            let starts =
                self.scheduler
                    .process_queued_jobs(&self.queue, &mut self.pool, self.clock.now());
            self.execute_starts(starts);
        }

        self.scheduler.shutdown();
        info!("batch service `{name}` terminated", name = self.name);
    }

    /// Dispatches one port message.
    fn handle_message(&mut self, message: BatchServiceMessage) {
        match message {
            BatchServiceMessage::Stop { .. } => unreachable!("handled by the main loop"),
            BatchServiceMessage::Submit { job, args, reply } => {
                let result = self.admit(job, args);
                reply.send(result).ok();
            }
            BatchServiceMessage::Terminate { job, reply } => {
                let result = self.terminate_job(&job);
                reply.send(result).ok();
            }
            BatchServiceMessage::Queue { reply } => {
                reply.send(self.queue_snapshot()).ok();
            }
            BatchServiceMessage::ResourceInformation { key, reply } => {
                reply.send(self.resource_information(&key)).ok();
            }
            BatchServiceMessage::StartTimeEstimates { specs, reply } => {
                let estimates =
                    self.scheduler
                        .start_time_estimates(&specs, self.clock.now(), &self.name);
                reply.send(estimates).ok();
            }
            BatchServiceMessage::AlarmTimeout { job_id } => self.handle_timeout(job_id),
        }
    }

    /// Validates a submission and admits the job into the queue.
    fn admit(&mut self, job: Arc<CompoundJob>, args: HashMap<String, String>) -> Result<()> {
        let num_nodes = parse_positive_argument("-N", &args)?;
        let cores_per_node = parse_positive_argument("-c", &args)?;
        let walltime = parse_positive_argument("-t", &args)?;

        let username = args
            .get("-u")
            .cloned()
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        let color = args.get("-color").cloned();

        for key in args.keys() {
            if matches!(key.as_str(), "-N" | "-c" | "-t" | "-u" | "-color") {
                continue;
            }
            if job.action(key).is_none() {
                return Err(Error::InvalidArgument(format!(
                    "job `{name}` has no action named `{key}`",
                    name = job.name()
                )));
            }
        }

        let platform = self.pool.platform();
        if num_nodes > platform.num_nodes()
            || cores_per_node > platform.cores_per_node()
            || cores_per_node < job.minimum_required_cores()
            || job.minimum_required_ram() > platform.ram_per_node()
        {
            return Err(Error::NotEnoughResources {
                job: job.name().to_string(),
                service: self.name.clone(),
            });
        }

        let now = self.clock.now();
        let batch_job = BatchJob::new(
            self.next_job_id,
            job.clone(),
            username,
            color,
            num_nodes,
            cores_per_node,
            walltime + self.config.rjms_padding_delay_seconds,
            now,
        );
        self.next_job_id += 1;

        info!(
            "admitted job `{name}` as batch job {id}",
            name = job.name(),
            id = batch_job.id()
        );

        job.set_state(CompoundJobState::Submitted);
        self.queue.push_back(batch_job.clone());
        self.scheduler.process_job_submission(&batch_job, now);
        Ok(())
    }

    /// Starts the jobs a scheduling tick decided on.
    fn execute_starts(&mut self, starts: Vec<JobStart>) {
        for JobStart { job, allocation } in starts {
            let now = self.clock.now();
            let expected_end = now + job.requested_time() as f64;
            job.start(now, expected_end, allocation);
            self.queue.retain(|b| b.id() != job.id());

            info!(
                "starting a one-shot executor for job {id} on {nodes} nodes with {cores} cores \
                 per node",
                id = job.id(),
                nodes = job.requested_nodes(),
                cores = job.requested_cores_per_node()
            );

            // The service becomes the temporary submitter: the executor's
            // notification comes back here.
            let compound = job.compound().clone();
            compound.push_callback_port(self.events_tx.clone());

            let executor = spawn_one_shot_executor(
                &self.clock,
                &compound,
                self.pool.platform().speed(),
                self.config.task_selection_algorithm,
                &self.name,
            );
            let alarm = Alarm::start(
                &self.clock,
                expected_end,
                BatchServiceMessage::AlarmTimeout { job_id: job.id() },
                self.self_tx.clone(),
            );

            self.running.insert(job.id(), RunningJob {
                job,
                executor,
                alarm,
            });
        }
    }

    /// Finds the running entry wrapping the given compound job.
    fn find_running(&self, job: &Arc<CompoundJob>) -> Option<u64> {
        self.running
            .values()
            .find(|entry| Arc::ptr_eq(entry.job.compound(), job))
            .map(|entry| entry.job.id())
    }

    /// Pops the service's own callback port off a job, if it is on top.
    fn pop_own_callback_port(&self, job: &CompoundJob) {
        if let Some(port) = job.current_callback_port()
            && port.same_channel(&self.events_tx)
        {
            job.pop_callback_port();
        }
    }

    /// Handles an executor notification.
    fn handle_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Done { job, .. } => self.handle_job_exit(&job, None),
            JobEvent::Failed { job, cause, .. } => self.handle_job_exit(&job, Some(cause)),
        }
    }

    /// Handles a job leaving the running set, successfully or not.
    ///
    /// A notification for a job that is not running indicates corrupted
    /// bookkeeping and is fatal.
    fn handle_job_exit(&mut self, job: &Arc<CompoundJob>, cause: Option<Error>) {
        let id = self
            .find_running(job)
            .unwrap_or_else(|| panic!(
                "received an executor notification for job `{name}`, which is not in the running \
                 list",
                name = job.name()
            ));

        let entry = self.running.remove(&id).expect("id comes from the table");
        entry.alarm.kill();
        self.pool
            .release_allocation(&entry.job.allocation().expect("running jobs have started"));
        self.pop_own_callback_port(job);

        let now = self.clock.now();
        match cause {
            None => {
                info!("job {id} has completed");
                self.scheduler.process_job_completion(&entry.job, now);
                job.set_state(CompoundJobState::Done);
                if let Some(port) = job.current_callback_port() {
                    port.send(JobEvent::Done {
                        job: job.clone(),
                        service: self.name.clone(),
                    })
                    .ok();
                }
            }
            Some(cause) => {
                info!("job {id} has failed");
                self.scheduler.process_job_failure(&entry.job, now);
                job.propagate_failure_cause(&cause);
                job.set_state(CompoundJobState::Failed);
                if let Some(port) = job.current_callback_port() {
                    port.send(JobEvent::Failed {
                        job: job.clone(),
                        service: self.name.clone(),
                        cause,
                    })
                    .ok();
                }
            }
        }
    }

    /// Handles a walltime alarm.
    fn handle_timeout(&mut self, job_id: u64) {
        let Some(entry) = self.running.get_mut(&job_id) else {
            // The job completed in the same instant the alarm fired.
            debug!("received a timeout for unknown batch job {job_id}, ignoring");
            return;
        };

        info!("terminating the executor of job {job_id} (walltime exceeded)");
        entry.executor.stop(TerminationCause::JobTimeout, true);
    }

    /// Handles an explicit termination request.
    fn terminate_job(&mut self, job: &Arc<CompoundJob>) -> Result<()> {
        let now = self.clock.now();
        let killed = Error::JobKilled {
            job: job.name().to_string(),
        };

        // Running?
        if let Some(id) = self.find_running(job) {
            let mut entry = self.running.remove(&id).expect("id comes from the table");
            self.scheduler.process_job_termination(&entry.job, now);

            // The executor exits silently; cleanup and state are on us.
            entry.executor.stop(TerminationCause::JobKilled, false);
            entry.alarm.kill();
            self.pool
                .release_allocation(&entry.job.allocation().expect("running jobs have started"));
            self.pop_own_callback_port(job);
            job.propagate_failure_cause(&killed);
            job.set_state(CompoundJobState::Failed);
            return Ok(());
        }

        // Pending?
        if let Some(pos) = self
            .queue
            .iter()
            .position(|b| Arc::ptr_eq(b.compound(), job))
        {
            let batch_job = self.queue.remove(pos).expect("position comes from the queue");
            self.scheduler.process_job_termination(&batch_job, now);
            job.propagate_failure_cause(&killed);
            job.set_state(CompoundJobState::Failed);
            return Ok(());
        }

        Err(Error::NotAllowed {
            service: self.name.clone(),
            reason: "job is neither pending nor running".to_string(),
        })
    }

    /// Builds a queue snapshot.
    fn queue_snapshot(&self) -> Vec<BatchQueueEntry> {
        let entry = |job: &Arc<BatchJob>| BatchQueueEntry {
            username: job.username().to_string(),
            job_name: job.compound().name().to_string(),
            num_nodes: job.requested_nodes(),
            cores_per_node: job.requested_cores_per_node(),
            walltime: job.requested_time(),
            arrival: job.arrival(),
            start: job.begin().unwrap_or(-1.0),
        };

        let mut snapshot: Vec<BatchQueueEntry> = self
            .running
            .values()
            .map(|r| entry(&r.job))
            .chain(self.queue.iter().map(|j| entry(j)))
            .collect();

        snapshot.sort_by(|a, b| {
            b.arrival
                .total_cmp(&a.arrival)
                .then_with(|| b.job_name.cmp(&a.job_name))
        });
        snapshot
    }

    /// Builds a per-host dictionary describing one aspect of the service's
    /// resources.
    fn resource_information(&self, key: &str) -> Result<IndexMap<String, f64>> {
        let platform = self.pool.platform();
        let mut dict = IndexMap::new();

        match key {
            "num_hosts" => {
                dict.insert(self.name.clone(), platform.num_nodes() as f64);
            }
            "num_cores" => {
                for node in platform.nodes() {
                    dict.insert(node.name.clone(), node.cores as f64);
                }
            }
            "num_idle_cores" => {
                for (i, node) in platform.nodes().iter().enumerate() {
                    dict.insert(node.name.clone(), self.pool.free_cores(i) as f64);
                }
            }
            "ram_capacities" => {
                for node in platform.nodes() {
                    dict.insert(node.name.clone(), node.ram as f64);
                }
            }
            "ram_availabilities" => {
                // All or nothing: a node running anything reports zero.
                for (i, node) in platform.nodes().iter().enumerate() {
                    let available = if self.pool.free_cores(i) < node.cores {
                        0.0
                    } else {
                        node.ram as f64
                    };
                    dict.insert(node.name.clone(), available);
                }
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unknown resource information key `{key}`"
                )));
            }
        }

        Ok(dict)
    }

    /// Terminates every running and pending job, optionally notifying their
    /// submitters.
    fn terminate_all(&mut self, send_failure_notifications: bool, cause: TerminationCause) {
        info!("terminating all current jobs");

        let running: Vec<u64> = self.running.keys().copied().collect();
        for id in running {
            let mut entry = self.running.remove(&id).expect("id comes from the table");
            let compound = entry.job.compound().clone();

            entry.executor.stop(cause, false);
            entry.alarm.kill();
            self.pool
                .release_allocation(&entry.job.allocation().expect("running jobs have started"));
            self.pop_own_callback_port(&compound);

            let failure = cause.failure_cause(compound.name(), &self.name);
            compound.propagate_failure_cause(&failure);
            compound.set_state(CompoundJobState::Failed);

            if send_failure_notifications
                && let Some(port) = compound.current_callback_port()
            {
                port.send(JobEvent::Failed {
                    job: compound.clone(),
                    service: self.name.clone(),
                    cause: failure,
                })
                .ok();
            }
        }

        while let Some(batch_job) = self.queue.pop_front() {
            let compound = batch_job.compound().clone();
            let failure = cause.failure_cause(compound.name(), &self.name);
            compound.propagate_failure_cause(&failure);
            compound.set_state(CompoundJobState::Failed);

            if send_failure_notifications
                && let Some(port) = compound.current_callback_port()
            {
                port.send(JobEvent::Failed {
                    job: compound.clone(),
                    service: self.name.clone(),
                    cause: failure,
                })
                .ok();
            } else if !send_failure_notifications {
                warn!(
                    "dropping pending job `{name}` without notification",
                    name = compound.name()
                );
            }
        }
    }
}

/// Parses a required positive integer service-specific argument.
fn parse_positive_argument(key: &str, args: &HashMap<String, String>) -> Result<u64> {
    let value = args.get(key).ok_or_else(|| {
        Error::InvalidArgument(format!("the `{key}` argument is required for job submission"))
    })?;

    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidArgument(format!(
            "invalid `{key}` value `{value}`"
        ))),
    }
}
