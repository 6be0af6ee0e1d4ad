//! Implementation of the serverless compute service.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use gantry_sim::NodeSpec;
use gantry_sim::Platform;
use gantry_sim::SimClock;
use gantry_sim::transfer_duration;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Error;
use crate::Payload;
use crate::Result;
use crate::config::ServerlessServiceConfig;

mod balance;
mod fcfs;
mod function;
mod manager;
mod random;
mod scheduler;
mod state;

pub use balance::*;
pub use fcfs::*;
pub use function::*;
pub use manager::*;
pub use random::*;
pub use scheduler::*;
pub use state::NodeSnapshot;
pub use state::SystemState;

use state::NodeState;

/// The port on which a submitter receives invocation notifications.
pub type InvocationCallbackPort = mpsc::UnboundedSender<InvocationEvent>;

/// Represents a notification delivered on an invocation callback port.
#[derive(Debug, Clone)]
pub enum InvocationEvent {
    /// The invocation has completed successfully.
    Done(Arc<Invocation>),
    /// The invocation has failed.
    Failed(Arc<Invocation>, Error),
}

/// Represents a message on the serverless service's port.
#[derive(Debug)]
enum ServerlessMessage {
    /// Stop the service, failing its pending invocations.
    Stop {
        /// Acknowledged once the service is down.
        reply: oneshot::Sender<()>,
    },
    /// Register a function with the service.
    Register {
        /// The function to register.
        function: Arc<Function>,
        /// The time limit of one invocation, in seconds.
        time_limit: f64,
        /// The scratch disk space one invocation may pin, in bytes.
        disk_limit: u64,
        /// The RAM one invocation pins while running, in bytes.
        ram_limit: u64,
        /// The declared ingress of one invocation, in bytes.
        ingress: u64,
        /// The declared egress of one invocation, in bytes.
        egress: u64,
        /// Answered with the registration.
        reply: oneshot::Sender<Result<Arc<RegisteredFunction>>>,
    },
    /// Place an invocation of a registered function.
    Invoke {
        /// The registered function to invoke.
        registered: Arc<RegisteredFunction>,
        /// The input of the invocation.
        input: Payload,
        /// The port notified when the invocation is terminal.
        notify: InvocationCallbackPort,
        /// Answered with the invocation handle.
        reply: oneshot::Sender<Result<Arc<Invocation>>>,
    },
    /// An image finished downloading into the service's cache.
    DownloadComplete {
        /// The name of the image.
        image: String,
    },
    /// An image finished copying onto a node's disk.
    CopyComplete {
        /// The index of the node.
        node: usize,
        /// The name of the image.
        image: String,
    },
    /// An image finished loading into a node's RAM.
    LoadComplete {
        /// The index of the node.
        node: usize,
        /// The name of the image.
        image: String,
    },
    /// An invocation's code finished executing.
    Finished {
        /// The id of the invocation.
        invocation: u64,
        /// The outcome of the code.
        result: Result<Payload>,
    },
}

/// A cloneable handle for interacting with a serverless compute service.
#[derive(Debug, Clone)]
pub struct ServerlessServiceHandle {
    /// The name of the service.
    name: String,
    /// The service's port.
    tx: mpsc::UnboundedSender<ServerlessMessage>,
    /// The network timeout for synchronous calls, in seconds.
    network_timeout: Option<f64>,
}

impl ServerlessServiceHandle {
    /// Gets the name of the service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a request and awaits its reply.
    async fn request<T>(&self, message: ServerlessMessage, rx: oneshot::Receiver<T>) -> Result<T> {
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

    /// Registers a function with the service under the given limits.
    ///
    /// Registering a second function with the same name answers
    /// [`Error::FunctionAlreadyRegistered`] and leaves the registry
    /// unchanged.
    pub async fn register_function(
        &self,
        function: &Arc<Function>,
        time_limit: f64,
        disk_limit: u64,
        ram_limit: u64,
        ingress: u64,
        egress: u64,
    ) -> Result<Arc<RegisteredFunction>> {
        let (tx, rx) = oneshot::channel();
        self.request(
            ServerlessMessage::Register {
                function: function.clone(),
                time_limit,
                disk_limit,
                ram_limit,
                ingress,
                egress,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Places an invocation of a registered function.
    ///
    /// Invoking a function that is not registered with this service fails
    /// synchronously. The returned invocation is shared with the service;
    /// its terminal notification arrives on `notify`.
    pub async fn invoke_function(
        &self,
        registered: &Arc<RegisteredFunction>,
        input: Payload,
        notify: InvocationCallbackPort,
    ) -> Result<Arc<Invocation>> {
        let (tx, rx) = oneshot::channel();
        self.request(
            ServerlessMessage::Invoke {
                registered: registered.clone(),
                input,
                notify,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Stops the service, failing all pending invocations with
    /// [`Error::ServiceIsDown`].
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(ServerlessMessage::Stop { reply: tx }, rx).await
    }
}

/// A serverless compute service driving function invocations through image
/// placement, resource accounting, and execution.
///
/// The service is a single cooperative actor. Every state change that frees
/// or claims resources triggers a scheduling pass: the configured scheduler
/// is consulted over an immutable snapshot, and the service executes the
/// feasible subset of its decisions. Image transfers and function code run
/// as spawned timed tasks that report back on the service's port.
pub struct ServerlessComputeService {
    /// The name of the service.
    name: String,
    /// The simulation clock.
    clock: SimClock,
    /// The service configuration.
    config: ServerlessServiceConfig,
    /// The per-node authoritative state, in declaration order.
    nodes: Vec<NodeState>,
    /// Node name to node index.
    node_index: IndexMap<String, usize>,
    /// The registered functions, by function name.
    functions: HashMap<String, Arc<RegisteredFunction>>,
    /// The images downloaded into the service's cache.
    cached_images: HashSet<String>,
    /// The in-flight downloads: image name to the invocations awaiting it.
    downloads: HashMap<String, Vec<u64>>,
    /// The schedulable (admitted, not yet bound) invocations, in admission
    /// order.
    schedulable: Vec<Arc<Invocation>>,
    /// Per node: the bound invocations that have not started running.
    pending_runs: Vec<VecDeque<u64>>,
    /// Every non-terminal invocation, by id.
    invocations: HashMap<u64, Arc<Invocation>>,
    /// The callback port of each non-terminal invocation.
    notifies: HashMap<u64, InvocationCallbackPort>,
    /// The scheduling policy.
    scheduler: Box<dyn ServerlessScheduler>,
    /// The next invocation id.
    next_invocation_id: u64,
    /// The service's port.
    rx: mpsc::UnboundedReceiver<ServerlessMessage>,
    /// A sender for the service's own port, handed to timed tasks.
    self_tx: mpsc::UnboundedSender<ServerlessMessage>,
}

impl ServerlessComputeService {
    /// Starts a serverless compute service over the given nodes, using the
    /// scheduling policy named by the configuration, and returns a handle
    /// to it.
    pub fn start(
        name: impl Into<String>,
        nodes: Vec<NodeSpec>,
        clock: &SimClock,
        config: ServerlessServiceConfig,
    ) -> Result<ServerlessServiceHandle> {
        let scheduler = create_serverless_scheduler(&config);
        Self::start_with_scheduler(name, nodes, clock, config, scheduler)
    }

    /// Starts a serverless compute service with a caller-provided
    /// scheduling policy.
    pub fn start_with_scheduler(
        name: impl Into<String>,
        nodes: Vec<NodeSpec>,
        clock: &SimClock,
        config: ServerlessServiceConfig,
        scheduler: Box<dyn ServerlessScheduler>,
    ) -> Result<ServerlessServiceHandle> {
        let name = name.into();
        config.validate()?;

        let platform =
            Platform::new(nodes).map_err(|e| Error::InvalidArgument(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ServerlessServiceHandle {
            name: name.clone(),
            tx: tx.clone(),
            network_timeout: config.network_timeout_seconds,
        };

        let node_states: Vec<NodeState> = platform
            .nodes()
            .iter()
            .map(|spec| NodeState::new(spec.clone()))
            .collect();
        let node_index = platform
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.clone(), i))
            .collect();
        let pending_runs = vec![VecDeque::new(); node_states.len()];

        let service = Self {
            name,
            clock: clock.clone(),
            config,
            nodes: node_states,
            node_index,
            functions: HashMap::new(),
            cached_images: HashSet::new(),
            downloads: HashMap::new(),
            schedulable: Vec::new(),
            pending_runs,
            invocations: HashMap::new(),
            notifies: HashMap::new(),
            scheduler,
            next_invocation_id: 1,
            rx,
            self_tx: tx,
        };
        tokio::spawn(service.run());

        Ok(handle)
    }

    /// The service's main loop.
    async fn run(mut self) {
        info!("serverless service `{name}` starting", name = self.name);

        while let Some(message) = self.rx.recv().await {
            match message {
                ServerlessMessage::Stop { reply } => {
                    self.fail_everything();
                    reply.send(()).ok();
                    break;
                }
                ServerlessMessage::Register {
                    function,
                    time_limit,
                    disk_limit,
                    ram_limit,
                    ingress,
                    egress,
                    reply,
                } => {
                    let result = self
                        .register(function, time_limit, disk_limit, ram_limit, ingress, egress);
                    reply.send(result).ok();
                }
                ServerlessMessage::Invoke {
                    registered,
                    input,
                    notify,
                    reply,
                } => {
                    let result = self.admit_invocation(registered, input, notify);
                    reply.send(result).ok();
                    self.scheduling_pass();
                }
                ServerlessMessage::DownloadComplete { image } => {
                    self.handle_download_complete(&image);
                    self.scheduling_pass();
                }
                ServerlessMessage::CopyComplete { node, image } => {
                    debug!("image `{image}` is now resident on node {node}");
                    self.nodes[node].finish_copy(&image, self.clock.now());
                    self.scheduling_pass();
                }
                ServerlessMessage::LoadComplete { node, image } => {
                    debug!("image `{image}` is now loaded in the RAM of node {node}");
                    self.nodes[node].finish_load(&image, self.clock.now());
                    self.scheduling_pass();
                }
                ServerlessMessage::Finished { invocation, result } => {
                    self.handle_finished(invocation, result);
                    self.scheduling_pass();
                }
            }
        }

        info!("serverless service `{name}` terminated", name = self.name);
    }

    /// Registers a function, rejecting duplicate names.
    fn register(
        &mut self,
        function: Arc<Function>,
        time_limit: f64,
        disk_limit: u64,
        ram_limit: u64,
        ingress: u64,
        egress: u64,
    ) -> Result<Arc<RegisteredFunction>> {
        if self.functions.contains_key(function.name()) {
            return Err(Error::FunctionAlreadyRegistered {
                function: function.name().to_string(),
                service: self.name.clone(),
            });
        }

        info!("registered function `{name}`", name = function.name());

        let registration = RegisteredFunction::new(
            function.clone(),
            self.name.clone(),
            time_limit,
            disk_limit,
            ram_limit,
            ingress,
            egress,
        );
        self.functions
            .insert(function.name().to_string(), registration.clone());
        Ok(registration)
    }

    /// Validates and admits a new invocation, kicking off the image fetch
    /// if needed.
    fn admit_invocation(
        &mut self,
        registered: Arc<RegisteredFunction>,
        input: Payload,
        notify: InvocationCallbackPort,
    ) -> Result<Arc<Invocation>> {
        let function_name = registered.function().name();
        if registered.service() != self.name || !self.functions.contains_key(function_name) {
            return Err(Error::FunctionNotRegistered {
                function: function_name.to_string(),
                service: self.name.clone(),
            });
        }

        let now = self.clock.now();
        let id = self.next_invocation_id;
        self.next_invocation_id += 1;

        let invocation = Invocation::new(id, registered.clone(), input, now);
        debug!("admitted invocation {id} of function `{function_name}`");

        // An image that can never fit on any node's disk or RAM dooms the
        // invocation immediately.
        let image = registered.function().image();
        let feasible = self
            .nodes
            .iter()
            .any(|node| image.size() <= node.spec().disk && image.size() <= node.spec().ram);
        if !feasible {
            let cause = Error::NotEnoughResources {
                job: function_name.to_string(),
                service: self.name.clone(),
            };
            invocation.mark_failed(now, cause.clone());
            notify
                .send(InvocationEvent::Failed(invocation.clone(), cause))
                .ok();
            return Ok(invocation);
        }

        self.invocations.insert(id, invocation.clone());
        self.notifies.insert(id, notify);
        invocation.set_status(InvocationStatus::Admitted);

        if self.cached_images.contains(image.name()) {
            self.schedulable.push(invocation.clone());
        } else if let Some(waiters) = self.downloads.get_mut(image.name()) {
            invocation.set_status(InvocationStatus::FetchingImage);
            waiters.push(id);
        } else {
            invocation.set_status(InvocationStatus::FetchingImage);
            self.downloads.insert(image.name().to_string(), vec![id]);

            debug!(
                "fetching image `{image}` from volume `{volume}`",
                image = image.name(),
                volume = registered.function().source().name()
            );
            let tx = self.self_tx.clone();
            let volume = registered.function().source().clone();
            let size = image.size();
            let image = image.name().to_string();
            tokio::spawn(async move {
                volume.read(size).await;
                tx.send(ServerlessMessage::DownloadComplete { image }).ok();
            });
        }

        Ok(invocation)
    }

    /// Makes every invocation waiting on a downloaded image schedulable.
    fn handle_download_complete(&mut self, image: &str) {
        debug!("image `{image}` is now in the service cache");
        self.cached_images.insert(image.to_string());

        for id in self.downloads.remove(image).unwrap_or_default() {
            if let Some(invocation) = self.invocations.get(&id) {
                invocation.set_status(InvocationStatus::Admitted);
                self.schedulable.push(invocation.clone());
            }
        }
    }

    /// Settles a finished invocation and notifies its submitter.
    fn handle_finished(&mut self, id: u64, result: Result<Payload>) {
        let invocation = self
            .invocations
            .remove(&id)
            .expect("a finish notification matches a known invocation");
        let node = invocation.node().expect("finished invocations are bound");
        let now = self.clock.now();

        self.nodes[node].release_run(invocation.registered_function(), now);

        let event = match result {
            Ok(output) => {
                debug!("invocation {id} has completed");
                invocation.mark_done(now, output);
                InvocationEvent::Done(invocation)
            }
            Err(cause) => {
                debug!("invocation {id} has failed: {cause}");
                invocation.mark_failed(now, cause.clone());
                InvocationEvent::Failed(invocation, cause)
            }
        };

        if let Some(notify) = self.notifies.remove(&id) {
            notify.send(event).ok();
        }
    }

    /// Builds the scheduler-visible snapshot of the cluster.
    fn system_state(&self) -> SystemState {
        SystemState::new(
            self.node_index
                .iter()
                .map(|(name, &i)| (name.clone(), self.nodes[i].snapshot()))
                .collect(),
        )
    }

    /// Runs scheduling passes until nothing more can be decided or
    /// executed.
    ///
    /// A single pass can unlock further work (an invocation starting to run
    /// releases its image pin, making the image evictable for a pending
    /// copy), so the pass repeats until a fixed point.
    fn scheduling_pass(&mut self) {
        loop {
            if self.pass_once() == 0 {
                break;
            }
        }
    }

    /// Runs one scheduling pass; returns the number of actions taken.
    ///
    /// Bindings run before image management so a freshly landed image is
    /// pinned by the invocation that needed it before any competing copy
    /// request can consider it for eviction.
    fn pass_once(&mut self) -> usize {
        let mut actions = 0;

        let state = self.system_state();
        let bindings = self.scheduler.schedule_functions(&self.schedulable, &state);
        for (invocation, node_name) in bindings {
            let Some(&node) = self.node_index.get(&node_name) else {
                warn!("scheduler bound an invocation to unknown node `{node_name}`");
                continue;
            };
            if self.try_bind(&invocation, node) {
                actions += 1;
            }
        }

        // Push every bound invocation as far as it can go.
        for node in 0..self.nodes.len() {
            actions += self.advance_node(node);
        }

        // Image management last, against the refreshed state.
        let state = self.system_state();
        let decision = self.scheduler.manage_images(&self.schedulable, &state);
        for (node_name, images) in decision.copies {
            let Some(&node) = self.node_index.get(&node_name) else {
                warn!("scheduler requested a copy to unknown node `{node_name}`");
                continue;
            };
            for image in images {
                if self.try_start_copy(node, &image) {
                    actions += 1;
                }
            }
        }
        for (node_name, images) in decision.removals {
            let Some(&node) = self.node_index.get(&node_name) else {
                warn!("scheduler requested a removal from unknown node `{node_name}`");
                continue;
            };
            for image in images {
                if self.nodes[node].try_remove_image(image.name()) {
                    actions += 1;
                }
            }
        }

        actions
    }

    /// Starts copying an image from the cache onto a node's disk.
    fn try_start_copy(&mut self, node: usize, image: &ImageFile) -> bool {
        if !self.nodes[node].try_start_copy(image) {
            return false;
        }

        debug!(
            "copying image `{image}` to node {node}",
            image = image.name()
        );

        // Invocations of the image observe the copy phase.
        for invocation in &self.schedulable {
            if invocation.registered_function().function().image().name() == image.name()
                && invocation.status() == InvocationStatus::Admitted
            {
                invocation.set_status(InvocationStatus::CopyingImageToNode);
            }
        }

        let tx = self.self_tx.clone();
        let clock = self.clock.clone();
        let seconds = transfer_duration(image.size(), self.config.disk_bandwidth);
        let image = image.name().to_string();
        tokio::spawn(async move {
            clock.sleep(seconds).await;
            tx.send(ServerlessMessage::CopyComplete { node, image }).ok();
        });
        true
    }

    /// Binds a schedulable invocation to a node, reserving one core and
    /// pinning the image's disk copy.
    fn try_bind(&mut self, invocation: &Arc<Invocation>, node: usize) -> bool {
        let Some(position) = self
            .schedulable
            .iter()
            .position(|i| i.id() == invocation.id())
        else {
            return false;
        };

        let image = invocation.registered_function().function().image();
        if !self.nodes[node].has_disk_image(image.name()) {
            // The copy has not landed yet; the binding is deferred.
            return false;
        }
        if !self.nodes[node].reserve_core() {
            return false;
        }

        debug!(
            "bound invocation {id} to node {node}",
            id = invocation.id()
        );

        self.schedulable.remove(position);
        self.nodes[node].pin_disk_image(image.name(), self.clock.now());
        invocation.bind(node);
        self.pending_runs[node].push_back(invocation.id());
        true
    }

    /// Pushes each of a node's bound invocations one step forward: initiate
    /// the image load, wait for it, or start running.
    fn advance_node(&mut self, node: usize) -> usize {
        let mut actions = 0;

        let ids: Vec<u64> = self.pending_runs[node].iter().copied().collect();
        for id in ids {
            let invocation = self.invocations[&id].clone();
            let registration = invocation.registered_function().clone();
            let image = registration.function().image().name().to_string();

            if self.nodes[node].has_ram_image(&image) {
                // The image is ready; all that is left is the run
                // reservation.
                let now = self.clock.now();
                if self.nodes[node].try_acquire_run(&registration, now) {
                    self.pending_runs[node].retain(|&pending| pending != id);
                    self.nodes[node].unpin_disk_image(&image);
                    self.start_running(&invocation, now);
                    actions += 1;
                }
            } else if self.nodes[node].is_loading(&image) {
                invocation.set_status(InvocationStatus::LoadingImageIntoRam);
            } else if self.nodes[node].try_start_load(&image) {
                invocation.set_status(InvocationStatus::LoadingImageIntoRam);
                actions += 1;

                debug!("loading image `{image}` into the RAM of node {node}");
                let tx = self.self_tx.clone();
                let clock = self.clock.clone();
                let seconds = transfer_duration(
                    registration.function().image().size(),
                    self.config.disk_bandwidth,
                );
                tokio::spawn(async move {
                    clock.sleep(seconds).await;
                    tx.send(ServerlessMessage::LoadComplete { node, image }).ok();
                });
            }
        }

        actions
    }

    /// Starts executing an invocation's code.
    fn start_running(&mut self, invocation: &Arc<Invocation>, now: f64) {
        info!(
            "invocation {id} of function `{name}` is running",
            id = invocation.id(),
            name = invocation.registered_function().function().name()
        );
        invocation.mark_running(now);

        let tx = self.self_tx.clone();
        let id = invocation.id();
        let code = invocation.registered_function().function().code();
        let input = invocation.input();
        let volume = invocation.registered_function().function().source().clone();
        tokio::spawn(async move {
            let result = code(input, volume).await;
            tx.send(ServerlessMessage::Finished {
                invocation: id,
                result,
            })
            .ok();
        });
    }

    /// Fails every pending invocation because the service is stopping.
    fn fail_everything(&mut self) {
        info!("failing all pending invocations");
        let now = self.clock.now();
        let cause = Error::ServiceIsDown {
            service: self.name.clone(),
        };

        for (id, invocation) in self.invocations.drain() {
            invocation.mark_failed(now, cause.clone());
            if let Some(notify) = self.notifies.remove(&id) {
                notify
                    .send(InvocationEvent::Failed(invocation, cause.clone()))
                    .ok();
            }
        }

        self.schedulable.clear();
        for pending in &mut self.pending_runs {
            pending.clear();
        }
    }
}
