//! Implementation of the function and invocation model.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use gantry_sim::transfer_duration;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::Error;
use crate::Payload;
use crate::Result;

/// Describes a container image file: a name and a declared size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    /// The name of the image file.
    name: String,
    /// The size of the image file, in bytes.
    size: u64,
}

impl ImageFile {
    /// Creates a new image-file descriptor.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Gets the name of the image file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the size of the image file, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A remote storage volume function images and data live on.
///
/// The volume is an external collaborator as far as scheduling is
/// concerned: the only thing the core consumes is the simulated time a
/// transfer takes.
#[derive(Debug)]
pub struct StorageVolume {
    /// The name of the volume.
    name: String,
    /// The bandwidth of the volume, in bytes per second.
    bandwidth: f64,
}

impl StorageVolume {
    /// Creates a new volume with the given bandwidth in bytes per second.
    pub fn new(name: impl Into<String>, bandwidth: f64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            bandwidth,
        })
    }

    /// Gets the name of the volume.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the bandwidth of the volume, in bytes per second.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// Reads the given number of bytes, suspending the caller for the
    /// simulated transfer time.
    pub async fn read(&self, bytes: u64) {
        self.transfer(bytes).await;
    }

    /// Writes the given number of bytes, suspending the caller for the
    /// simulated transfer time.
    pub async fn write(&self, bytes: u64) {
        self.transfer(bytes).await;
    }

    /// Suspends the caller for the duration of a transfer.
    async fn transfer(&self, bytes: u64) {
        let seconds = transfer_duration(bytes, self.bandwidth);
        if seconds > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
        }
    }
}

/// The code of a function: consumes an input payload and a storage handle,
/// produces an output payload or a failure cause.
pub type FunctionCode =
    Arc<dyn Fn(Payload, Arc<StorageVolume>) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;

/// An immutable descriptor of function code plus its container image.
pub struct Function {
    /// The unique name of the function.
    name: String,
    /// The code of the function.
    code: FunctionCode,
    /// The container image of the function.
    image: ImageFile,
    /// The volume the image is downloaded from.
    source: Arc<StorageVolume>,
}

impl Function {
    /// Creates a new function.
    pub fn new(
        name: impl Into<String>,
        code: impl Fn(Payload, Arc<StorageVolume>) -> BoxFuture<'static, Result<Payload>>
        + Send
        + Sync
        + 'static,
        image: ImageFile,
        source: Arc<StorageVolume>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            code: Arc::new(code),
            image,
            source,
        })
    }

    /// Gets the name of the function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the code of the function.
    pub(crate) fn code(&self) -> FunctionCode {
        self.code.clone()
    }

    /// Gets the container image of the function.
    pub fn image(&self) -> &ImageFile {
        &self.image
    }

    /// Gets the volume the image is downloaded from.
    pub fn source(&self) -> &Arc<StorageVolume> {
        &self.source
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

/// A function bound to a specific serverless service with explicit limits.
#[derive(Debug)]
pub struct RegisteredFunction {
    /// The registered function.
    function: Arc<Function>,
    /// The name of the service the function is registered with.
    service: String,
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
}

impl RegisteredFunction {
    /// Creates a new registration.
    pub(crate) fn new(
        function: Arc<Function>,
        service: String,
        time_limit: f64,
        disk_limit: u64,
        ram_limit: u64,
        ingress: u64,
        egress: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            function,
            service,
            time_limit,
            disk_limit,
            ram_limit,
            ingress,
            egress,
        })
    }

    /// Gets the registered function.
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    /// Gets the name of the service the function is registered with.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Gets the time limit of one invocation, in seconds.
    pub fn time_limit(&self) -> f64 {
        self.time_limit
    }

    /// Gets the scratch disk space one invocation may pin, in bytes.
    pub fn disk_limit(&self) -> u64 {
        self.disk_limit
    }

    /// Gets the RAM one invocation pins while running, in bytes.
    pub fn ram_limit(&self) -> u64 {
        self.ram_limit
    }

    /// Gets the declared ingress of one invocation, in bytes.
    pub fn ingress(&self) -> u64 {
        self.ingress
    }

    /// Gets the declared egress of one invocation, in bytes.
    pub fn egress(&self) -> u64 {
        self.egress
    }
}

/// Represents where an invocation stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    /// Submitted, not validated yet.
    Submitted,
    /// Validated and awaiting scheduling.
    Admitted,
    /// The function's image is being fetched from its source volume into
    /// the service's cache.
    FetchingImage,
    /// The function's image is being copied from the cache to a node disk.
    CopyingImageToNode,
    /// Bound to a node, with the image loading into the node's RAM.
    LoadingImageIntoRam,
    /// The function code is executing.
    Running,
    /// Completed successfully.
    Done,
    /// Failed.
    Failed,
}

/// The mutable state of an invocation; only its service writes it.
#[derive(Debug)]
struct InvocationState {
    /// Where the invocation stands.
    status: InvocationStatus,
    /// The node the invocation is bound to, if any.
    node: Option<usize>,
    /// The date the code started executing.
    start_date: Option<f64>,
    /// The date the invocation became terminal.
    finish_date: Option<f64>,
    /// The output, populated on success.
    output: Option<Payload>,
    /// The failure cause, populated on failure.
    failure_cause: Option<Error>,
}

/// An execution instance of a registered function.
///
/// An invocation is shared between its submitter and its service; only the
/// service mutates it. Accessors over the outcome answer
/// [`Error::InvocationNotReady`] until the invocation is terminal.
#[derive(Debug)]
pub struct Invocation {
    /// The service-scoped invocation id.
    id: u64,
    /// The registered function being invoked.
    registered: Arc<RegisteredFunction>,
    /// The input of the invocation.
    input: Payload,
    /// The date the invocation was submitted.
    submit_date: f64,
    /// The mutable state of the invocation.
    state: Mutex<InvocationState>,
    /// Flipped to `true` when the invocation becomes terminal.
    done: watch::Sender<bool>,
}

impl Invocation {
    /// Creates a new invocation.
    pub(crate) fn new(
        id: u64,
        registered: Arc<RegisteredFunction>,
        input: Payload,
        submit_date: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            registered,
            input,
            submit_date,
            state: Mutex::new(InvocationState {
                status: InvocationStatus::Submitted,
                node: None,
                start_date: None,
                finish_date: None,
                output: None,
                failure_cause: None,
            }),
            done: watch::Sender::new(false),
        })
    }

    /// Gets the service-scoped id of the invocation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Gets the registered function being invoked.
    pub fn registered_function(&self) -> &Arc<RegisteredFunction> {
        &self.registered
    }

    /// Gets the input of the invocation.
    pub(crate) fn input(&self) -> Payload {
        self.input.clone()
    }

    /// Gets the date the invocation was submitted.
    pub fn submit_date(&self) -> f64 {
        self.submit_date
    }

    /// Gets the date the code started executing, if it has.
    pub fn start_date(&self) -> Option<f64> {
        self.state.lock().start_date
    }

    /// Gets the date the invocation became terminal, if it has.
    pub fn finish_date(&self) -> Option<f64> {
        self.state.lock().finish_date
    }

    /// Gets where the invocation stands in its lifecycle.
    pub fn status(&self) -> InvocationStatus {
        self.state.lock().status
    }

    /// Gets the node index the invocation is bound to, if any.
    pub fn node(&self) -> Option<usize> {
        self.state.lock().node
    }

    /// Determines if the invocation is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status(),
            InvocationStatus::Done | InvocationStatus::Failed
        )
    }

    /// Determines if the invocation succeeded.
    ///
    /// Fails with [`Error::InvocationNotReady`] while the invocation is
    /// pending.
    pub fn has_succeeded(&self) -> Result<bool> {
        let state = self.state.lock();
        match state.status {
            InvocationStatus::Done => Ok(true),
            InvocationStatus::Failed => Ok(false),
            _ => Err(Error::InvocationNotReady),
        }
    }

    /// Gets the output of a successful invocation.
    ///
    /// Fails with [`Error::InvocationNotReady`] while the invocation is
    /// pending, and with the failure cause if it failed.
    pub fn output(&self) -> Result<Payload> {
        let state = self.state.lock();
        match state.status {
            InvocationStatus::Done => {
                Ok(state.output.clone().expect("done invocations have output"))
            }
            InvocationStatus::Failed => Err(state
                .failure_cause
                .clone()
                .expect("failed invocations have a cause")),
            _ => Err(Error::InvocationNotReady),
        }
    }

    /// Gets the failure cause of a terminal invocation, if any.
    ///
    /// Fails with [`Error::InvocationNotReady`] while the invocation is
    /// pending.
    pub fn failure_cause(&self) -> Result<Option<Error>> {
        let state = self.state.lock();
        match state.status {
            InvocationStatus::Done | InvocationStatus::Failed => Ok(state.failure_cause.clone()),
            _ => Err(Error::InvocationNotReady),
        }
    }

    /// Suspends the caller until the invocation is terminal.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        rx.wait_for(|done| *done).await.ok();
    }

    /// Sets the lifecycle status.
    pub(crate) fn set_status(&self, status: InvocationStatus) {
        self.state.lock().status = status;
    }

    /// Binds the invocation to a node.
    pub(crate) fn bind(&self, node: usize) {
        self.state.lock().node = Some(node);
    }

    /// Marks the start of code execution.
    pub(crate) fn mark_running(&self, now: f64) {
        let mut state = self.state.lock();
        state.status = InvocationStatus::Running;
        state.start_date = Some(now);
    }

    /// Marks the invocation as successfully completed.
    pub(crate) fn mark_done(&self, now: f64, output: Payload) {
        {
            let mut state = self.state.lock();
            state.status = InvocationStatus::Done;
            state.finish_date = Some(now);
            state.output = Some(output);
        }
        self.done.send_replace(true);
    }

    /// Marks the invocation as failed.
    pub(crate) fn mark_failed(&self, now: f64, cause: Error) {
        {
            let mut state = self.state.lock();
            state.status = InvocationStatus::Failed;
            state.finish_date = Some(now);
            state.failure_cause = Some(cause);
        }
        self.done.send_replace(true);
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Makes a registration for tests.
    fn registration() -> Arc<RegisteredFunction> {
        let volume = StorageVolume::new("store", 100e6);
        let function = Function::new(
            "f",
            |input, _| Box::pin(async move { Ok(input) }),
            ImageFile::new("f.img", 1_000),
            volume,
        );
        RegisteredFunction::new(function, "serverless".to_string(), 10.0, 0, 0, 0, 0)
    }

    #[test]
    fn accessors_fail_until_terminal() {
        let invocation = Invocation::new(1, registration(), Payload::new(1_u32), 0.0);

        assert_eq!(invocation.has_succeeded(), Err(Error::InvocationNotReady));
        assert!(matches!(
            invocation.output(),
            Err(Error::InvocationNotReady)
        ));
        assert_eq!(invocation.failure_cause(), Err(Error::InvocationNotReady));

        invocation.mark_running(1.0);
        assert_eq!(invocation.has_succeeded(), Err(Error::InvocationNotReady));

        invocation.mark_done(2.0, Payload::new("out"));
        assert_eq!(invocation.has_succeeded(), Ok(true));
        assert_eq!(invocation.failure_cause(), Ok(None));
        assert_eq!(
            *invocation.output().unwrap().downcast_ref::<&str>().unwrap(),
            "out"
        );
        assert_eq!(invocation.start_date(), Some(1.0));
        assert_eq!(invocation.finish_date(), Some(2.0));
    }

    #[test]
    fn exactly_one_of_output_and_cause_is_populated() {
        let ok = Invocation::new(1, registration(), Payload::new(()), 0.0);
        ok.mark_done(1.0, Payload::new(()));
        assert!(ok.output().is_ok());
        assert_eq!(ok.failure_cause().unwrap(), None);

        let failed = Invocation::new(2, registration(), Payload::new(()), 0.0);
        failed.mark_failed(1.0, Error::InvocationNotReady);
        assert!(failed.output().is_err());
        assert!(failed.failure_cause().unwrap().is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn wait_returns_once_terminal() {
        let invocation = Invocation::new(1, registration(), Payload::new(()), 0.0);

        let waiter = {
            let invocation = invocation.clone();
            tokio::spawn(async move { invocation.wait().await })
        };

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        invocation.mark_done(1.0, Payload::new(()));
        waiter.await.unwrap();

        // Waiting on an already-terminal invocation returns immediately.
        invocation.wait().await;
    }
}
