//! Implementation of the function manager.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::Function;
use super::ImageFile;
use super::Invocation;
use super::InvocationEvent;
use super::RegisteredFunction;
use super::ServerlessServiceHandle;
use super::StorageVolume;
use crate::Payload;
use crate::Result;

/// A thin, per-controller facade over the serverless API.
///
/// The manager creates functions, registers them with services, places
/// invocations, and collects completion notifications on its own callback
/// port. It holds no scheduling state of its own.
#[derive(Debug)]
pub struct FunctionManager {
    /// The manager's callback port, handed to every invocation it places.
    events_tx: mpsc::UnboundedSender<InvocationEvent>,
    /// The receiving side of the callback port.
    events_rx: mpsc::UnboundedReceiver<InvocationEvent>,
}

impl FunctionManager {
    /// Creates a new function manager.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx,
        }
    }

    /// Creates a function from a name, its code, its container image, and
    /// the volume the image lives on.
    pub fn create_function(
        name: impl Into<String>,
        code: impl Fn(Payload, Arc<StorageVolume>) -> BoxFuture<'static, Result<Payload>>
        + Send
        + Sync
        + 'static,
        image: ImageFile,
        source: Arc<StorageVolume>,
    ) -> Arc<Function> {
        Function::new(name, code, image, source)
    }

    /// Registers a function with a serverless service under the given
    /// limits.
    pub async fn register_function(
        &self,
        function: &Arc<Function>,
        service: &ServerlessServiceHandle,
        time_limit: f64,
        disk_limit: u64,
        ram_limit: u64,
        ingress: u64,
        egress: u64,
    ) -> Result<Arc<RegisteredFunction>> {
        service
            .register_function(function, time_limit, disk_limit, ram_limit, ingress, egress)
            .await
    }

    /// Places an invocation of a registered function.
    ///
    /// The invocation's terminal notification arrives on the manager's
    /// callback port; see [`next_event`](Self::next_event).
    pub async fn invoke_function(
        &self,
        registered: &Arc<RegisteredFunction>,
        service: &ServerlessServiceHandle,
        input: Payload,
    ) -> Result<Arc<Invocation>> {
        service
            .invoke_function(registered, input, self.events_tx.clone())
            .await
    }

    /// Suspends the caller until the invocation is terminal.
    pub async fn wait_one(&self, invocation: &Arc<Invocation>) {
        invocation.wait().await;
    }

    /// Suspends the caller until every given invocation is terminal.
    pub async fn wait_all(&self, invocations: &[Arc<Invocation>]) {
        for invocation in invocations {
            invocation.wait().await;
        }
    }

    /// Receives the next notification from the manager's callback port.
    pub async fn next_event(&mut self) -> Option<InvocationEvent> {
        self.events_rx.recv().await
    }
}
