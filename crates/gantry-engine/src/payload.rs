//! Implementation of opaque payloads for function inputs and outputs.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::Error;
use crate::Result;

/// An opaque, cheaply cloneable payload passed into and out of function
/// code.
///
/// Submitters wrap whatever concrete type they like; function code declares
/// the concrete type it expects and fails the invocation with
/// [`Error::InvalidArgument`] when the payload does not match.
#[derive(Clone)]
pub struct Payload {
    /// The wrapped value.
    inner: Arc<dyn Any + Send + Sync>,
}

impl Payload {
    /// Wraps a value into a payload.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Gets a reference to the wrapped value if it is of type `T`.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// Gets a reference to the wrapped value, failing with
    /// [`Error::InvalidArgument`] if it is not of type `T`.
    pub fn expect_ref<T: Any + Send + Sync>(&self) -> Result<&T> {
        self.downcast_ref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "payload is not of the expected type `{ty}`",
                ty = std::any::type_name::<T>()
            ))
        })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").finish_non_exhaustive()
    }
}
