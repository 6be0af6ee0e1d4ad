//! Implementation of the engine's error and failure-cause types.

use thiserror::Error;

/// A specialized [`Result`](std::result::Result) type for engine
/// operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents an error returned by a service operation or attached to a job
/// or invocation as its failure cause.
///
/// Synchronous admission errors are returned on the reply port of the
/// requesting call; runtime failures are delivered on the submitter's
/// callback port with the cause embedded in the notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A service-specific argument was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A job or invocation requested more resources than the service can
    /// ever provide.
    #[error("job `{job}` requests more resources than service `{service}` can provide")]
    NotEnoughResources {
        /// The name of the job or invocation.
        job: String,
        /// The name of the service.
        service: String,
    },

    /// A job's walltime elapsed before it completed.
    #[error("job `{job}` exceeded its requested walltime")]
    JobTimeout {
        /// The name of the job.
        job: String,
    },

    /// A job was explicitly terminated.
    #[error("job `{job}` was killed")]
    JobKilled {
        /// The name of the job.
        job: String,
    },

    /// A service terminated while a job was pending or running, or an
    /// operation was attempted on a stopped service.
    #[error("service `{service}` is down")]
    ServiceIsDown {
        /// The name of the service.
        service: String,
    },

    /// A function was invoked on a service it is not registered with.
    #[error("function `{function}` is not registered with service `{service}`")]
    FunctionNotRegistered {
        /// The name of the function.
        function: String,
        /// The name of the service.
        service: String,
    },

    /// A function was registered twice with the same service.
    #[error("function `{function}` is already registered with service `{service}`")]
    FunctionAlreadyRegistered {
        /// The name of the function.
        function: String,
        /// The name of the service.
        service: String,
    },

    /// An accessor that requires a terminal invocation was called on a
    /// pending one.
    #[error("invocation not yet complete")]
    InvocationNotReady,

    /// A service was asked for functionality it does not provide.
    #[error("service `{service}` does not support {what}")]
    FunctionalityNotAvailable {
        /// The name of the service.
        service: String,
        /// A description of the unsupported functionality.
        what: String,
    },

    /// The service refused the operation.
    #[error("operation not allowed by service `{service}`: {reason}")]
    NotAllowed {
        /// The name of the service.
        service: String,
        /// The reason the operation was refused.
        reason: String,
    },

    /// A synchronous call received no answer within the configured network
    /// timeout.
    #[error("no answer from service `{service}` within the network timeout")]
    NetworkTimeout {
        /// The name of the service.
        service: String,
    },
}

/// Represents why a running job or an entire service is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The job was explicitly killed by its submitter.
    JobKilled,
    /// The job exceeded its requested walltime.
    JobTimeout,
    /// The service hosting the job was terminated.
    ServiceTerminated,
}

impl TerminationCause {
    /// Converts the termination cause into the failure cause observed by the
    /// submitter of the given job.
    pub fn failure_cause(&self, job: &str, service: &str) -> Error {
        match self {
            Self::JobKilled => Error::JobKilled {
                job: job.to_string(),
            },
            Self::JobTimeout => Error::JobTimeout {
                job: job.to_string(),
            },
            Self::ServiceTerminated => Error::ServiceIsDown {
                service: service.to_string(),
            },
        }
    }
}
