//! Scheduling engines for the Gantry simulator.
//!
//! This crate implements the two scheduling engines at the core of the
//! simulator, along with the job lifecycle model they share:
//!
//! * A **batch-queue** compute service ([`batch::BatchComputeService`]) that
//!   admits compound jobs onto a homogeneous cluster through a queue, driven
//!   by one of a family of scheduling policies: first-come-first-serve,
//!   conservative backfilling (at node or core granularity), and EASY
//!   backfilling (depths 0 and 1). The backfilling policies plan against an
//!   *availability timeline*, an interval map over simulated time recording
//!   which jobs occupy which resources.
//! * A **serverless** compute service
//!   ([`serverless::ServerlessComputeService`]) that drives function
//!   invocations through image placement, RAM/disk/core accounting, and
//!   execution, consulting a pluggable scheduler (FCFS, seeded random, or
//!   workload balancing) at every state change.
//!
//! Both services are cooperative actors on the [`gantry_sim`] substrate:
//! they block on a message port, handle exactly one message at a time, and
//! advance simulated time only by sleeping. Submitters interact through
//! cloneable handles whose synchronous calls carry a reply port; runtime
//! outcomes arrive on callback ports supplied at submission.

pub mod batch;
pub mod config;
mod error;
mod job;
mod payload;
pub mod serverless;

pub use error::*;
pub use job::*;
pub use payload::*;
