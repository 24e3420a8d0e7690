#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-core` holds the primitives every ENDIT daemon shares: the payload
//! identifier filter, the staging-tree layout with its startup sanity pass,
//! signal flags polled by the supervisor loops, and the small set of raw
//! process operations (liveness probes, worker signalling).
//!
//! The staging tree is the only channel between the dCache plugin and the
//! daemons; nothing in this crate talks to the tape client. Everything here is
//! synchronous and allocation-light so the single-threaded supervisors can
//! call it on every tick.

pub mod error;
pub mod ident;
pub mod proc;
pub mod signals;
pub mod staging;

pub use error::{CoreError, CoreResult};
pub use staging::StagingTree;
