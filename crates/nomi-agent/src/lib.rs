//! Nomi agent worker: room transport, job dispatch and session bootstrap.
//!
//! A [`worker::Worker`] prewarms shared process data once, then runs
//! [`session::entrypoint`] for every room it is asked to join.

pub mod room;
pub mod session;
pub mod worker;

pub use session::{NomiProcessData, worker_options};
pub use worker::{JobRequest, Worker};
