//! End-to-end tests driving a full runtime against the simulated transport.

mod support;

mod engine;
mod link;
mod queue;
mod remote;
