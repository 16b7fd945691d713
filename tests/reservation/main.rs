//! Scenario tests for the reservation pipeline, run against the in-memory
//! stores and broker.

mod atomic;
mod end_to_end;
mod outbox;
mod sequential;
mod support;
