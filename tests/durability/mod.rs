#[path = "../support/engine.rs"]
mod support;

mod replica_it;
mod resolution_it;
mod timeout_it;
