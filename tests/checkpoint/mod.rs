#[path = "../support/engine.rs"]
mod support;

mod cursor_it;
mod ordering_it;
