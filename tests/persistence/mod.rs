#[path = "../support/engine.rs"]
mod support;

mod background_it;
mod compaction_it;
mod config_it;
mod file_store_it;
mod flush_it;
