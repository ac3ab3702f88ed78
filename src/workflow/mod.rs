pub mod condition;
pub mod conditional;
pub mod controller;
pub mod decision;
pub mod executor;
pub mod hosts;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod parallel;
pub mod parser;
pub mod recovery;
pub mod state;
pub mod summary;
pub mod validate;
pub mod vars;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use orchestrator::{install_signal_handlers, EngineConfig, Orchestrator};

/// Bound for nested `@VAR@` expansion; prevents infinite loops on circular
/// references while allowing reasonable chaining depth.
pub const MAX_VARIABLE_EXPANSION_DEPTH: usize = 10;

/// Per-stream in-memory cap; beyond it output spills to a temp file.
pub const SPILL_THRESHOLD: usize = 1024 * 1024;

/// Read size for subprocess output draining.
pub const OUTPUT_CHUNK_SIZE: usize = 8192;

pub const MIN_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 1000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_EXEC_TYPE: &str = "pbrun";

/// Process-wide shutdown flag, tripped by signal handlers and polled at
/// every suspension point.
#[derive(Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
