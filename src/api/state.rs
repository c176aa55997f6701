use std::sync::Arc;

use crate::engine::scheduler::WorkerEngine;
use crate::engine::EngineContext;

/// Shared state for the HTTP transport: the engine context plus the worker
/// handle, both behind Arcs so the router clones cheaply.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<EngineContext>,
    pub engine: Arc<WorkerEngine>,
}

impl AppState {
    pub fn new(ctx: Arc<EngineContext>, engine: Arc<WorkerEngine>) -> Self {
        Self { ctx, engine }
    }
}
