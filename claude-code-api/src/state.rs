//! Shared handles every HTTP surface dispatches through.

use std::sync::Arc;

use crate::core::config::Settings;
use crate::core::session_store::SessionStore;
use crate::core::task_store::TaskStore;
use crate::core::worker_pool::WorkerPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub sessions: Arc<SessionStore>,
    pub tasks: Arc<TaskStore>,
    pub settings: Arc<Settings>,
}
