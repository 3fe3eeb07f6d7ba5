pub mod api;

use std::sync::Arc;

use crate::auth::AdminToken;
use crate::config::Source;
use crate::queue::QueueClient;
use crate::store::Store;
use crate::task_creator::TaskCreator;
use crate::tracker::ExecutionTracker;
use crate::workers::FetchWorker;

/// Shared handles for the management API.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queues: QueueClient,
    pub creator: Arc<TaskCreator>,
    pub tracker: Arc<ExecutionTracker>,
    pub fetch_worker: Arc<FetchWorker>,
    pub sources: Arc<Vec<Source>>,
    pub admin_token: AdminToken,
}
