pub mod config;
pub mod downloader;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod progress;
pub mod queue;
pub mod server;
pub mod state_manager;
pub mod store;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::downloader::{DownloadError, ResumableFetcher};
    pub use crate::manager::{JobManager, ManagerSettings, StartedJob};
    pub use crate::models::{JobRecord, JobStatus, ProgressEvent, StartRequest};
    pub use crate::progress::ProgressBroadcaster;
    pub use crate::queue::{task_fn, Task, WorkerQueue};
    pub use crate::server::AppState;
    pub use crate::state_manager::StateManager;
    pub use crate::store::{JobStore, SharedStore};
}
