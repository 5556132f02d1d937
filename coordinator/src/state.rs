use std::path::PathBuf;
use std::sync::Arc;

use crate::collaborators::FileSystem;
use crate::manager::LeaseManager;
use crate::queue::TaskQueue;

/// Lo que necesitan los handlers HTTP.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<TaskQueue>,
    pub manager: Arc<LeaseManager>,
    pub fs: Arc<dyn FileSystem>,
    // subidas de workers antes de ubicarlas en su salida
    pub uploads_dir: PathBuf,
}
