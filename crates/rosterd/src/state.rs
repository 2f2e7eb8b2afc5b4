use std::sync::{Arc, Mutex};

use roster_core::{AttendanceRule, Clock, EuclideanMatcher};
use roster_store::Store;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::AppError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: EngineHandle,
    pub rule: Arc<AttendanceRule>,
    pub clock: Arc<dyn Clock>,
    store: Arc<Mutex<Store>>,
}

impl AppState {
    pub fn new(config: Config, store: Store, engine: EngineHandle, clock: Arc<dyn Clock>) -> Self {
        let rule = AttendanceRule::new(EuclideanMatcher::new(config.match_policy), config.tolerance);
        Self {
            config: Arc::new(config),
            engine,
            rule: Arc::new(rule),
            clock,
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Run a registry operation on the blocking pool.
    ///
    /// The connection mutex serializes every read and write, so the
    /// attendance compare-and-set and registration never interleave.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, AppError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|_| AppError::Internal("registry mutex poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| AppError::Internal(format!("registry task failed: {e}")))?
    }
}
