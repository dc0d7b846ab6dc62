use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::{application::repos::FragmentStore, cache::InvalidationEngine};

/// Shared context handed to the requery worker.
pub struct RequeryWorkerContext<S: FragmentStore> {
    pub engine: Arc<InvalidationEngine<S>>,
}

impl<S: FragmentStore> RequeryWorkerContext<S> {
    pub fn new(engine: Arc<InvalidationEngine<S>>) -> Self {
        Self { engine }
    }
}

impl<S: FragmentStore> Clone for RequeryWorkerContext<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}
