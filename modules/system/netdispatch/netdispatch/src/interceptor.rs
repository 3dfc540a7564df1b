//! Request mutators that run before a dispatch is delegated.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::error::DispatchError;
use crate::handler::DispatchHandler;
use crate::options::DispatchOptions;

/// Mutates a request before it is sent. An error ends the dispatch.
#[async_trait::async_trait]
pub trait DispatchInterceptor: Send + Sync {
    async fn intercept(&self, opts: &mut DispatchOptions) -> Result<(), DispatchError>;
}

/// Adapts a synchronous closure.
pub struct FnInterceptor<F>(pub F);

#[async_trait::async_trait]
impl<F> DispatchInterceptor for FnInterceptor<F>
where
    F: Fn(&mut DispatchOptions) -> Result<(), DispatchError> + Send + Sync,
{
    async fn intercept(&self, opts: &mut DispatchOptions) -> Result<(), DispatchError> {
        (self.0)(opts)
    }
}

/// Sets `user-agent` unless the request already has one.
#[derive(Debug, Clone)]
pub struct DefaultUserAgent(pub String);

#[async_trait::async_trait]
impl DispatchInterceptor for DefaultUserAgent {
    async fn intercept(&self, opts: &mut DispatchOptions) -> Result<(), DispatchError> {
        if !opts.headers.contains("user-agent") {
            opts.headers.insert("user-agent", self.0.as_str());
        }
        Ok(())
    }
}

/// Marks the request for the download or the API pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolTag {
    pub download: bool,
}

#[async_trait::async_trait]
impl DispatchInterceptor for PoolTag {
    async fn intercept(&self, opts: &mut DispatchOptions) -> Result<(), DispatchError> {
        opts.extensions.use_download_pool = Some(self.download);
        Ok(())
    }
}

/// Runs its interceptors in order, then delegates.
pub struct InteroperableDispatcher {
    interceptors: RwLock<Vec<Arc<dyn DispatchInterceptor>>>,
    inner: SharedDispatcher,
}

impl InteroperableDispatcher {
    #[must_use]
    pub fn new(interceptors: Vec<Arc<dyn DispatchInterceptor>>, inner: SharedDispatcher) -> Self {
        Self {
            interceptors: RwLock::new(interceptors),
            inner,
        }
    }

    /// Runs `interceptor` before every one registered so far.
    pub fn register(&self, interceptor: Arc<dyn DispatchInterceptor>) {
        self.interceptors.write().insert(0, interceptor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.read().is_empty()
    }
}

impl Dispatcher for InteroperableDispatcher {
    fn dispatch(&self, mut opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        let interceptors = self.interceptors.read().clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            for interceptor in &interceptors {
                if let Err(err) = interceptor.intercept(&mut opts).await {
                    tracing::debug!(error = %err, "dispatch interceptor rejected request");
                    handler.on_error(err);
                    return;
                }
            }
            inner.dispatch(opts, handler);
        });
    }
}
