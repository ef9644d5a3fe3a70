//! Feature loader interface.
//!
//! Loading a feature (the `require` analogue) is a host concern; the core
//! only drives it from autoload resolution and owns the per-path completion
//! signaling (see [`crate::autoload`]).

use std::sync::Arc;

use crate::context::RuntimeContext;
use crate::error::{RuntimeError, RuntimeResult};

/// Host hook that loads a feature by path.
pub trait FeatureLoader: Send + Sync {
    /// Load the feature at `path`. `Ok(true)` means the feature was loaded
    /// by this call, `Ok(false)` that it had already been loaded.
    fn load_feature(&self, ctx: &RuntimeContext, path: &str) -> RuntimeResult<bool>;
}

/// Loader for contexts without a host: every load fails.
pub struct NullLoader;

impl FeatureLoader for NullLoader {
    fn load_feature(&self, _ctx: &RuntimeContext, path: &str) -> RuntimeResult<bool> {
        Err(RuntimeError::load_error(path))
    }
}

/// Wrap a closure as a loader (test harnesses, embedders).
pub struct FnLoader<F>(pub F);

impl<F> FeatureLoader for FnLoader<F>
where
    F: Fn(&RuntimeContext, &str) -> RuntimeResult<bool> + Send + Sync,
{
    fn load_feature(&self, ctx: &RuntimeContext, path: &str) -> RuntimeResult<bool> {
        self.0(ctx, path)
    }
}

/// Convenience constructor for a boxed closure loader.
pub fn loader_fn<F>(f: F) -> Arc<dyn FeatureLoader>
where
    F: Fn(&RuntimeContext, &str) -> RuntimeResult<bool> + Send + Sync + 'static,
{
    Arc::new(FnLoader(f))
}
