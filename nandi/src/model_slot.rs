//! Single-flight, load-once holder for inference models.
//!
//! A `ModelSlot` is owned by the pipeline that uses it (not a process global). The
//! first caller of [`ModelSlot::get`] runs the loader; callers arriving while that
//! load is in flight block until it finishes and share its result. Successful loads
//! are memoized for the lifetime of the slot and the model is read-only afterwards.
//! A failed load is not memoized: the next caller tries again.

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::color_utils::symbols;

type Loader<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

pub struct ModelSlot<T> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    loader: Loader<T>,
    load_attempts: AtomicUsize,
}

impl<T> ModelSlot<T> {
    pub fn new<F>(name: &'static str, loader: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            name,
            cell: OnceCell::new(),
            loader: Box::new(loader),
            load_attempts: AtomicUsize::new(0),
        }
    }

    /// Wrap a model that is already in memory
    pub fn preloaded(name: &'static str, model: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        let slot = Self::new(name, || {
            Err(anyhow::anyhow!("preloaded model slot has no loader"))
        });
        // A fresh cell cannot already be set
        let _ = slot.cell.set(Arc::new(model));
        slot
    }

    /// Get the model, loading it on first use
    pub fn get(&self) -> Result<Arc<T>> {
        self.cell
            .get_or_try_init(|| {
                self.load_attempts.fetch_add(1, Ordering::SeqCst);
                let start = Instant::now();
                log::debug!("{}Loading {} model", symbols::checking(), self.name);

                let model = (self.loader)().map_err(|e| {
                    log::warn!(
                        "{}Failed to load {} model: {e}",
                        symbols::operation_failed(),
                        self.name
                    );
                    e
                })?;

                log::info!(
                    "{}{} model loaded in {:.1}ms",
                    symbols::model_loaded(),
                    self.name,
                    start.elapsed().as_secs_f64() * 1000.0
                );
                Ok(Arc::new(model))
            })
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Number of times the loader has been invoked
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> std::fmt::Debug for ModelSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .field("load_attempts", &self.load_attempts())
            .finish()
    }
}
