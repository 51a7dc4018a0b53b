//! Per-object processing callbacks invoked by the scan step.

use anyhow::Result;
use vapscan_core::IndexedObject;

/// Work performed on each listed object. `Ok(message)` records a successful
/// scan (the default message when `None`), `Err` records a failed one.
#[async_trait::async_trait]
pub trait ObjectProcessor: Send + Sync {
    async fn process(&self, obj: &IndexedObject) -> Result<Option<String>>;
}

/// Marks every object as scanned without inspecting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordScanned;

#[async_trait::async_trait]
impl ObjectProcessor for RecordScanned {
    async fn process(&self, _obj: &IndexedObject) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Adapter for synchronous closures.
pub struct FnProcessor<F>(pub F);

#[async_trait::async_trait]
impl<F> ObjectProcessor for FnProcessor<F>
where
    F: Fn(&IndexedObject) -> Result<Option<String>> + Send + Sync,
{
    async fn process(&self, obj: &IndexedObject) -> Result<Option<String>> {
        (self.0)(obj)
    }
}
