//! In-process strategy: apply the operation directly in the caller.

use super::{MapResults, ModelOpInvoker};
use crate::error::{Error, Result};
use crate::op::ModelOp;
use crate::sharing::ModelSource;
use std::fmt;
use tracing::debug;

/// Invoker that runs every input in the calling process, lazily, in input order.
///
/// Operation errors surface as [`Error::OperationFailed`] with worker index 0, and end the
/// map like they do for the pooled strategies.
pub struct InProcessInvoker<Op: ModelOp> {
    model: Option<Op::Model>,
}

impl<Op: ModelOp> InProcessInvoker<Op> {
    /// Create an invoker, materializing a handle right away.
    pub fn new(model: ModelSource<Op::Model>) -> Result<Self> {
        let fetched = !model.is_raw();
        let model = model.materialize()?;
        debug!(operation = Op::NAME, fetched, "in-process invoker ready");
        Ok(Self { model: Some(model) })
    }

    /// The bound model, until shutdown.
    pub fn model(&self) -> Option<&Op::Model> {
        self.model.as_ref()
    }
}

impl<Op: ModelOp> fmt::Debug for InProcessInvoker<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessInvoker")
            .field("operation", &Op::NAME)
            .field("loaded", &self.model.is_some())
            .finish_non_exhaustive()
    }
}

impl<Op: ModelOp> ModelOpInvoker<Op> for InProcessInvoker<Op> {
    fn map_iter(&mut self, inputs: Vec<Op::Args>) -> Result<MapResults<'_, Op::Output>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::Worker("invoker has been shut down".into()))?;
        let mut failed = false;
        Ok(MapResults::new(inputs.into_iter().map_while(move |args| {
            if failed {
                return None;
            }
            let result = Op::apply(model, args)
                .map_err(|source| Error::OperationFailed { worker: 0, source });
            failed = result.is_err();
            Some(result)
        })))
    }

    fn shutdown(&mut self) -> Result<()> {
        self.model = None;
        Ok(())
    }
}
