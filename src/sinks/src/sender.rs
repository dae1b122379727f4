use crate::context::AppFunctionContext;
use crate::data::PipelineData;
use crate::error::SenderError;
use async_trait::async_trait;

/// A pipeline stage delivering data to an external destination.
///
/// `Ok` carries the data handed to the next stage; `Err` halts the pipeline.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Function name used in log lines and error messages.
    fn name(&self) -> &str;

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError>;
}

pub(crate) fn require_data(
    name: &str,
    ctx: &dyn AppFunctionContext,
    data: Option<PipelineData>,
) -> Result<PipelineData, SenderError> {
    data.ok_or_else(|| {
        SenderError::NoData(format!(
            "function {name} in pipeline '{}': No Data Received",
            ctx.pipeline_id()
        ))
    })
}

pub(crate) fn coerce(name: &str, data: &PipelineData) -> Result<Vec<u8>, SenderError> {
    data.coerce_bytes().map_err(|err| {
        SenderError::UnsupportedData(format!(
            "function {name}: unable to convert {} data to bytes: {err}",
            data.kind()
        ))
    })
}
