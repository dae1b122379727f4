//! Values flowing between pipeline stages.

use crate::model::Event;
use serde_json::Value;

/// Input handed to a sender and output handed to the next stage.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineData {
    Bytes(Vec<u8>),
    Text(String),
    Event(Event),
    Events(Vec<Event>),
    /// Untyped items collected by an upstream batching stage.
    Batch(Vec<PipelineData>),
    Json(Value),
}

impl PipelineData {
    /// Byte form used for publishing and for retry staging.
    ///
    /// Bytes and text pass through untouched; everything else is JSON encoded.
    pub fn coerce_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            PipelineData::Bytes(bytes) => Ok(bytes.clone()),
            PipelineData::Text(text) => Ok(text.as_bytes().to_vec()),
            PipelineData::Event(event) => serde_json::to_vec(event),
            PipelineData::Events(events) => serde_json::to_vec(events),
            PipelineData::Json(value) => serde_json::to_vec(value),
            PipelineData::Batch(_) => serde_json::to_vec(&self.to_json()?),
        }
    }

    /// JSON view of the data. Raw bytes and text that are not JSON become strings.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            PipelineData::Bytes(bytes) => Ok(serde_json::from_slice(bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))),
            PipelineData::Text(text) => {
                Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone())))
            }
            PipelineData::Event(event) => serde_json::to_value(event),
            PipelineData::Events(events) => serde_json::to_value(events),
            PipelineData::Batch(items) => items
                .iter()
                .map(PipelineData::to_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            PipelineData::Json(value) => Ok(value.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineData::Bytes(_) => "bytes",
            PipelineData::Text(_) => "text",
            PipelineData::Event(_) => "event",
            PipelineData::Events(_) => "events",
            PipelineData::Batch(_) => "batch",
            PipelineData::Json(_) => "json",
        }
    }
}

impl From<Vec<u8>> for PipelineData {
    fn from(bytes: Vec<u8>) -> Self {
        PipelineData::Bytes(bytes)
    }
}

impl From<&str> for PipelineData {
    fn from(text: &str) -> Self {
        PipelineData::Text(text.to_string())
    }
}

impl From<Event> for PipelineData {
    fn from(event: Event) -> Self {
        PipelineData::Event(event)
    }
}

/// Ordered detection shared by the batch-aware writers: events, event list,
/// batches of events, then raw bytes holding either a list or a single event.
pub fn events_from_data(data: &PipelineData) -> Result<Vec<Event>, EventShapeError> {
    match data {
        PipelineData::Event(event) => Ok(vec![event.clone()]),
        PipelineData::Events(events) => Ok(events.clone()),
        PipelineData::Batch(items) => items
            .iter()
            .map(|item| match item {
                PipelineData::Event(event) => Ok(event.clone()),
                _ => Err(EventShapeError::UnsupportedBatchItem),
            })
            .collect(),
        PipelineData::Bytes(bytes) => events_from_slice(bytes),
        PipelineData::Text(text) => events_from_slice(text.as_bytes()),
        PipelineData::Json(_) => Err(EventShapeError::Unsupported(data.kind())),
    }
}

fn events_from_slice(raw: &[u8]) -> Result<Vec<Event>, EventShapeError> {
    if let Ok(events) = serde_json::from_slice::<Vec<Event>>(raw) {
        return Ok(events);
    }
    serde_json::from_slice::<Event>(raw)
        .map(|event| vec![event])
        .map_err(|_| EventShapeError::Unparseable)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventShapeError {
    #[error("unsupported data type passed in")]
    UnsupportedBatchItem,
    #[error("unsupported data type `{0}` passed in")]
    Unsupported(&'static str),
    #[error("the input data could not be parsed to an EdgeX Event either an array of EdgeX Events")]
    Unparseable,
}
