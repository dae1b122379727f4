//! One-shot export: push a payload through every configured pipeline, persisting
//! whatever a sender stages for retry and resending it on the next run.

use crate::config::PipelineConfig;
use sinks::model::Event;
use sinks::{AppFunctionContext, PipelineData, Sender, SenderError, SenderRegistry, ServiceResources};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const RETRY_EXTENSION: &str = "retry";

/// Detects the shape of raw input: a list of events, a single event, or opaque bytes.
pub fn parse_input(raw: Vec<u8>) -> PipelineData {
    if let Ok(events) = serde_json::from_slice::<Vec<Event>>(&raw) {
        if !events.is_empty() {
            return PipelineData::Events(events);
        }
    }
    if let Ok(event) = serde_json::from_slice::<Event>(&raw) {
        return PipelineData::Event(event);
    }
    PipelineData::Bytes(raw)
}

/// Directory holding payloads staged by failed sends, one file per payload.
#[derive(Debug, Clone)]
pub struct RetryStore {
    dir: PathBuf,
}

impl RetryStore {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn stage(&self, pipeline_id: &str, correlation_id: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self
            .dir
            .join(format!("{pipeline_id}.{correlation_id}.{RETRY_EXTENSION}"));
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Staged payloads of `pipeline_id`, oldest first.
    pub fn pending(&self, pipeline_id: &str) -> io::Result<Vec<(PathBuf, Vec<u8>)>> {
        let prefix = format!("{pipeline_id}.");
        let mut staged: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(&self.dir)?
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(RETRY_EXTENSION))
                    .is_some_and(|correlation| {
                        correlation.ends_with('.') && correlation.matches('.').count() == 1
                    })
            })
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, entry.path()))
            })
            .collect();
        staged.sort();

        staged
            .into_iter()
            .map(|(_, path)| fs::read(&path).map(|data| (path, data)))
            .collect()
    }

    pub fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// A named pipeline terminated by one sender.
pub struct Pipeline {
    pub id: String,
    pub sender: Box<dyn Sender>,
}

/// Result of pushing one payload through one pipeline.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub pipeline_id: String,
    pub result: Result<PipelineData, SenderError>,
    pub staged: Option<PathBuf>,
}

pub struct ExportRunner {
    resources: ServiceResources,
    pipelines: Vec<Pipeline>,
    store: Option<RetryStore>,
}

impl ExportRunner {
    pub fn build(
        configs: &[PipelineConfig],
        registry: &SenderRegistry,
        resources: ServiceResources,
        store: Option<RetryStore>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut pipelines = Vec::with_capacity(configs.len());
        for cfg in configs {
            let sender = registry
                .instantiate(&cfg.function, &cfg.parameters)
                .map_err(|err| format!("pipeline `{}`: {}", cfg.id, err))?;
            tracing::info!(pipeline_id = %cfg.id, function = %cfg.function, "pipeline configured");
            pipelines.push(Pipeline {
                id: cfg.id.clone(),
                sender,
            });
        }
        Ok(Self {
            resources,
            pipelines,
            store,
        })
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    /// Resends payloads left in the retry store by earlier runs.
    ///
    /// A payload that fails again is staged anew (when its sender persists on
    /// error) and the old copy is removed either way.
    pub async fn resend_pending(&self) -> Vec<PipelineOutcome> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let mut outcomes = Vec::new();
        for pipeline in &self.pipelines {
            let pending = match store.pending(&pipeline.id) {
                Ok(pending) => pending,
                Err(err) => {
                    tracing::warn!(pipeline_id = %pipeline.id, error = %err, "failed to list staged payloads");
                    continue;
                }
            };
            for (path, data) in pending {
                tracing::info!(pipeline_id = %pipeline.id, path = %path.display(), "resending staged payload");
                outcomes.push(self.run_pipeline(pipeline, PipelineData::Bytes(data)).await);
                if let Err(err) = store.remove(&path) {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove resent payload");
                }
            }
        }
        outcomes
    }

    /// Pushes `data` through every pipeline in configuration order.
    pub async fn run(&self, data: &PipelineData) -> Vec<PipelineOutcome> {
        let mut outcomes = Vec::with_capacity(self.pipelines.len());
        for pipeline in &self.pipelines {
            outcomes.push(self.run_pipeline(pipeline, data.clone()).await);
        }
        outcomes
    }

    async fn run_pipeline(&self, pipeline: &Pipeline, data: PipelineData) -> PipelineOutcome {
        let ctx = self.resources.context(pipeline.id.as_str());
        let result = pipeline.sender.send(&ctx, Some(data)).await;
        match &result {
            Ok(output) => tracing::info!(
                pipeline_id = %pipeline.id,
                correlation_id = ctx.correlation_id(),
                function = pipeline.sender.name(),
                output = output.kind(),
                "pipeline completed"
            ),
            Err(err) => tracing::error!(
                pipeline_id = %pipeline.id,
                correlation_id = ctx.correlation_id(),
                function = pipeline.sender.name(),
                error = %err,
                "pipeline halted"
            ),
        }

        let staged = match (ctx.retry_data(), self.store.as_ref()) {
            (Some(data), Some(store)) => {
                match store.stage(&pipeline.id, ctx.correlation_id(), &data) {
                    Ok(path) => Some(path),
                    Err(err) => {
                        tracing::error!(pipeline_id = %pipeline.id, error = %err, "failed to persist staged payload");
                        None
                    }
                }
            }
            (Some(data), None) => {
                tracing::warn!(
                    pipeline_id = %pipeline.id,
                    size = data.len(),
                    "payload staged for retry but no retry store is configured"
                );
                None
            }
            (None, _) => None,
        };

        PipelineOutcome {
            pipeline_id: pipeline.id.clone(),
            result,
            staged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn input_shape_detection() {
        let event = r#"{"deviceName":"dev-1","readings":[]}"#;
        assert!(matches!(parse_input(event.as_bytes().to_vec()), PipelineData::Event(e) if e.device_name == "dev-1"));

        let events = format!("[{event},{event}]");
        assert!(matches!(parse_input(events.into_bytes()), PipelineData::Events(list) if list.len() == 2));

        assert_eq!(
            parse_input(br#"{"reading":42}"#.to_vec()),
            PipelineData::Bytes(br#"{"reading":42}"#.to_vec())
        );
        assert_eq!(parse_input(b"[]".to_vec()), PipelineData::Bytes(b"[]".to_vec()));
    }

    #[test]
    fn retry_store_keeps_payloads_per_pipeline() {
        let tmp = TempDir::new().unwrap();
        let store = RetryStore::open(tmp.path().join("retry")).unwrap();
        let first = store.stage("cloud", "c1", b"one").unwrap();
        store.stage("cloud.eu", "c2", b"other pipeline").unwrap();

        let pending = store.pending("cloud").unwrap();
        assert_eq!(pending, vec![(first.clone(), b"one".to_vec())]);

        store.remove(&first).unwrap();
        assert!(store.pending("cloud").unwrap().is_empty());
        assert_eq!(store.pending("cloud.eu").unwrap().len(), 1);
    }
}
