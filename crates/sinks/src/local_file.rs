//! `LocalFileSink`: appends newline-delimited JSON to a file and `fsync`s
//! once per batch (`spec.md` §4.9.1), a direct generalization of the
//! teacher's `LocalSink` — same append-mode-open + per-batch-fsync shape,
//! but reporting failure back to the router instead of retrying forever
//! internally, since retry ownership belongs to the Retry Manager here.

use std::{
    path::PathBuf,
    time::Instant,
};

use tokio::io::AsyncWriteExt;

use crate::{
    encode::encode_batch_ndjson,
    Sink,
    SinkErrorKind,
    SinkSendError,
};

pub struct LocalFileSink {
    name: String,
    path: PathBuf,
}

impl LocalFileSink {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }
}

#[async_trait::async_trait]
impl Sink for LocalFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        batch: &[streamship_common::record::QueueItem],
        deadline: Instant,
    ) -> Result<(), SinkSendError> {
        let payload = encode_batch_ndjson(batch)
            .map_err(|e| SinkSendError::new(SinkErrorKind::Client, false, e.to_string()))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let write = async {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.path)
                .await?;
            file.write_all(&payload).await?;
            file.sync_all().await
        };

        match tokio::time::timeout(remaining, write).await {
            Ok(Ok(())) => {
                tracing::debug!(sink = %self.name, records = batch.len(), path = %self.path.display(), "wrote batch to local sink");
                Ok(())
            },
            Ok(Err(e)) => Err(SinkSendError::new(
                SinkErrorKind::Server,
                true,
                format!("writing {}: {e}", self.path.display()),
            )),
            Err(_) => Err(SinkSendError::timeout(format!(
                "writing {} exceeded deadline",
                self.path.display()
            ))),
        }
    }

    fn is_healthy(&self) -> bool {
        self.path
            .parent()
            .map(|dir| dir.as_os_str().is_empty() || dir.is_dir())
            .unwrap_or(true)
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use streamship_common::record::{
        Labels,
        QueueItem,
        Record,
        SourceType,
    };
    use tempfile::tempdir;

    use super::*;

    fn item(message: &str) -> QueueItem {
        QueueItem::new(
            Record::new(
                Duration::from_secs(0),
                message.as_bytes().to_vec(),
                SourceType::File,
                Arc::<str>::from("file:a"),
                Labels::new(),
            ),
            Duration::from_secs(0),
        )
    }

    #[tokio::test]
    async fn writes_ndjson_and_fsyncs_once_per_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let sink = LocalFileSink::new("local", path.clone());

        let batch = vec![item("one"), item("two")];
        sink.send(&batch, Instant::now() + Duration::from_secs(5)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"message\":\"one\""));
    }

    #[tokio::test]
    async fn appends_across_multiple_sends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let sink = LocalFileSink::new("local", path.clone());

        sink.send(&[item("one")], Instant::now() + Duration::from_secs(5)).await.unwrap();
        sink.send(&[item("two")], Instant::now() + Duration::from_secs(5)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn missing_parent_directory_reports_unhealthy() {
        let sink = LocalFileSink::new("local", PathBuf::from("/no/such/directory/out.log"));
        assert!(!sink.is_healthy());
    }
}
