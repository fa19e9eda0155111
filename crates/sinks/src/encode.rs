//! Shared wire encoding for the built-in sinks. `Record` itself carries no
//! `Serialize` impl (`streamship_common::record` keeps the live type
//! allocation-shaped, not wire-shaped), so every sink that emits JSON builds
//! its own serde-friendly view, the same split the teacher draws between
//! `LogEvent` and `WebhookLogEvent`.

use std::collections::BTreeMap;

use serde::Serialize;
use streamship_common::record::{
    FieldValue,
    QueueItem,
};

#[derive(Serialize)]
pub struct EncodedRecord<'a> {
    pub timestamp_ms: u128,
    pub message: std::borrow::Cow<'a, str>,
    pub source_type: &'static str,
    pub source_id: &'a str,
    pub labels: BTreeMap<&'a str, &'a str>,
    pub fields: BTreeMap<&'a str, &'a FieldValue>,
    pub retries: u32,
}

impl<'a> EncodedRecord<'a> {
    pub fn from_item(item: &'a QueueItem) -> Self {
        let record = &item.record;
        Self {
            timestamp_ms: record.timestamp.as_millis(),
            message: record.message_str(),
            source_type: match record.source_type {
                streamship_common::record::SourceType::File => "file",
                streamship_common::record::SourceType::Container => "container",
                streamship_common::record::SourceType::Other => "other",
            },
            source_id: &record.source_id,
            labels: record.labels.iter().collect(),
            fields: record.fields.iter().collect(),
            retries: item.retries,
        }
    }
}

pub fn encode_batch_ndjson(batch: &[QueueItem]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for item in batch {
        serde_json::to_writer(&mut out, &EncodedRecord::from_item(item))?;
        out.push(b'\n');
    }
    Ok(out)
}

pub fn encode_batch_json_array(batch: &[QueueItem]) -> anyhow::Result<Vec<u8>> {
    let encoded: Vec<EncodedRecord> = batch.iter().map(EncodedRecord::from_item).collect();
    Ok(serde_json::to_vec(&encoded)?)
}
