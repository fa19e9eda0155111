//! Frame stage: assembles multi-line logical records from the one-line-per-
//! record stream sources emit (`spec.md` §4.5). A continuation line (one
//! matching the configured pattern, e.g. a stack-trace frame indented under
//! its header) is appended to the record it continues rather than starting a
//! new one.

use std::{
    collections::HashMap,
    sync::Arc,
};

use regex::Regex;
use streamship_common::record::Record;
use streamship_config::FrameConfig;

struct Pending {
    record: Record,
    lines: usize,
}

pub struct FrameAssembler {
    continuation: Option<Regex>,
    max_lines: usize,
    pending: HashMap<Arc<str>, Pending>,
}

impl FrameAssembler {
    pub fn new(config: &FrameConfig) -> anyhow::Result<Self> {
        let continuation = match (&config.continuation_pattern, config.enabled) {
            (Some(pattern), true) => Some(Regex::new(pattern)?),
            _ => None,
        };
        Ok(Self {
            continuation,
            max_lines: config.max_lines.max(1),
            pending: HashMap::new(),
        })
    }

    /// Feeds one per-line record through the assembler. Returns a completed
    /// logical record when a boundary is reached: a non-continuation line
    /// arrives (flushing whatever was pending for that source), or an
    /// in-progress record hits `max_lines`.
    pub fn push(&mut self, record: Record) -> Option<Record> {
        let Some(continuation) = &self.continuation else {
            return Some(record);
        };

        let is_continuation = continuation.is_match(&record.message_str());
        if is_continuation {
            if let Some(pending) = self.pending.get_mut(&record.source_id) {
                let merged = [pending.record.message.as_ref(), b"\n", record.message.as_ref()].concat();
                pending.record = Record::new(
                    pending.record.timestamp,
                    merged,
                    pending.record.source_type,
                    pending.record.source_id.clone(),
                    pending.record.labels.clone(),
                )
                .with_fields(pending.record.fields.clone());
                pending.lines += 1;
                if pending.lines >= self.max_lines {
                    return self.pending.remove(&record.source_id).map(|p| p.record);
                }
                return None;
            }
            // A continuation line with nothing to continue (e.g. the first
            // line written to a fresh file looks like one); pass it through
            // standalone rather than dropping it.
            return Some(record);
        }

        let flushed = self.pending.remove(&record.source_id).map(|p| p.record);
        self.pending.insert(
            record.source_id.clone(),
            Pending {
                record,
                lines: 1,
            },
        );
        flushed
    }

    /// Flushes every in-progress buffer. Called at shutdown so the last
    /// logical record per source isn't lost.
    pub fn flush_all(&mut self) -> Vec<Record> {
        self.pending.drain().map(|(_, p)| p.record).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use streamship_common::record::{
        Labels,
        SourceType,
    };

    use super::*;

    fn line(source: &str, text: &str, secs: u64) -> Record {
        Record::new(
            Duration::from_secs(secs),
            text.as_bytes().to_vec(),
            SourceType::File,
            source,
            Labels::new(),
        )
    }

    #[test]
    fn disabled_framing_passes_every_line_through() {
        let mut assembler = FrameAssembler::new(&FrameConfig {
            enabled: false,
            continuation_pattern: None,
            max_lines: 500,
        })
        .unwrap();
        assert!(assembler.push(line("a", "one", 0)).is_some());
        assert!(assembler.push(line("a", "two", 1)).is_some());
    }

    #[test]
    fn continuation_lines_are_merged_into_the_header_line() {
        let mut assembler = FrameAssembler::new(&FrameConfig {
            enabled: true,
            continuation_pattern: Some(r"^\s+".to_string()),
            max_lines: 500,
        })
        .unwrap();
        assert!(assembler.push(line("a", "Exception: boom", 0)).is_none());
        assert!(assembler.push(line("a", "    at foo.rs:1", 0)).is_none());
        let flushed = assembler.push(line("a", "next record", 1)).unwrap();
        assert_eq!(flushed.message_str().as_ref(), "Exception: boom\n    at foo.rs:1");
    }

    #[test]
    fn max_lines_forces_a_flush() {
        let mut assembler = FrameAssembler::new(&FrameConfig {
            enabled: true,
            continuation_pattern: Some(r"^\s+".to_string()),
            max_lines: 2,
        })
        .unwrap();
        assert!(assembler.push(line("a", "header", 0)).is_none());
        let flushed = assembler.push(line("a", "  cont", 0)).unwrap();
        assert_eq!(flushed.message_str().as_ref(), "header\n  cont");
    }

    #[test]
    fn flush_all_drains_pending_records_at_shutdown() {
        let mut assembler = FrameAssembler::new(&FrameConfig {
            enabled: true,
            continuation_pattern: Some(r"^\s+".to_string()),
            max_lines: 500,
        })
        .unwrap();
        assert!(assembler.push(line("a", "header", 0)).is_none());
        assert_eq!(assembler.flush_all().len(), 1);
    }
}
