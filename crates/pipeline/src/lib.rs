//! Processing Pipeline (C5, `spec.md` §4.5).
//!
//! A compile-once, run-many chain of stages declared by configuration:
//! frame, parse, enrich, filter, dedup, redact. Every stage is a pure
//! function from record to (record | drop); only `frame` is stateful
//! (it buffers partial multi-line records per source) and only `dedup`
//! consults shared state (the cache in `dedup`). Errors from the `parse`
//! stage never abort the pipeline — they annotate the record and keep
//! going, matching the contract every other component in this repo
//! follows (log, count, continue).

mod filter;
mod frame;
mod parse;
mod redact;

use dedup::DedupCache;
pub use filter::CompiledFilterRule;
pub use frame::FrameAssembler;
pub use parse::CompiledParser;
pub use redact::CompiledRedaction;
use streamship_common::{
    metrics::metrics,
    record::Record,
};
use streamship_config::PipelineConfig;
use tokio::sync::{
    mpsc,
    watch,
};

pub struct Pipeline {
    name: String,
    tenant: Option<String>,
    enrich_labels: Vec<(String, String)>,
    frame: FrameAssembler,
    parsers: Vec<CompiledParser>,
    filters: Vec<CompiledFilterRule>,
    redactions: Vec<CompiledRedaction>,
    dedup: DedupCache,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, dedup_config: &streamship_config::DedupConfig) -> anyhow::Result<Self> {
        let parsers = config
            .parsers
            .iter()
            .map(CompiledParser::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let filters = config
            .filters
            .iter()
            .map(CompiledFilterRule::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let redactions = config
            .redactions
            .iter()
            .map(CompiledRedaction::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            tenant: config.tenant.clone(),
            enrich_labels: config.enrich_labels.clone().into_iter().collect(),
            frame: FrameAssembler::new(&config.frame)?,
            parsers,
            filters,
            redactions,
            dedup: DedupCache::new(dedup_config),
        })
    }

    fn enrich(&self, record: Record) -> Record {
        let mut extra = vec![
            ("pipeline".to_string(), self.name.clone()),
            ("host".to_string(), streamship_common::hostname().to_string()),
        ];
        if let Some(tenant) = &self.tenant {
            extra.push(("tenant".to_string(), tenant.clone()));
        }
        extra.extend(self.enrich_labels.iter().cloned());
        let labels = record.labels.with_extra(extra);
        Record {
            labels,
            ..record
        }
    }

    /// Runs every stage but `frame` over one already-assembled record.
    /// Returns `None` if the record was dropped by `filter` or `dedup`.
    fn process_assembled(&self, record: Record) -> Option<Record> {
        let record = parse::apply(record, &self.parsers);
        let record = self.enrich(record);

        if !filter::keep(&record, &self.filters) {
            metrics().records_dropped_total.with_label_values(&["filtered"]).inc();
            return None;
        }

        if self.dedup.check_and_insert(&record) {
            metrics().records_dropped_total.with_label_values(&["duplicate"]).inc();
            return None;
        }

        Some(redact::apply(record, &self.redactions))
    }

    /// Feeds one raw record through `frame`, then (once a logical record is
    /// complete) through the rest of the pipeline. Returns `None` both when
    /// `frame` is still buffering and when a later stage drops the record.
    fn process(&mut self, record: Record) -> Option<Record> {
        let assembled = self.frame.push(record)?;
        self.process_assembled(assembled)
    }

    /// Drives `input` to completion, emitting processed records on `output`
    /// until `shutdown` fires, at which point any still-buffered multi-line
    /// records are flushed rather than discarded.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Record>,
        output: mpsc::Sender<Record>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                record = input.recv() => {
                    match record {
                        Some(record) => {
                            if let Some(processed) = self.process(record) {
                                if output.send(processed).await.is_err() {
                                    return;
                                }
                            }
                        },
                        None => break,
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        for record in self.frame.flush_all() {
            if let Some(processed) = self.process_assembled(record) {
                let _ = output.send(processed).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use streamship_common::record::{
        FieldValue,
        Labels,
        SourceType,
    };
    use streamship_config::{
        DedupConfig,
        FilterAction,
        FilterOp,
        FilterRule,
        FrameConfig,
        ParserConfig,
        PipelineConfig,
    };

    use super::*;

    fn line(message: &str) -> Record {
        Record::new(
            Duration::from_secs(0),
            message.as_bytes().to_vec(),
            SourceType::File,
            Arc::<str>::from("file:a"),
            Labels::new(),
        )
    }

    fn pipeline(config: PipelineConfig) -> Pipeline {
        Pipeline::new(&config, &DedupConfig { enabled: false, ..DedupConfig::default() }).unwrap()
    }

    #[test]
    fn enrich_injects_pipeline_and_tenant_labels() {
        let mut config = PipelineConfig::default();
        config.name = "ingest".to_string();
        config.tenant = Some("acme".to_string());
        let mut p = pipeline(config);

        let processed = p.process(line("hello")).unwrap();
        assert_eq!(processed.labels.get("pipeline"), Some("ingest"));
        assert_eq!(processed.labels.get("tenant"), Some("acme"));
    }

    #[test]
    fn parse_failure_does_not_drop_the_record() {
        let mut config = PipelineConfig::default();
        config.parsers = vec![ParserConfig::Json];
        let mut p = pipeline(config);

        let processed = p.process(line("not json")).unwrap();
        assert_eq!(processed.fields.get("parse_error"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn filter_drops_matching_records() {
        let mut config = PipelineConfig::default();
        config.filters = vec![FilterRule {
            field: "message".to_string(),
            op: FilterOp::Contains,
            value: "noisy".to_string(),
            action: FilterAction::Drop,
        }];
        let mut p = pipeline(config);

        assert!(p.process(line("a noisy heartbeat")).is_none());
        assert!(p.process(line("an important error")).is_some());
    }

    #[test]
    fn duplicate_records_within_ttl_are_dropped() {
        let config = PipelineConfig::default();
        let mut p = Pipeline::new(
            &config,
            &DedupConfig {
                enabled: true,
                capacity: 100,
                ttl: Duration::from_secs(60),
            },
        )
        .unwrap();

        assert!(p.process(line("repeat me")).is_some());
        assert!(p.process(line("repeat me")).is_none());
    }

    #[test]
    fn framing_buffers_until_a_boundary_is_reached() {
        let mut config = PipelineConfig::default();
        config.frame = FrameConfig {
            enabled: true,
            continuation_pattern: Some(r"^\s+".to_string()),
            max_lines: 500,
        };
        let mut p = pipeline(config);

        assert!(p.process(line("Exception: boom")).is_none());
        let flushed = p.process(line("    at a.rs:1")).is_none();
        assert!(flushed);
        let completed = p.process(line("next")).unwrap();
        assert_eq!(completed.message_str().as_ref(), "Exception: boom\n    at a.rs:1");
    }
}
