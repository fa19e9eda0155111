//! Redact stage: pattern-based replacements applied to the record message
//! (`spec.md` §4.5), e.g. masking credit-card numbers or bearer tokens
//! before a record ever reaches a sink.

use regex::Regex;
use streamship_common::record::Record;
use streamship_config::RedactionRule;

pub struct CompiledRedaction {
    pattern: Regex,
    replacement: String,
}

impl CompiledRedaction {
    pub fn compile(rule: &RedactionRule) -> anyhow::Result<Self> {
        Ok(Self {
            pattern: Regex::new(&rule.pattern)?,
            replacement: rule.replacement.clone(),
        })
    }
}

pub fn apply(record: Record, redactions: &[CompiledRedaction]) -> Record {
    if redactions.is_empty() {
        return record;
    }
    let mut message = record.message_str().into_owned();
    for redaction in redactions {
        if redaction.pattern.is_match(&message) {
            message = redaction.pattern.replace_all(&message, redaction.replacement.as_str()).into_owned();
        }
    }
    Record::new(
        record.timestamp,
        message.into_bytes(),
        record.source_type,
        record.source_id,
        record.labels,
    )
    .with_fields(record.fields)
}
