//! Parse stage: an ordered list of parsers applied to the raw message.
//! The first parser to successfully extract structured fields wins; if
//! every parser fails, the record passes through unchanged except for a
//! `parse_error=true` field — errors never abort the pipeline (`spec.md`
//! §4.5).

use regex::Regex;
use streamship_common::{
    metrics::metrics,
    record::{
        FieldValue,
        Record,
    },
};
use streamship_config::ParserConfig;

pub enum CompiledParser {
    Regex(Regex),
    KeyValue { pair_separator: String, kv_separator: String },
    Json,
}

impl CompiledParser {
    pub fn compile(config: &ParserConfig) -> anyhow::Result<Self> {
        Ok(match config {
            ParserConfig::Regex { pattern } => CompiledParser::Regex(Regex::new(pattern)?),
            ParserConfig::KeyValue { pair_separator, kv_separator } => CompiledParser::KeyValue {
                pair_separator: pair_separator.clone(),
                kv_separator: kv_separator.clone(),
            },
            ParserConfig::Json => CompiledParser::Json,
        })
    }

    fn try_extract(&self, message: &str) -> Option<Vec<(String, FieldValue)>> {
        match self {
            CompiledParser::Regex(re) => {
                let captures = re.captures(message)?;
                let mut fields = Vec::new();
                for name in re.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        fields.push((name.to_string(), FieldValue::Str(m.as_str().to_string())));
                    }
                }
                if fields.is_empty() {
                    None
                } else {
                    Some(fields)
                }
            },
            CompiledParser::KeyValue { pair_separator, kv_separator } => {
                let mut fields = Vec::new();
                for pair in message.split(pair_separator.as_str()) {
                    let pair = pair.trim();
                    if pair.is_empty() {
                        continue;
                    }
                    let (k, v) = pair.split_once(kv_separator.as_str())?;
                    fields.push((k.trim().to_string(), FieldValue::Str(v.trim().to_string())));
                }
                if fields.is_empty() {
                    None
                } else {
                    Some(fields)
                }
            },
            CompiledParser::Json => {
                let value: serde_json::Value = serde_json::from_str(message).ok()?;
                let object = value.as_object()?;
                Some(object.iter().map(|(k, v)| (k.clone(), json_field_value(v))).collect())
            },
        }
    }
}

fn json_field_value(value: &serde_json::Value) -> FieldValue {
    match value {
        serde_json::Value::String(s) => FieldValue::Str(s.clone()),
        serde_json::Value::Bool(b) => FieldValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                FieldValue::Int(i)
            } else {
                FieldValue::Float(n.as_f64().unwrap_or(0.0))
            }
        },
        other => FieldValue::Str(other.to_string()),
    }
}

/// Applies `parsers` in order; the first one to produce fields wins. On
/// total failure, tags the record `parse_error=true` and bumps the counter,
/// but always returns a record — parse errors are never fatal.
pub fn apply(record: Record, parsers: &[CompiledParser]) -> Record {
    let message = record.message_str().into_owned();
    for parser in parsers {
        if let Some(extracted) = parser.try_extract(&message) {
            let fields = record.fields.with_extra(extracted);
            return record.with_fields(fields);
        }
    }
    if parsers.is_empty() {
        return record;
    }
    metrics().parse_errors_total.inc();
    let fields = record
        .fields
        .with_extra([("parse_error".to_string(), FieldValue::Bool(true))]);
    record.with_fields(fields)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use streamship_common::record::{
        Labels,
        SourceType,
    };

    use super::*;

    fn record(message: &str) -> Record {
        Record::new(
            Duration::from_secs(0),
            message.as_bytes().to_vec(),
            SourceType::File,
            Arc::<str>::from("file:a"),
            Labels::new(),
        )
    }

    #[test]
    fn regex_parser_extracts_named_groups() {
        let parser = CompiledParser::compile(&ParserConfig::Regex {
            pattern: r"^(?P<level>\w+): (?P<msg>.*)$".to_string(),
        })
        .unwrap();
        let parsed = apply(record("ERROR: disk full"), &[parser]);
        assert_eq!(parsed.fields.get("level"), Some(&FieldValue::Str("ERROR".to_string())));
        assert_eq!(parsed.fields.get("msg"), Some(&FieldValue::Str("disk full".to_string())));
    }

    #[test]
    fn key_value_parser_splits_pairs() {
        let parser = CompiledParser::compile(&ParserConfig::KeyValue {
            pair_separator: " ".to_string(),
            kv_separator: "=".to_string(),
        })
        .unwrap();
        let parsed = apply(record("level=info code=200"), &[parser]);
        assert_eq!(parsed.fields.get("level"), Some(&FieldValue::Str("info".to_string())));
        assert_eq!(parsed.fields.get("code"), Some(&FieldValue::Str("200".to_string())));
    }

    #[test]
    fn json_parser_extracts_typed_fields() {
        let parser = CompiledParser::compile(&ParserConfig::Json).unwrap();
        let parsed = apply(record(r#"{"level":"info","retries":3}"#), &[parser]);
        assert_eq!(parsed.fields.get("level"), Some(&FieldValue::Str("info".to_string())));
        assert_eq!(parsed.fields.get("retries"), Some(&FieldValue::Int(3)));
    }

    #[test]
    fn failed_parse_is_tagged_not_dropped() {
        let parser = CompiledParser::compile(&ParserConfig::Json).unwrap();
        let parsed = apply(record("not json at all"), &[parser]);
        assert_eq!(parsed.fields.get("parse_error"), Some(&FieldValue::Bool(true)));
        assert_eq!(parsed.message_str().as_ref(), "not json at all");
    }
}
