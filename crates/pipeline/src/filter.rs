//! Filter stage: drop or keep records by label/field predicates (`spec.md`
//! §4.5). Rules are evaluated in order; the first rule whose predicate
//! matches decides the record's fate. A record matching no rule is kept.

use regex::Regex;
use streamship_common::record::Record;
use streamship_config::{
    FilterAction,
    FilterOp,
    FilterRule,
};

pub struct CompiledFilterRule {
    field: String,
    op: FilterOp,
    value: String,
    matches_regex: Option<Regex>,
    action: FilterAction,
}

impl CompiledFilterRule {
    pub fn compile(rule: &FilterRule) -> anyhow::Result<Self> {
        let matches_regex = match rule.op {
            FilterOp::Matches => Some(Regex::new(&rule.value)?),
            _ => None,
        };
        Ok(Self {
            field: rule.field.clone(),
            op: rule.op,
            value: rule.value.clone(),
            matches_regex,
            action: rule.action,
        })
    }

    fn predicate_matches(&self, record: &Record) -> bool {
        let Some(actual) = field_value(record, &self.field) else {
            return matches!(self.op, FilterOp::NotEquals);
        };
        match self.op {
            FilterOp::Equals => actual == self.value,
            FilterOp::NotEquals => actual != self.value,
            FilterOp::Contains => actual.contains(&self.value),
            FilterOp::Matches => self
                .matches_regex
                .as_ref()
                .map(|re| re.is_match(&actual))
                .unwrap_or(false),
        }
    }
}

/// Resolves a filter rule's `field` name against a record: `label.<key>`
/// looks up a label, `message`/`source_id` are well-known built-ins, and
/// anything else looks up a structured field.
fn field_value(record: &Record, field: &str) -> Option<String> {
    if let Some(key) = field.strip_prefix("label.") {
        return record.labels.get(key).map(str::to_string);
    }
    match field {
        "message" => Some(record.message_str().into_owned()),
        "source_id" => Some(record.source_id.to_string()),
        _ => record.fields.get(field).map(|v| v.to_string()),
    }
}

/// Returns `false` if `record` should be dropped.
pub fn keep(record: &Record, rules: &[CompiledFilterRule]) -> bool {
    for rule in rules {
        if rule.predicate_matches(record) {
            return matches!(rule.action, FilterAction::Keep);
        }
    }
    true
}
