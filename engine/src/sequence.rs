//! Sequence formatting rules (invoice numbers and the like).
//!
//! Counter storage lives with the caller; this module decides which fields
//! need a value, what the next counter is, and how it is rendered.

use crate::{record::Record, BranchId, ModuleId, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn default_delimiter() -> String {
    "-".to_string()
}

fn default_pad_char() -> char {
    '0'
}

/// How one sequenced field is rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRule {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// Joins prefix, number and suffix; an empty string concatenates them
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default, alias = "pad")]
    pub padding: usize,
    #[serde(default = "default_pad_char", alias = "padWith")]
    pub pad_char: char,
    /// First value handed out
    #[serde(default)]
    pub start: Option<u64>,
    /// Field that also receives the raw counter
    #[serde(default)]
    pub counter_field: Option<String>,
}

impl Default for SequenceRule {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            suffix: String::new(),
            delimiter: default_delimiter(),
            padding: 0,
            pad_char: default_pad_char(),
            start: None,
            counter_field: None,
        }
    }
}

impl SequenceRule {
    /// Render `value` with this rule.
    pub fn format(&self, value: u64) -> String {
        let digits = value.to_string();
        let fill = self.padding.saturating_sub(digits.len());
        let padded: String = std::iter::repeat(self.pad_char)
            .take(fill)
            .chain(digits.chars())
            .collect();

        [self.prefix.as_str(), padded.as_str(), self.suffix.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }

    /// Counter following `last`, never below `start`.
    pub fn next_value(&self, last: Option<u64>) -> u64 {
        let base = self.start.unwrap_or(1);
        match last {
            Some(last) if last + 1 >= base => last + 1,
            _ => base,
        }
    }
}

/// Rules for one table: field name to rule.
pub type TableRules = BTreeMap<String, SequenceRule>;
type ModuleRules = BTreeMap<TableName, TableRules>;

/// Sequence rules with per-branch overrides of module defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceRules {
    pub defaults: BTreeMap<ModuleId, ModuleRules>,
    pub branches: BTreeMap<BranchId, BTreeMap<ModuleId, ModuleRules>>,
}

impl SequenceRules {
    /// Rules for a table; a branch override replaces the module default
    /// for that table entirely.
    pub fn for_table(&self, branch: &str, module: &str, table: &str) -> Option<&TableRules> {
        self.branches
            .get(branch)
            .and_then(|modules| modules.get(module))
            .and_then(|tables| tables.get(table))
            .or_else(|| {
                self.defaults
                    .get(module)
                    .and_then(|tables| tables.get(table))
            })
    }

    pub fn with_default(mut self, module: &str, table: &str, field: &str, rule: SequenceRule) -> Self {
        self.defaults
            .entry(module.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .insert(field.to_string(), rule);
        self
    }
}

/// Counter key for a sequenced field.
pub fn sequence_key(module: &str, table: &str, field: &str) -> String {
    format!("{module}:{table}:{field}")
}

/// Fields of `record` with a rule and no value yet.
pub fn pending_fields<'a>(rules: &'a TableRules, record: &Record) -> Vec<(&'a str, &'a SequenceRule)> {
    rules
        .iter()
        .filter(|(field, _)| match record.get(field.as_str()) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .map(|(field, rule)| (field.as_str(), rule))
        .collect()
}

/// Write an allocated counter into `record`.
pub fn apply_allocation(record: &mut Record, field: &str, rule: &SequenceRule, value: u64) {
    record.insert(field.to_string(), Value::String(rule.format(value)));
    if let Some(counter_field) = &rule.counter_field {
        if !record.contains_key(counter_field) {
            record.insert(counter_field.clone(), Value::from(value));
        }
    }
}
