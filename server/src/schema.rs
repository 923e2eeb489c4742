//! Built-in POS schema and sequence rules, or the ones loaded from disk.

use std::collections::BTreeMap;
use std::path::Path;

use pos_sync_engine::{
    FieldDef, FieldType, ModuleDefinition, Schema, SequenceRule, SequenceRules, TableRows,
    TableSchema,
};
use serde::de::DeserializeOwned;

use crate::config::{Config, ConfigError};

/// Module served when a topic or request names none.
pub const POS_MODULE: &str = "pos";

/// Tables a purge clears when the request lists none.
pub const TRANSACTION_TABLES: [&str; 8] = [
    "order_header",
    "order_line",
    "order_payment",
    "pos_shift",
    "job_order_header",
    "job_order_detail",
    "job_order_detail_modifier",
    "job_order_status_history",
];

const TABLE_ALIASES: [(&str, &str); 22] = [
    ("orders", "order_header"),
    ("order", "order_header"),
    ("order_headers", "order_header"),
    ("orderheader", "order_header"),
    ("order_lines", "order_line"),
    ("orders_lines", "order_line"),
    ("orderline", "order_line"),
    ("orderlines", "order_line"),
    ("line_items", "order_line"),
    ("payments", "order_payment"),
    ("payment", "order_payment"),
    ("order_payments", "order_payment"),
    ("pos_payments", "order_payment"),
    ("pos_payment", "order_payment"),
    ("pos_shifts", "pos_shift"),
    ("shifts", "pos_shift"),
    ("shift", "pos_shift"),
    ("job_orders", "job_order_header"),
    ("job_order", "job_order_header"),
    ("job_order_headers", "job_order_header"),
    ("job_order_details", "job_order_detail"),
    ("job_order_modifiers", "job_order_detail_modifier"),
];

/// Canonical table name for a client-supplied table identifier.
///
/// Identifiers are lowercased and runs of other characters collapse to `_`
/// before alias lookup, so `Order-Lines` resolves to `order_line`.
pub fn resolve_table_alias(input: &str) -> Option<String> {
    let mut normalized = String::with_capacity(input.len());
    for c in input.trim().chars() {
        if c.is_ascii_alphanumeric() {
            normalized.push(c.to_ascii_lowercase());
        } else if !normalized.ends_with('_') {
            normalized.push('_');
        }
    }
    let normalized = normalized.trim_matches('_');
    if normalized.is_empty() {
        return None;
    }
    let canonical = TABLE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map_or(normalized, |(_, target)| *target);
    Some(canonical.to_string())
}

fn stamps() -> [FieldDef; 3] {
    [
        FieldDef::optional("branchId", FieldType::String),
        FieldDef::optional("createdAt", FieldType::Timestamp),
        FieldDef::optional("updatedAt", FieldType::Timestamp),
    ]
}

fn table(name: &str, fields: Vec<FieldDef>) -> TableSchema {
    let mut fields = fields;
    fields.extend(stamps());
    TableSchema::new(name, fields)
}

/// The POS module as served out of the box.
pub fn default_schema() -> Schema {
    let mut schema = Schema::new(1);
    schema
        .add_table(
            table(
                "order_header",
                vec![
                    FieldDef::primary("id", FieldType::String),
                    FieldDef::optional("invoiceNo", FieldType::String),
                    FieldDef::optional("invoiceSeq", FieldType::Int),
                    FieldDef::optional("shiftId", FieldType::String).references("pos_shift"),
                    FieldDef::optional("status", FieldType::String)
                        .with_default(serde_json::json!("open")),
                    FieldDef::optional("paymentState", FieldType::String),
                    FieldDef::optional("orderType", FieldType::String),
                    FieldDef::optional("total", FieldType::Float),
                    FieldDef::optional("metadata", FieldType::Json),
                ],
            )
            .versioned(),
        )
        .add_table(
            table(
                "order_line",
                vec![
                    FieldDef::primary("id", FieldType::String),
                    FieldDef::required("orderId", FieldType::String).references("order_header"),
                    FieldDef::optional("itemId", FieldType::String),
                    FieldDef::optional("qty", FieldType::Float),
                    FieldDef::optional("price", FieldType::Float),
                    FieldDef::optional("status", FieldType::String),
                    FieldDef::optional("notes", FieldType::Json),
                ],
            )
            .versioned(),
        )
        .add_table(table(
            "order_payment",
            vec![
                FieldDef::primary("id", FieldType::String),
                FieldDef::required("orderId", FieldType::String).references("order_header"),
                FieldDef::optional("method", FieldType::String),
                FieldDef::optional("amount", FieldType::Float),
                FieldDef::optional("paymentState", FieldType::String),
            ],
        ))
        .add_table(table(
            "pos_shift",
            vec![
                FieldDef::primary("id", FieldType::String),
                FieldDef::optional("posId", FieldType::String),
                FieldDef::optional("cashierId", FieldType::String),
                FieldDef::optional("openedAt", FieldType::Timestamp),
                FieldDef::optional("closedAt", FieldType::Timestamp),
                FieldDef::optional("isClosed", FieldType::Bool).with_default(false.into()),
                FieldDef::optional("totals", FieldType::Json),
            ],
        ))
        .add_table(table(
            "job_order_header",
            vec![
                FieldDef::primary("id", FieldType::String),
                FieldDef::optional("orderId", FieldType::String).references("order_header"),
                FieldDef::optional("kitchenSectionId", FieldType::String),
                FieldDef::optional("status", FieldType::String),
                FieldDef::optional("progress", FieldType::Float),
            ],
        ))
        .add_table(table(
            "job_order_detail",
            vec![
                FieldDef::primary("id", FieldType::String),
                FieldDef::optional("jobOrderId", FieldType::String).references("job_order_header"),
                FieldDef::optional("itemId", FieldType::String),
                FieldDef::optional("quantity", FieldType::Float),
                FieldDef::optional("status", FieldType::String),
            ],
        ))
        .add_table(table(
            "job_order_detail_modifier",
            vec![
                FieldDef::primary("id", FieldType::String),
                FieldDef::optional("detailId", FieldType::String).references("job_order_detail"),
                FieldDef::optional("modifierId", FieldType::String),
                FieldDef::optional("priceChange", FieldType::Float),
            ],
        ))
        .add_table(table(
            "job_order_status_history",
            vec![
                FieldDef::primary("id", FieldType::String),
                FieldDef::optional("jobOrderId", FieldType::String).references("job_order_header"),
                FieldDef::optional("status", FieldType::String),
                FieldDef::optional("actorId", FieldType::String),
            ],
        ))
        .add_table(TableSchema::new(
            "settings",
            vec![
                FieldDef::primary("key", FieldType::String),
                FieldDef::optional("value", FieldType::Json),
                FieldDef::optional("updatedAt", FieldType::Timestamp),
            ],
        ));

    let mut tables: Vec<&str> = TRANSACTION_TABLES.to_vec();
    tables.push("settings");
    schema.with_module(POS_MODULE, ModuleDefinition::new(tables))
}

/// Invoice numbers `INV-000001`, `INV-000002`, ... on order headers.
pub fn default_sequence_rules() -> SequenceRules {
    let invoice = SequenceRule {
        prefix: "INV".to_string(),
        padding: 6,
        counter_field: Some("invoiceSeq".to_string()),
        ..SequenceRule::default()
    };
    SequenceRules::default().with_default(POS_MODULE, "order_header", "invoiceNo", invoice)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Schema from `SCHEMA_PATH`, or the built-in one.
pub fn load_schema(config: &Config) -> Result<Schema, ConfigError> {
    match &config.schema_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading schema");
            read_json(path)
        }
        None => Ok(default_schema()),
    }
}

/// Sequence rules from `SEQUENCE_RULES_PATH`, or the built-in ones.
pub fn load_sequence_rules(config: &Config) -> Result<SequenceRules, ConfigError> {
    match &config.sequence_rules_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading sequence rules");
            read_json(path)
        }
        None => Ok(default_sequence_rules()),
    }
}

/// Per-module seed rows from `SEED_PATH`, empty when unset.
pub fn load_seeds(config: &Config) -> Result<BTreeMap<String, TableRows>, ConfigError> {
    match &config.seed_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading module seeds");
            read_json(path)
        }
        None => Ok(BTreeMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_is_consistent() {
        let schema = default_schema();
        let persisted: Vec<String> = Config::default().persisted_tables;
        schema.validate(&persisted).unwrap();

        let pos = schema.module(POS_MODULE).unwrap();
        assert_eq!(pos.tables.len(), TRANSACTION_TABLES.len() + 1);
        assert!(schema.table("order_header").unwrap().versioned);
        assert!(schema.table("order_line").unwrap().versioned);
        assert!(!schema.table("order_payment").unwrap().versioned);
    }

    #[test]
    fn aliases_resolve_to_canonical_tables() {
        assert_eq!(resolve_table_alias("orders").as_deref(), Some("order_header"));
        assert_eq!(resolve_table_alias(" Order-Lines ").as_deref(), Some("order_line"));
        assert_eq!(resolve_table_alias("POS_PAYMENTS").as_deref(), Some("order_payment"));
        assert_eq!(resolve_table_alias("pos_shift").as_deref(), Some("pos_shift"));
        assert_eq!(resolve_table_alias("custom_table").as_deref(), Some("custom_table"));
        assert_eq!(resolve_table_alias(" -- "), None);
    }

    #[test]
    fn invoice_rule_formats() {
        let rules = default_sequence_rules();
        let table = rules.for_table("b1", POS_MODULE, "order_header").unwrap();
        assert_eq!(table["invoiceNo"].format(42), "INV-000042");
    }

    #[test]
    fn loaders_report_bad_files() {
        let config = Config {
            schema_path: Some("/nonexistent/schema.json".into()),
            ..Config::default()
        };
        assert!(matches!(load_schema(&config), Err(ConfigError::Io { .. })));
        assert!(load_sequence_rules(&config).is_ok());
        assert!(load_seeds(&config).unwrap().is_empty());

        let config = Config {
            seed_path: Some("/nonexistent/seed.json".into()),
            ..Config::default()
        };
        assert!(matches!(load_seeds(&config), Err(ConfigError::Io { .. })));
    }
}
