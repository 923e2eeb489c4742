//! Schema definition, key resolution and value coercion.
//!
//! A schema declares the tables of every module, which fields form each
//! table's primary key, and which tables are versioned. The store consults it
//! on every write.

use crate::{
    clock::parse_timestamp,
    error::Result,
    record::{key_part, Record, ResolvedKey, KEY_SEPARATOR},
    Error, ModuleId, SchemaVersion, TableName, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    #[serde(rename = "type", alias = "fieldType")]
    pub field_type: FieldType,
    /// Part of the table's primary key
    #[serde(default)]
    pub primary_key: bool,
    /// Must be present on insert
    #[serde(default)]
    pub required: bool,
    /// Referenced table, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<TableName>,
    /// Value used on insert when the field is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldDef {
    fn base(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            primary_key: false,
            required: false,
            references: None,
            default: None,
        }
    }

    /// Create a primary-key field. Primary-key fields are always required.
    pub fn primary(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            primary_key: true,
            required: true,
            ..Self::base(name, field_type)
        }
    }

    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: true,
            ..Self::base(name, field_type)
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::base(name, field_type)
    }

    /// Mark the field as referencing another table.
    pub fn references(mut self, table: impl Into<TableName>) -> Self {
        self.references = Some(table.into());
        self
    }

    /// Set a default value applied on insert.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Coerce a value to this field's type.
    ///
    /// Numeric strings become numbers, `"true"`/`"false"` and 0/1 become
    /// booleans. Null passes through untouched.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let coerced = match self.field_type {
            FieldType::Json => Some(value.clone()),
            FieldType::String => match value {
                Value::String(_) => Some(value.clone()),
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            FieldType::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
                Value::Number(n) => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::from(f as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                _ => None,
            },
            FieldType::Float => match value {
                Value::Number(_) => Some(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number),
                _ => None,
            },
            FieldType::Bool => match value {
                Value::Bool(_) => Some(value.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Some(Value::Bool(false)),
                    Some(1) => Some(Value::Bool(true)),
                    _ => None,
                },
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Some(Value::Bool(true)),
                    "false" | "0" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            FieldType::Timestamp => match value {
                Value::Number(n) if n.is_u64() || n.is_i64() => Some(value.clone()),
                Value::String(_) if parse_timestamp(value).is_some() => Some(value.clone()),
                _ => None,
            },
        };

        coerced.ok_or_else(|| Error::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type.to_string(),
            got: json_type_name(value).to_string(),
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Values the store fills in on insert.
#[derive(Debug, Clone, Copy)]
pub struct InsertContext<'a> {
    pub branch_id: &'a str,
    pub now: Timestamp,
}

/// Schema for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Table name
    pub name: TableName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Records carry an optimistic-concurrency `version`
    #[serde(default)]
    pub versioned: bool,
}

impl TableSchema {
    /// Create a new table schema.
    pub fn new(name: impl Into<TableName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            versioned: false,
        }
    }

    /// Builder-style method to mark the table as versioned.
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    /// Look up a field definition.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether the table declares a field.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Whether any field is explicitly marked as primary key.
    pub fn declares_primary_key(&self) -> bool {
        self.fields.iter().any(|f| f.primary_key)
    }

    /// Primary-key field names, falling back to `id`.
    pub fn primary_key_fields(&self) -> Vec<&str> {
        let declared: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name.as_str())
            .collect();
        if declared.is_empty() {
            vec!["id"]
        } else {
            declared
        }
    }

    /// The key field an insert may fill with a generated id: the table's
    /// only primary-key field, when it holds strings.
    pub fn generated_key_field(&self) -> Option<&str> {
        let fields = self.primary_key_fields();
        match fields.as_slice() {
            [field] => match self.field(field) {
                Some(def) if def.field_type != FieldType::String => None,
                _ => Some(*field),
            },
            _ => None,
        }
    }

    /// Resolve the record's primary key. Returns `None` when any key part is
    /// missing or empty.
    pub fn resolve_key(&self, record: &Record) -> Option<ResolvedKey> {
        let fields = self.primary_key_fields();
        let mut parts = BTreeMap::new();
        let mut joined = Vec::with_capacity(fields.len());
        for field in fields {
            let part = record.get(field).and_then(key_part)?;
            joined.push(part.clone());
            parts.insert(field.to_string(), part);
        }
        Some(ResolvedKey {
            key: joined.join(KEY_SEPARATOR),
            parts,
        })
    }

    /// Like [`resolve_key`](Self::resolve_key) but fails with
    /// [`Error::MissingPrimaryKey`].
    pub fn require_key(&self, record: &Record) -> Result<ResolvedKey> {
        self.resolve_key(record)
            .ok_or_else(|| Error::MissingPrimaryKey {
                table: self.name.clone(),
                fields: self.primary_key_fields().join(","),
            })
    }

    /// Build a new record from client input: coerce declared fields, apply
    /// defaults, fill timestamps and branch, and check required fields.
    /// Undeclared fields pass through unchanged.
    pub fn create_record(&self, input: &Record, ctx: InsertContext<'_>) -> Result<Record> {
        let mut record = input.clone();
        for field in &self.fields {
            let current = record.get(&field.name).filter(|v| !v.is_null()).cloned();
            let value = match current {
                Some(value) => field.coerce(&value)?,
                None => match &field.default {
                    Some(default) => default.clone(),
                    None if field.field_type == FieldType::Timestamp
                        && matches!(field.name.as_str(), "createdAt" | "updatedAt") =>
                    {
                        Value::from(ctx.now)
                    }
                    None if field.name == "branchId" => Value::String(ctx.branch_id.to_string()),
                    None if field.required => {
                        return Err(Error::MissingRequiredField(field.name.clone()))
                    }
                    None => continue,
                },
            };
            record.insert(field.name.clone(), value);
        }
        Ok(record)
    }
}

/// Tables belonging to a module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDefinition {
    /// Declared table names, in presentation order
    pub tables: Vec<TableName>,
}

impl ModuleDefinition {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TableName>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }
}

/// Schema for every module served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Table schemas by name
    pub tables: HashMap<TableName, TableSchema>,
    /// Module definitions by id
    #[serde(default)]
    pub modules: HashMap<ModuleId, ModuleDefinition>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            tables: HashMap::new(),
            modules: HashMap::new(),
        }
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    /// Builder-style method to add a module.
    pub fn with_module(mut self, id: impl Into<ModuleId>, module: ModuleDefinition) -> Self {
        self.modules.insert(id.into(), module);
        self
    }

    /// Get a table schema by name.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Get a module definition by id.
    pub fn module(&self, id: &str) -> Option<&ModuleDefinition> {
        self.modules.get(id)
    }

    /// Check internal consistency: every module table has a schema, and
    /// every persisted table declares an explicit primary key.
    pub fn validate(&self, persisted: &[TableName]) -> Result<()> {
        for (module_id, module) in &self.modules {
            for table in &module.tables {
                if !self.tables.contains_key(table) {
                    return Err(Error::TableNotRegistered {
                        table: table.clone(),
                        module: module_id.clone(),
                    });
                }
            }
        }
        for table in persisted {
            if let Some(schema) = self.tables.get(table) {
                if !schema.declares_primary_key() {
                    return Err(Error::MissingPrimaryKey {
                        table: table.clone(),
                        fields: String::new(),
                    });
                }
            }
        }
        Ok(())
    }
}
