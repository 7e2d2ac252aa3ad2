// Entry Payloads
//
// What a log entry carries besides its state transition: a table
// definition, a schema delta, a pointer to written data, or nothing.

use serde::{Deserialize, Serialize};

/// Deployment environment a table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        f.write_str(name)
    }
}

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float32,
    Float64,
    Date,
    Timestamp,
    String,
    Binary,
}

impl DataType {
    /// Whether every value of `self` is representable as `to` without loss.
    pub fn widens_to(self, to: DataType) -> bool {
        use DataType::*;

        self == to
            || matches!(
                (self, to),
                (Int32, Int64) | (Int32, Float64) | (Float32, Float64) | (Date, Timestamp)
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered set of columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("column `{0}` does not exist")]
    UnknownColumn(String),

    #[error("column `{0}` already exists")]
    DuplicateColumn(String),

    #[error("schema delta contains no changes")]
    EmptyDelta,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn column_mut(&mut self, name: &str) -> Result<&mut Column, SchemaError> {
        self.columns
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| SchemaError::UnknownColumn(name.to_string()))
    }

    /// Apply a delta, producing the resulting schema.
    ///
    /// Changes apply in order, so a later change may refer to a column
    /// added or renamed by an earlier one.
    pub fn apply(&self, delta: &SchemaDelta) -> Result<Schema, SchemaError> {
        if delta.changes.is_empty() {
            return Err(SchemaError::EmptyDelta);
        }

        delta
            .changes
            .iter()
            .try_fold(self.clone(), |schema, change| schema.apply_change(change))
    }

    /// Apply a single change, producing the resulting schema.
    pub fn apply_change(mut self, change: &SchemaChange) -> Result<Schema, SchemaError> {
        match change {
            SchemaChange::AddColumn { column } => {
                if self.column(&column.name).is_some() {
                    return Err(SchemaError::DuplicateColumn(column.name.clone()));
                }
                self.columns.push(column.clone());
            }
            SchemaChange::DropColumn { name } => {
                let before = self.columns.len();
                self.columns.retain(|c| &c.name != name);
                if self.columns.len() == before {
                    return Err(SchemaError::UnknownColumn(name.clone()));
                }
            }
            SchemaChange::RenameColumn { from, to } => {
                if self.column(to).is_some() {
                    return Err(SchemaError::DuplicateColumn(to.clone()));
                }
                self.column_mut(from)?.name = to.clone();
            }
            SchemaChange::AlterType { name, data_type } => {
                self.column_mut(name)?.data_type = *data_type;
            }
            SchemaChange::SetNullability { name, nullable } => {
                self.column_mut(name)?.nullable = *nullable;
            }
        }

        Ok(self)
    }
}

/// A single structural change to a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    AddColumn { column: Column },
    DropColumn { name: String },
    RenameColumn { from: String, to: String },
    AlterType { name: String, data_type: DataType },
    SetNullability { name: String, nullable: bool },
}

impl SchemaChange {
    /// Whether applying this change to `schema` can invalidate existing
    /// data or break existing readers.
    ///
    /// Drops, lossy type changes and tightening a column to required are
    /// destructive. Changes against unknown columns are not classified here.
    pub fn is_destructive(&self, schema: &Schema) -> bool {
        match self {
            SchemaChange::AddColumn { .. } | SchemaChange::RenameColumn { .. } => false,
            SchemaChange::DropColumn { .. } => true,
            SchemaChange::AlterType { name, data_type } => schema
                .column(name)
                .is_some_and(|c| !c.data_type.widens_to(*data_type)),
            SchemaChange::SetNullability { name, nullable } => {
                !nullable && schema.column(name).is_some_and(|c| c.nullable)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaChange::AddColumn { column } => format!("add column `{}`", column.name),
            SchemaChange::DropColumn { name } => format!("drop column `{name}`"),
            SchemaChange::RenameColumn { from, to } => format!("rename column `{from}` to `{to}`"),
            SchemaChange::AlterType { name, data_type } => {
                format!("change type of column `{name}` to {data_type:?}")
            }
            SchemaChange::SetNullability { name, nullable: true } => {
                format!("make column `{name}` nullable")
            }
            SchemaChange::SetNullability { name, nullable: false } => {
                format!("make column `{name}` required")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDelta {
    pub changes: Vec<SchemaChange>,
}

impl SchemaDelta {
    pub fn new(changes: Vec<SchemaChange>) -> Self {
        Self { changes }
    }

    /// First change that is destructive, if any.
    ///
    /// Each change is classified against `schema` as left by the changes
    /// before it, so a rename cannot hide a later change to the column.
    pub fn first_destructive(&self, schema: &Schema) -> Option<&SchemaChange> {
        let mut running = schema.clone();
        for change in &self.changes {
            if change.is_destructive(&running) {
                return Some(change);
            }
            running = running.apply_change(change).ok()?;
        }
        None
    }
}

/// How written data relates to the existing table contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Append,
    Overwrite,
    FullRewrite,
}

/// Pointer to data files written by an engine. The core never reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPointer {
    pub location: String,
    pub operation: WriteOperation,
}

/// Mutation-specific content of a log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Initial definition, carried by `create_table`.
    TableDefinition {
        schema: Schema,
        environment: Environment,
    },

    SchemaDelta(SchemaDelta),

    DataPointer(DataPointer),

    /// Pure state transition with no content.
    #[default]
    Marker,

    /// Adapter-specific bytes, never interpreted by the core.
    Opaque { bytes: Vec<u8> },
}

impl Payload {
    pub fn schema_delta(&self) -> Option<&SchemaDelta> {
        match self {
            Payload::SchemaDelta(delta) => Some(delta),
            _ => None,
        }
    }

    pub fn data_pointer(&self) -> Option<&DataPointer> {
        match self {
            Payload::DataPointer(pointer) => Some(pointer),
            _ => None,
        }
    }

    pub fn is_full_rewrite(&self) -> bool {
        self.data_pointer()
            .is_some_and(|p| p.operation == WriteOperation::FullRewrite)
    }
}
