//! Per-column protection settings.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::crypto::AES_KEY_SIZE;
use crate::error::{TdeError, TdeResult};
use crate::types;

pub const DEFAULT_JOIN_KEY_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSettings {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlindIndexSettings {
    /// Shadow column holding the HMAC of the plaintext.
    pub column: String,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSettings {
    /// Shadow column holding the truncated SHA-256 of the plaintext.
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnConfig {
    pub column: String,
    /// Logical type the client works with; drives literal encoding and decrypted rendering.
    pub data_type: i32,
    pub data_size: i16,
    pub encryption: Option<EncryptionSettings>,
    pub blind_index: Option<BlindIndexSettings>,
    pub join: Option<JoinSettings>,
}

impl ColumnConfig {
    pub fn new(column: impl Into<String>, data_type: i32) -> Self {
        ColumnConfig {
            column: column.into(),
            data_type,
            data_size: types::default_size(data_type),
            encryption: None,
            blind_index: None,
            join: None,
        }
    }

    pub fn encrypted(mut self, key: Vec<u8>) -> Self {
        self.encryption = Some(EncryptionSettings { key });
        self
    }

    pub fn with_blind_index(mut self, key: Vec<u8>) -> Self {
        let column = format!("{}_bi", self.column);
        self.blind_index = Some(BlindIndexSettings { column, key });
        self
    }

    pub fn with_join(mut self) -> Self {
        let column = format!("{}_join", self.column);
        self.join = Some(JoinSettings { column });
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn has_blind_index(&self) -> bool {
        self.blind_index.is_some()
    }

    pub fn has_join(&self) -> bool {
        self.join.is_some()
    }

    pub fn is_protected(&self) -> bool {
        self.is_encrypted() || self.has_blind_index() || self.has_join()
    }
}

/// Read-only lookup of column settings, shared by every connection.
pub trait EncryptionConfig: Send + Sync {
    fn column_config(&self, table: &str, column: &str) -> Option<&ColumnConfig>;

    fn has_tde_enabled(&self, table: &str) -> bool;

    fn join_key_size(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct StaticEncryptionConfig {
    tables: HashMap<String, HashMap<String, ColumnConfig>>,
    join_key_size: usize,
}

impl Default for StaticEncryptionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_JOIN_KEY_SIZE)
    }
}

impl StaticEncryptionConfig {
    pub fn new(join_key_size: usize) -> Self {
        Self {
            tables: HashMap::new(),
            join_key_size,
        }
    }

    pub fn with_column(mut self, table: &str, column: ColumnConfig) -> Self {
        self.insert(table, column);
        self
    }

    pub fn insert(&mut self, table: &str, column: ColumnConfig) {
        self.tables
            .entry(table.to_lowercase())
            .or_default()
            .insert(column.column.to_lowercase(), column);
    }

    pub fn from_definitions(tables: &[TableDefinition], join_key_size: usize) -> TdeResult<Self> {
        if join_key_size == 0 || join_key_size > 32 {
            return Err(TdeError::Config(format!(
                "join_key_size must be between 1 and 32, got {}",
                join_key_size
            )));
        }
        let mut config = Self::new(join_key_size);
        for table in tables {
            for definition in &table.columns {
                let column = definition.to_column_config(&table.name)?;
                debug!(
                    "configured {}.{} (encrypted: {}, blind index: {}, join: {})",
                    table.name,
                    column.column,
                    column.is_encrypted(),
                    column.has_blind_index(),
                    column.has_join()
                );
                config.insert(&table.name, column);
            }
        }
        Ok(config)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

/// Configured names are matched without regard to case, so a quoted `"Cities"` in a query
/// still finds the `cities` entry.
fn fold_case(name: &str) -> Cow<'_, str> {
    if name.chars().any(char::is_uppercase) {
        Cow::Owned(name.to_lowercase())
    } else {
        Cow::Borrowed(name)
    }
}

impl EncryptionConfig for StaticEncryptionConfig {
    fn column_config(&self, table: &str, column: &str) -> Option<&ColumnConfig> {
        self.tables
            .get(fold_case(table).as_ref())?
            .get(fold_case(column).as_ref())
    }

    fn has_tde_enabled(&self, table: &str) -> bool {
        self.tables
            .get(fold_case(table).as_ref())
            .is_some_and(|columns| columns.values().any(ColumnConfig::is_protected))
    }

    fn join_key_size(&self) -> usize {
        self.join_key_size
    }
}

/// Table section of the configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnDefinition>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(default = "default_type_name", rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub size: Option<i16>,
    #[serde(default, deserialize_with = "hex_key")]
    pub encryption_key: Option<Vec<u8>>,
    #[serde(default, deserialize_with = "hex_key")]
    pub blind_index_key: Option<Vec<u8>>,
    #[serde(default)]
    pub blind_index_column: Option<String>,
    #[serde(default)]
    pub join: bool,
    #[serde(default)]
    pub join_column: Option<String>,
}

fn default_type_name() -> String {
    "text".to_string()
}

fn hex_key<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|encoded| hex::decode(encoded.trim()).map_err(serde::de::Error::custom))
        .transpose()
}

impl ColumnDefinition {
    pub fn to_column_config(&self, table: &str) -> TdeResult<ColumnConfig> {
        let data_type = types::oid_by_name(&self.data_type).ok_or_else(|| {
            TdeError::Config(format!(
                "unknown type '{}' for column {}.{}",
                self.data_type, table, self.name
            ))
        })?;

        let name = self.name.to_lowercase();
        let mut column = ColumnConfig::new(name.clone(), data_type);
        if let Some(size) = self.size {
            column.data_size = size;
        }

        if let Some(key) = &self.encryption_key {
            check_key_length(table, &name, "encryption_key", key)?;
            column = column.encrypted(key.clone());
        }

        if let Some(key) = &self.blind_index_key {
            check_key_length(table, &name, "blind_index_key", key)?;
            column = column.with_blind_index(key.clone());
            if let (Some(shadow), Some(settings)) = (&self.blind_index_column, column.blind_index.as_mut()) {
                settings.column = shadow.to_lowercase();
            }
        } else if self.blind_index_column.is_some() {
            return Err(TdeError::Config(format!(
                "blind_index_column set without blind_index_key for {}.{}",
                table, name
            )));
        }

        if self.join || self.join_column.is_some() {
            column = column.with_join();
            if let (Some(shadow), Some(settings)) = (&self.join_column, column.join.as_mut()) {
                settings.column = shadow.to_lowercase();
            }
        }

        Ok(column)
    }
}

fn check_key_length(table: &str, column: &str, field: &str, key: &[u8]) -> TdeResult<()> {
    if key.len() != AES_KEY_SIZE {
        return Err(TdeError::Config(format!(
            "{} of {}.{} must be {} bytes, got {}",
            field,
            table,
            column,
            AES_KEY_SIZE,
            key.len()
        )));
    }
    Ok(())
}
