//! Table layout and SQL for the readings store.

use crate::error::ConfigError;
use crate::model::value_type;

pub const TABLE_VALUE_TYPES: &str = "edgex_valuetypes";
pub const TABLE_RESOURCES: &str = "edgex_resources";

/// Fixed ids of the value type lookup table.
pub const VALUE_TYPES: [(i16, &str); 26] = [
    (1, value_type::BOOL),
    (2, value_type::STRING),
    (3, value_type::UINT8),
    (4, value_type::UINT16),
    (5, value_type::UINT32),
    (6, value_type::UINT64),
    (7, value_type::INT8),
    (8, value_type::INT16),
    (9, value_type::INT32),
    (10, value_type::INT64),
    (11, value_type::FLOAT32),
    (12, value_type::FLOAT64),
    (13, value_type::BINARY),
    (14, value_type::OBJECT),
    (15, value_type::BOOL_ARRAY),
    (16, value_type::STRING_ARRAY),
    (17, value_type::UINT8_ARRAY),
    (18, value_type::UINT16_ARRAY),
    (19, value_type::UINT32_ARRAY),
    (20, value_type::UINT64_ARRAY),
    (21, value_type::INT8_ARRAY),
    (22, value_type::INT16_ARRAY),
    (23, value_type::INT32_ARRAY),
    (24, value_type::INT64_ARRAY),
    (25, value_type::FLOAT32_ARRAY),
    (26, value_type::FLOAT64_ARRAY),
];

pub const CREATE_VALUE_TYPES: &str = "CREATE TABLE IF NOT EXISTS edgex_valuetypes (\
     id SMALLINT, value_type TEXT NOT NULL, PRIMARY KEY (id))";

pub const INSERT_VALUE_TYPE: &str =
    "INSERT INTO edgex_valuetypes (id, value_type) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING";

pub const SELECT_VALUE_TYPES: &str = "SELECT id, value_type FROM edgex_valuetypes";

pub const CREATE_RESOURCES: &str = "CREATE TABLE IF NOT EXISTS edgex_resources (\
     id SERIAL, device_name TEXT NOT NULL, resource_name TEXT NOT NULL, tags JSONB, PRIMARY KEY (id))";

pub const CREATE_RESOURCES_TAGGED_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS edgex_resources_index1 \
     ON edgex_resources (device_name, resource_name, tags) WHERE tags IS NOT NULL";

pub const CREATE_RESOURCES_UNTAGGED_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS edgex_resources_index2 \
     ON edgex_resources (device_name, resource_name) WHERE tags IS NULL";

pub const SELECT_RESOURCES: &str = "SELECT id, device_name, resource_name, tags FROM edgex_resources";

pub const INSERT_RESOURCE: &str = "INSERT INTO edgex_resources (device_name, resource_name, tags) \
     VALUES ($1, $2, $3) ON CONFLICT DO NOTHING RETURNING id";

pub const SELECT_RESOURCE_ID: &str = "SELECT id FROM edgex_resources \
     WHERE device_name = $1 AND resource_name = $2 AND tags IS NOT DISTINCT FROM $3";

/// Rejects names that cannot be spliced into SQL as a bare identifier.
pub fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(
            "tablename",
            name,
            "must be a plain SQL identifier",
        ))
    }
}

/// Rejects chunk intervals that could escape their string literal.
pub fn validate_chunk_interval(interval: &str) -> Result<(), ConfigError> {
    if !interval.trim().is_empty()
        && interval
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == ':' || c == '.')
    {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(
            "chunktimeinterval",
            interval,
            "must be a PostgreSQL interval such as `7 days`",
        ))
    }
}

pub fn create_readings_table(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         timestamp TIMESTAMP, resource_id INTEGER, value_type_id SMALLINT, event_id UUID, value BYTEA)"
    )
}

pub fn create_hypertable(table: &str) -> String {
    format!("SELECT create_hypertable('{table}', 'timestamp', if_not_exists => TRUE)")
}

pub fn set_chunk_time_interval(table: &str, interval: &str) -> String {
    format!("SELECT set_chunk_time_interval('{table}', INTERVAL '{interval}')")
}

pub fn insert_reading(table: &str, with_event_id: bool) -> String {
    if with_event_id {
        format!(
            "INSERT INTO {table} (value, timestamp, resource_id, value_type_id, event_id) \
             VALUES ($1, $2, $3, $4, $5)"
        )
    } else {
        format!(
            "INSERT INTO {table} (value, timestamp, resource_id, value_type_id) VALUES ($1, $2, $3, $4)"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn value_type_ids_are_dense_and_unique() {
        let ids: HashSet<i16> = VALUE_TYPES.iter().map(|(id, _)| *id).collect();
        let names: HashSet<&str> = VALUE_TYPES.iter().map(|(_, name)| *name).collect();
        assert_eq!(ids.len(), 26);
        assert_eq!(names.len(), 26);
        assert_eq!(ids.iter().min(), Some(&1));
        assert_eq!(ids.iter().max(), Some(&26));
        assert!(!names.contains(value_type::OBJECT_ARRAY));
    }

    #[test]
    fn insert_statements() {
        assert_eq!(
            insert_reading("edgex_readings", false),
            "INSERT INTO edgex_readings (value, timestamp, resource_id, value_type_id) VALUES ($1, $2, $3, $4)"
        );
        assert!(insert_reading("t", true).ends_with("VALUES ($1, $2, $3, $4, $5)"));
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(validate_table_name("edgex_readings").is_ok());
        assert!(validate_table_name("_r2").is_ok());
        assert!(validate_table_name("1abc").is_err());
        assert!(validate_table_name("readings; DROP TABLE x").is_err());
        assert!(validate_chunk_interval("7 days").is_ok());
        assert!(validate_chunk_interval("1 day'; --").is_err());
    }
}
