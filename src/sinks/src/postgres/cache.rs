//! Id lookups for resources and value types, loaded once per writer.
//!
//! Lookups run on an autocommit connection, never inside a reading batch, so
//! every cached resource id refers to a committed row.

use super::schema;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, Row};
use std::collections::HashMap;
use tokio::sync::OnceCell;

/// Cache key for a device resource and its tag set.
pub fn resource_key(device_name: &str, resource_name: &str, tags: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_name.as_bytes());
    hasher.update([0]);
    hasher.update(resource_name.as_bytes());
    hasher.update([0]);
    match tags {
        Some(tags) => hasher.update(tags.to_string().as_bytes()),
        None => hasher.update(b"null"),
    }
    hex::encode(hasher.finalize())
}

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("{context}, err: {source}")]
    Query {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid value type: {0}")]
    UnknownValueType(String),
}

fn query_err(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> MetadataError {
    let context = context.into();
    move |source| MetadataError::Query { context, source }
}

#[derive(Default)]
pub struct MetadataCache {
    value_types: OnceCell<HashMap<String, i16>>,
    resources: OnceCell<RwLock<HashMap<String, i32>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn value_type_id(
        &self,
        conn: &mut PgConnection,
        value_type: &str,
    ) -> Result<i16, MetadataError> {
        let types = self
            .value_types
            .get_or_try_init(|| async {
                let rows = sqlx::query(schema::SELECT_VALUE_TYPES)
                    .fetch_all(&mut *conn)
                    .await?;
                rows.iter()
                    .map(|row| -> Result<(String, i16), sqlx::Error> {
                        Ok((row.try_get(1)?, row.try_get(0)?))
                    })
                    .collect::<Result<HashMap<_, _>, _>>()
            })
            .await
            .map_err(query_err("failed to load value types"))?;
        types
            .get(value_type)
            .copied()
            .ok_or_else(|| MetadataError::UnknownValueType(value_type.to_string()))
    }

    pub async fn resource_id(
        &self,
        conn: &mut PgConnection,
        device_name: &str,
        resource_name: &str,
        tags: Option<&Value>,
    ) -> Result<i32, MetadataError> {
        let resources = self
            .resources
            .get_or_try_init(|| async {
                let rows = sqlx::query(schema::SELECT_RESOURCES)
                    .fetch_all(&mut *conn)
                    .await?;
                let mut map = HashMap::with_capacity(rows.len());
                for row in rows {
                    let id: i32 = row.try_get(0)?;
                    let device: String = row.try_get(1)?;
                    let resource: String = row.try_get(2)?;
                    let tags: Option<Value> = row.try_get(3)?;
                    map.insert(resource_key(&device, &resource, tags.as_ref()), id);
                }
                Ok::<_, sqlx::Error>(RwLock::new(map))
            })
            .await
            .map_err(query_err("failed to load resources"))?;

        let key = resource_key(device_name, resource_name, tags);
        if let Some(id) = resources.read().get(&key) {
            return Ok(*id);
        }

        let inserted: Option<i32> = sqlx::query_scalar(schema::INSERT_RESOURCE)
            .bind(device_name)
            .bind(resource_name)
            .bind(tags)
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_err(format!(
                "failed to insert data into the table {}",
                schema::TABLE_RESOURCES
            )))?;
        let id = match inserted {
            Some(id) => id,
            // another writer inserted the same resource first
            None => sqlx::query_scalar(schema::SELECT_RESOURCE_ID)
                .bind(device_name)
                .bind(resource_name)
                .bind(tags)
                .fetch_one(&mut *conn)
                .await
                .map_err(query_err("failed to query resource id"))?,
        };
        resources.write().insert(key, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_distinguish_tags() {
        let untagged = resource_key("d", "r", None);
        let tagged = resource_key("d", "r", Some(&json!({"site": "a"})));
        assert_ne!(untagged, tagged);
        assert_eq!(tagged, resource_key("d", "r", Some(&json!({"site": "a"}))));
        assert_ne!(resource_key("dr", "", None), resource_key("d", "r", None));
    }
}
