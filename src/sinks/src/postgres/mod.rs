//! PostgreSQL / TimescaleDB writer storing each reading as a binary value row.

pub mod cache;
pub mod schema;

use crate::configurable::parse_bool;
use crate::context::AppFunctionContext;
use crate::data::{events_from_data, PipelineData};
use crate::error::{ConfigError, SenderError};
use crate::model::{to_nanoseconds, value_type, Event, Reading};
use crate::secrets::non_empty;
use crate::sender::{require_data, Sender};
use async_trait::async_trait;
use cache::{MetadataCache, MetadataError};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::time::Duration;
use time::{OffsetDateTime, PrimitiveDateTime};

pub const POSTGRES_WRITE: &str = "PostgresWrite";
pub const DEFAULT_HOST: &str = "timescaledb";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "edgex";
pub const DEFAULT_TABLE: &str = "edgex_readings";
pub const DEFAULT_CHUNK_TIME_INTERVAL: &str = "7 days";

const SECRET_USERNAME: &str = "username";
const SECRET_PASSWORD: &str = "password";
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresWriterConfig {
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub table_name: String,
    pub store_event_id: bool,
    pub secret_path: String,
    pub chunk_time_interval: String,
    pub max_conn: u32,
}

impl PostgresWriterConfig {
    pub fn new(secret_path: impl Into<String>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database_name: DEFAULT_DATABASE.to_string(),
            table_name: DEFAULT_TABLE.to_string(),
            store_event_id: false,
            secret_path: secret_path.into(),
            chunk_time_interval: DEFAULT_CHUNK_TIME_INTERVAL.to_string(),
            max_conn: default_max_conn(),
        }
    }
}

pub fn default_max_conn() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

/// Binary column value for a reading.
///
/// Numbers and booleans are big-endian, objects are JSON, strings and array
/// types are stored as their raw text.
pub fn encode_value(reading: &Reading) -> Result<Vec<u8>, String> {
    let raw = reading.value.trim();
    let convert = |err: &dyn std::fmt::Display| {
        format!(
            "failed to convert reading string value to specified data type {}: {err}",
            reading.value_type
        )
    };
    macro_rules! be {
        ($ty:ty) => {
            raw.parse::<$ty>()
                .map(|v| v.to_be_bytes().to_vec())
                .map_err(|err| convert(&err))
        };
    }
    match reading.value_type.as_str() {
        value_type::BINARY => Ok(reading.binary_value.clone().unwrap_or_default()),
        value_type::OBJECT | value_type::OBJECT_ARRAY => {
            serde_json::to_vec(reading.object_value.as_ref().unwrap_or(&Value::Null))
                .map_err(|err| format!("failed to encode object value, err: {err}"))
        }
        value_type::BOOL => parse_bool(raw)
            .map(|v| vec![u8::from(v)])
            .ok_or_else(|| convert(&format!("invalid boolean `{raw}`"))),
        value_type::INT8 => be!(i8),
        value_type::UINT8 => be!(u8),
        value_type::INT16 => be!(i16),
        value_type::UINT16 => be!(u16),
        value_type::INT32 => be!(i32),
        value_type::UINT32 => be!(u32),
        value_type::INT64 => be!(i64),
        value_type::UINT64 => be!(u64),
        value_type::FLOAT32 => be!(f32),
        value_type::FLOAT64 => be!(f64),
        value_type::STRING
        | value_type::BOOL_ARRAY
        | value_type::STRING_ARRAY
        | value_type::INT8_ARRAY
        | value_type::UINT8_ARRAY
        | value_type::INT16_ARRAY
        | value_type::UINT16_ARRAY
        | value_type::INT32_ARRAY
        | value_type::UINT32_ARRAY
        | value_type::INT64_ARRAY
        | value_type::UINT64_ARRAY
        | value_type::FLOAT32_ARRAY
        | value_type::FLOAT64_ARRAY => Ok(reading.value.as_bytes().to_vec()),
        other => Err(format!("unsupported value type: {other}")),
    }
}

fn reading_timestamp(event: &Event, reading: &Reading) -> Result<PrimitiveDateTime, String> {
    let origin = if reading.origin == 0 {
        event.origin
    } else {
        reading.origin
    };
    let at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(to_nanoseconds(origin)))
        .map_err(|err| format!("invalid origin {origin}: {err}"))?;
    Ok(PrimitiveDateTime::new(at.date(), at.time()))
}

fn tags_value(event: &Event) -> Option<Value> {
    if event.tags.is_empty() {
        None
    } else {
        Some(Value::Object(
            event.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ))
    }
}

/// A reading encoded for insertion, still missing its metadata ids.
struct PreparedReading<'a> {
    reading: &'a Reading,
    tags: Option<Value>,
    event_id: Option<uuid::Uuid>,
    value: Vec<u8>,
    timestamp: PrimitiveDateTime,
}

fn prepare_readings(events: &[Event], store_event_id: bool) -> Vec<PreparedReading<'_>> {
    let mut prepared = Vec::new();
    for event in events {
        let event_id = if store_event_id {
            match uuid::Uuid::parse_str(&event.id) {
                Ok(id) => Some(id),
                Err(err) => {
                    tracing::warn!(event_id = %event.id, error = %err, "skipping event with invalid id");
                    continue;
                }
            }
        } else {
            None
        };
        let tags = tags_value(event);

        for reading in &event.readings {
            let encoded = encode_value(reading)
                .and_then(|value| Ok((value, reading_timestamp(event, reading)?)));
            match encoded {
                Ok((value, timestamp)) => prepared.push(PreparedReading {
                    reading,
                    tags: tags.clone(),
                    event_id,
                    value,
                    timestamp,
                }),
                Err(err) => tracing::warn!(
                    reading_id = %reading.id,
                    resource = %reading.resource_name,
                    error = %err,
                    "skipping reading"
                ),
            }
        }
    }
    prepared
}

struct PoolState {
    pool: Option<PgPool>,
    secrets_last_retrieved: OffsetDateTime,
}

pub struct PostgresWriter {
    config: PostgresWriterConfig,
    persist_on_error: bool,
    insert_sql: String,
    cache: MetadataCache,
    state: tokio::sync::Mutex<PoolState>,
}

impl PostgresWriter {
    pub fn new(config: PostgresWriterConfig, persist_on_error: bool) -> Result<Self, ConfigError> {
        if config.secret_path.trim().is_empty() {
            return Err(ConfigError::Missing("secretpath".to_string()));
        }
        schema::validate_table_name(&config.table_name)?;
        schema::validate_chunk_interval(&config.chunk_time_interval)?;
        if config.max_conn == 0 {
            return Err(ConfigError::invalid_value("maxconn", "0", "must be positive"));
        }
        Ok(Self {
            insert_sql: schema::insert_reading(&config.table_name, config.store_event_id),
            config,
            persist_on_error,
            cache: MetadataCache::new(),
            state: tokio::sync::Mutex::new(PoolState {
                pool: None,
                secrets_last_retrieved: OffsetDateTime::UNIX_EPOCH,
            }),
        })
    }

    async fn pool(&self, ctx: &dyn AppFunctionContext) -> Result<PgPool, SenderError> {
        let mut state = self.state.lock().await;
        if state.secrets_last_retrieved >= ctx.secrets_last_updated() {
            if let Some(pool) = state.pool.as_ref() {
                return Ok(pool.clone());
            }
        }

        let secrets = ctx.get_secret(&self.config.secret_path).await?;
        let missing = |key: &str| {
            SenderError::Credentials(format!(
                "auth mode usernamepassword selected however {key} was not found at secret path"
            ))
        };
        let username = non_empty(&secrets, SECRET_USERNAME).ok_or_else(|| missing(SECRET_USERNAME))?;
        let password = non_empty(&secrets, SECRET_PASSWORD).ok_or_else(|| missing(SECRET_PASSWORD))?;

        let options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .database(&self.config.database_name)
            .username(username)
            .password(password);
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_conn)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|err| SenderError::Connection(format!("unable to connect to database, error: {err}")))?;
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            database = %self.config.database_name,
            max_conn = self.config.max_conn,
            "connected to Postgres"
        );

        let mut conn = pool
            .acquire()
            .await
            .map_err(|err| SenderError::Connection(format!("failed to acquire a Postgres connection: {err}")))?;
        self.initialize_schema(&mut conn).await?;
        drop(conn);

        if let Some(previous) = state.pool.replace(pool.clone()) {
            previous.close().await;
        }
        state.secrets_last_retrieved = OffsetDateTime::now_utc();
        Ok(pool)
    }

    async fn initialize_schema(&self, conn: &mut PgConnection) -> Result<(), SenderError> {
        let exec_err = |what: &str, err: sqlx::Error| SenderError::Other(format!("failed to {what}, error: {err}"));

        sqlx::query(schema::CREATE_VALUE_TYPES)
            .execute(&mut *conn)
            .await
            .map_err(|err| exec_err("create table \"edgex_valuetypes\"", err))?;
        for (id, name) in schema::VALUE_TYPES {
            sqlx::query(schema::INSERT_VALUE_TYPE)
                .bind(id)
                .bind(name)
                .execute(&mut *conn)
                .await
                .map_err(|err| exec_err("insert value type name into edgex_valuetypes", err))?;
        }
        for (what, sql) in [
            ("create table \"edgex_resources\"", schema::CREATE_RESOURCES),
            ("create index on table \"edgex_resources\"", schema::CREATE_RESOURCES_TAGGED_INDEX),
            ("create index on table \"edgex_resources\"", schema::CREATE_RESOURCES_UNTAGGED_INDEX),
        ] {
            sqlx::query(sql)
                .execute(&mut *conn)
                .await
                .map_err(|err| exec_err(what, err))?;
        }
        sqlx::query(&schema::create_readings_table(&self.config.table_name))
            .execute(&mut *conn)
            .await
            .map_err(|err| exec_err(&format!("create table \"{}\"", self.config.table_name), err))?;

        match sqlx::query(&schema::create_hypertable(&self.config.table_name))
            .execute(&mut *conn)
            .await
        {
            Ok(_) => {
                let sql = schema::set_chunk_time_interval(
                    &self.config.table_name,
                    &self.config.chunk_time_interval,
                );
                if let Err(err) = sqlx::query(&sql).execute(&mut *conn).await {
                    tracing::warn!(error = %err, "unable to set chunk time interval");
                }
            }
            Err(err) => tracing::warn!(
                error = %err,
                "unable to create hypertable, data will be stored in a standard table"
            ),
        }
        Ok(())
    }

    /// Inserts every reading of `events` in one transaction. Readings that
    /// cannot be encoded are logged and skipped before the transaction starts.
    async fn insert_events(&self, pool: &PgPool, events: &[Event]) -> Result<usize, String> {
        let prepared = prepare_readings(events, self.config.store_event_id);

        let mut conn = pool
            .acquire()
            .await
            .map_err(|err| format!("failed to acquire a Postgres connection: {err}"))?;
        let mut rows = Vec::with_capacity(prepared.len());
        for reading in prepared {
            let value_type_id = match self
                .cache
                .value_type_id(&mut *conn, &reading.reading.value_type)
                .await
            {
                Ok(id) => id,
                Err(err @ MetadataError::UnknownValueType(_)) => {
                    tracing::warn!(
                        reading_id = %reading.reading.id,
                        resource = %reading.reading.resource_name,
                        error = %err,
                        "skipping reading"
                    );
                    continue;
                }
                Err(err) => return Err(err.to_string()),
            };
            let resource_id = self
                .cache
                .resource_id(
                    &mut *conn,
                    &reading.reading.device_name,
                    &reading.reading.resource_name,
                    reading.tags.as_ref(),
                )
                .await
                .map_err(|err| err.to_string())?;
            rows.push((resource_id, value_type_id, reading));
        }
        drop(conn);

        let insert_err = |err: sqlx::Error| {
            format!("failed to insert data into the table {}, err: {err}", self.config.table_name)
        };
        let mut tx = pool.begin().await.map_err(insert_err)?;
        for (resource_id, value_type_id, reading) in &rows {
            let mut query = sqlx::query(&self.insert_sql)
                .bind(reading.value.as_slice())
                .bind(reading.timestamp)
                .bind(*resource_id)
                .bind(*value_type_id);
            if let Some(event_id) = reading.event_id {
                query = query.bind(event_id);
            }
            query.execute(&mut *tx).await.map_err(insert_err)?;
        }
        tx.commit().await.map_err(insert_err)?;
        Ok(rows.len())
    }

    async fn write_events(&self, ctx: &dyn AppFunctionContext, events: &[Event]) -> Result<(), SenderError> {
        let pool = self.pool(ctx).await?;
        match self.insert_events(&pool, events).await {
            Ok(inserted) => {
                tracing::debug!(
                    pipeline_id = ctx.pipeline_id(),
                    correlation_id = ctx.correlation_id(),
                    readings = inserted,
                    "wrote readings to Postgres"
                );
                Ok(())
            }
            Err(err) => {
                let action = if self.persist_on_error {
                    let retry = serde_json::to_vec(events).map_err(|err| {
                        SenderError::Other(format!("failed to marshal the retry data, error: {err}"))
                    })?;
                    ctx.set_retry_data(retry);
                    "persisting Events for later retry"
                } else {
                    "drop event"
                };
                Err(SenderError::Transport(format!(
                    "failed to write readings to Postgres, {action}. Error: {err}"
                )))
            }
        }
    }
}

#[async_trait]
impl Sender for PostgresWriter {
    fn name(&self) -> &str {
        POSTGRES_WRITE
    }

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError> {
        let data = require_data(self.name(), ctx, data)?;
        let events = events_from_data(&data)
            .map_err(|err| SenderError::UnsupportedData(err.to_string()))?;
        if let Err(err) = self.write_events(ctx, &events).await {
            tracing::error!(
                pipeline_id = ctx.pipeline_id(),
                correlation_id = ctx.correlation_id(),
                table = %self.config.table_name,
                error = %err,
                "Postgres write failed"
            );
            return Err(err);
        }
        Ok(data)
    }
}
