//! Database provider: one short-lived connection per call.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column, ColumnIndex, ConnectOptions, Connection, Decode, Executor, MySql, Postgres, Row, Type};

use crate::engine::interpolate::{interpolate, render_str, RunContext};
use crate::engine::template::{DatabaseFunction, DbClient};
use crate::error::AppError;

/// Fully resolved connection parameters for one call.
#[derive(Clone, PartialEq)]
pub struct DbTarget {
    pub client: DbClient,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// PEM bundle; enables verified TLS when present.
    pub ca: Option<String>,
}

impl std::fmt::Debug for DbTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTarget")
            .field("client", &self.client)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("ca", &self.ca.is_some())
            .finish_non_exhaustive()
    }
}

impl DbTarget {
    /// Interpolate the connection template against the run context.
    pub fn resolve(func: &DatabaseFunction, ctx: &RunContext) -> Result<Self, AppError> {
        let conn = &func.connection;
        let port = match interpolate(&conn.port, ctx)? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse::<u16>().ok(),
            _ => None,
        }
        .ok_or_else(|| AppError::Template("Database port must be an integer in 1..=65535".into()))?;

        let ca = match conn.ca.as_ref().map(|v| interpolate(v, ctx)).transpose()? {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        };

        Ok(Self {
            client: func.client,
            host: text_field("host", &conn.host, ctx)?,
            port,
            database: text_field("database", &conn.database, ctx)?,
            username: text_field("username", &conn.username, ctx)?,
            password: text_field("password", &conn.password, ctx)?,
            ca,
        })
    }
}

fn text_field(name: &str, value: &Value, ctx: &RunContext) -> Result<String, AppError> {
    match interpolate(value, ctx)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(AppError::Template(format!(
            "Database {name} must resolve to a string, got {other}"
        ))),
    }
}

// ── Transport seam ─────────────────────────────────────────────────

/// Executes one statement and returns the first row, if any.
#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn query_first_row(
        &self,
        target: &DbTarget,
        query: &str,
        params: &[Value],
    ) -> Result<Option<Map<String, Value>>, AppError>;
}

/// Reject targets that resolve to the local machine.
pub async fn ensure_not_loopback(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return Err(AppError::Transport(format!(
            "Database host '{host}' resolves to a loopback address"
        )));
    }

    let addrs = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Transport(format!("Could not resolve database host '{host}': {e}")))?;
    for addr in addrs {
        if is_loopback(&addr.ip()) {
            return Err(AppError::Transport(format!(
                "Database host '{host}' resolves to a loopback address ({})",
                addr.ip()
            )));
        }
    }
    Ok(())
}

fn is_loopback(ip: &IpAddr) -> bool {
    let ip = ip.to_canonical();
    ip.is_loopback() || ip.is_unspecified()
}

/// Resolve, guard and run a database function against `sql`.
pub(crate) async fn call(
    sql: &dyn SqlClient,
    func: &DatabaseFunction,
    ctx: &RunContext,
) -> Result<Value, AppError> {
    let target = DbTarget::resolve(func, ctx)?;
    ensure_not_loopback(&target.host, target.port).await?;

    let query = render_str(&func.query, ctx)?;
    let params = func
        .params
        .iter()
        .map(|p| interpolate(p, ctx))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(
        client = target.client.as_str(),
        host = %target.host,
        port = target.port,
        params = params.len(),
        "Running database function"
    );

    let row = sql.query_first_row(&target, &query, &params).await?;
    Ok(row.map(Value::Object).unwrap_or(Value::Null))
}

// ── sqlx implementation ────────────────────────────────────────────

pub struct SqlxClient {
    connect_timeout: Duration,
}

impl SqlxClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn run_postgres(
        &self,
        target: &DbTarget,
        query: &str,
        params: &[Value],
    ) -> Result<Option<Map<String, Value>>, AppError> {
        let mut opts = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database)
            .username(&target.username)
            .password(&target.password);
        if let Some(ca) = &target.ca {
            opts = opts
                .ssl_mode(PgSslMode::VerifyCa)
                .ssl_root_cert_from_pem(ca.as_bytes().to_vec());
        }

        let mut conn: PgConnection = tokio::time::timeout(self.connect_timeout, opts.connect())
            .await
            .map_err(|_| connect_timed_out(target))??;

        let row = fetch_first_pg(&mut conn, query, params).await;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Closing postgres connection failed");
        }
        Ok(row?.map(|r| decode_row(&r)))
    }

    async fn run_mysql(
        &self,
        target: &DbTarget,
        query: &str,
        params: &[Value],
    ) -> Result<Option<Map<String, Value>>, AppError> {
        let mut opts = MySqlConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database)
            .username(&target.username)
            .password(&target.password);
        if let Some(ca) = &target.ca {
            opts = opts
                .ssl_mode(MySqlSslMode::VerifyCa)
                .ssl_ca_from_pem(ca.as_bytes().to_vec());
        }

        let mut conn: MySqlConnection = tokio::time::timeout(self.connect_timeout, opts.connect())
            .await
            .map_err(|_| connect_timed_out(target))??;

        let row = fetch_first_mysql(&mut conn, query, params).await;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Closing mysql connection failed");
        }
        Ok(row?.map(|r| decode_row(&r)))
    }
}

#[async_trait]
impl SqlClient for SqlxClient {
    async fn query_first_row(
        &self,
        target: &DbTarget,
        query: &str,
        params: &[Value],
    ) -> Result<Option<Map<String, Value>>, AppError> {
        match target.client {
            DbClient::Postgres => self.run_postgres(target, query, params).await,
            DbClient::Mysql => self.run_mysql(target, query, params).await,
        }
    }
}

fn connect_timed_out(target: &DbTarget) -> AppError {
    AppError::Transport(format!(
        "Timed out connecting to {} at {}:{}",
        target.client.as_str(),
        target.host,
        target.port
    ))
}

// Statements like `ALTER USER` produce no rows; both paths must yield `None`
// for them rather than `RowNotFound`.

async fn fetch_first_pg(
    conn: &mut PgConnection,
    query: &str,
    params: &[Value],
) -> Result<Option<PgRow>, sqlx::Error> {
    if params.is_empty() {
        conn.fetch_optional(sqlx::raw_sql(query)).await
    } else {
        let bound = params
            .iter()
            .map(BindValue::from)
            .fold(sqlx::query::<Postgres>(query), |q, v| match v {
                BindValue::Null => q.bind(None::<String>),
                BindValue::Bool(b) => q.bind(b),
                BindValue::Int(i) => q.bind(i),
                BindValue::Float(f) => q.bind(f),
                BindValue::Text(s) => q.bind(s),
            });
        conn.fetch_optional(bound).await
    }
}

async fn fetch_first_mysql(
    conn: &mut MySqlConnection,
    query: &str,
    params: &[Value],
) -> Result<Option<MySqlRow>, sqlx::Error> {
    if params.is_empty() {
        conn.fetch_optional(sqlx::raw_sql(query)).await
    } else {
        let bound = params
            .iter()
            .map(BindValue::from)
            .fold(sqlx::query::<MySql>(query), |q, v| match v {
                BindValue::Null => q.bind(None::<String>),
                BindValue::Bool(b) => q.bind(b),
                BindValue::Int(i) => q.bind(i),
                BindValue::Float(f) => q.bind(f),
                BindValue::Text(s) => q.bind(s),
            });
        conn.fetch_optional(bound).await
    }
}

/// A JSON parameter narrowed to what both drivers bind natively.
/// Arrays and objects are sent as their JSON text.
#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for BindValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => BindValue::Null,
            Value::Bool(b) => BindValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => BindValue::Int(i),
                None => BindValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => BindValue::Text(s.clone()),
            other => BindValue::Text(other.to_string()),
        }
    }
}

fn try_column<'r, R, T>(row: &'r R, index: usize) -> Option<Option<T>>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, usize>(index).ok()
}

/// Decode a row into a JSON object. Columns of unsupported types become `null`.
fn decode_row<'r, R>(row: &'r R) -> Map<String, Value>
where
    R: Row,
    usize: ColumnIndex<R>,
    String: Decode<'r, R::Database> + Type<R::Database>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    i32: Decode<'r, R::Database> + Type<R::Database>,
    f64: Decode<'r, R::Database> + Type<R::Database>,
    bool: Decode<'r, R::Database> + Type<R::Database>,
    DateTime<Utc>: Decode<'r, R::Database> + Type<R::Database>,
    NaiveDateTime: Decode<'r, R::Database> + Type<R::Database>,
{
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Some(v) = try_column::<R, String>(row, i) {
            v.map(Value::String)
        } else if let Some(v) = try_column::<R, i64>(row, i) {
            v.map(Value::from)
        } else if let Some(v) = try_column::<R, i32>(row, i) {
            v.map(Value::from)
        } else if let Some(v) = try_column::<R, f64>(row, i) {
            v.map(Value::from)
        } else if let Some(v) = try_column::<R, bool>(row, i) {
            v.map(Value::Bool)
        } else if let Some(v) = try_column::<R, DateTime<Utc>>(row, i) {
            v.map(|t| Value::String(t.to_rfc3339()))
        } else if let Some(v) = try_column::<R, NaiveDateTime>(row, i) {
            v.map(|t| Value::String(t.to_string()))
        } else {
            None
        };
        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    out
}
