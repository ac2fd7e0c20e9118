use std::sync::Arc;

use anyhow::anyhow;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, Column, Row as _};

use crate::db::{classify_sqlx_error, ConnectionPool};
use crate::distance::Location;
use crate::retry::{AttemptFailure, RetryError, RetryExecutor};

/// Coordinates are usually stored as DECIMAL, which the Any driver cannot
/// carry over from MySQL, so they are cast on the database side.
pub const LOCATION_QUERY: &str =
    "select cast(latitude as double) as latitude, cast(longitude as double) as longitude from cities where uuid = ?";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    /// Numeric view of the value; text is parsed since some drivers hand
    /// decimals over as strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Integer(value) => Some(*value as f64),
            ScalarValue::Float(value) => Some(*value),
            ScalarValue::Text(value) => value.trim().parse().ok(),
            ScalarValue::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }
}

/// One result row: column names in select order, each with its value.
///
/// Only the column types the Any driver maps survive the trip: integers,
/// FLOAT/DOUBLE, character and binary data. On MySQL a DECIMAL, TINYINT,
/// DATE, TIMESTAMP or ENUM column fails the whole fetch, so queries cast such
/// columns in the select list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<(String, ScalarValue)>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&ScalarValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn get_index(&self, index: usize) -> Option<&ScalarValue> {
        self.columns.get(index).map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<N: Into<String>> FromIterator<(N, ScalarValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (N, ScalarValue)>>(iter: I) -> Self {
        Row {
            columns: iter.into_iter().map(|(name, value)| (name.into(), value)).collect(),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A positional query parameter. Always bound, never spliced into the sql.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        QueryParam::Text(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        QueryParam::Text(value)
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        QueryParam::Integer(value)
    }
}

impl From<f64> for QueryParam {
    fn from(value: f64) -> Self {
        QueryParam::Float(value)
    }
}

/// Read-only access to the store.
///
/// Each call borrows a connection, runs the statement and gives the
/// connection back, all inside one retried attempt. A failure half way
/// through therefore retries the whole thing on a fresh checkout.
#[derive(Debug, Clone)]
pub struct QueryService {
    pool: Arc<ConnectionPool>,
    retry: RetryExecutor,
}

impl QueryService {
    pub fn new(pool: Arc<ConnectionPool>, retry: RetryExecutor) -> Self {
        Self { pool, retry }
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, RetryError> {
        self.retry.run("Database query", || self.fetch_all(sql, params)).await
    }

    /// First matching row, `None` when nothing matches.
    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> Result<Option<Row>, RetryError> {
        self.retry.run("Database query", || self.fetch_optional(sql, params)).await
    }

    /// Coordinates of a city. A row without two numeric coordinates is a
    /// permanent failure and is never retried.
    pub async fn location(&self, uuid: &str) -> Result<Option<Location>, RetryError> {
        let maybe_row = self.query_one(LOCATION_QUERY, &[QueryParam::from(uuid)]).await?;

        maybe_row
            .map(|row| location_from_row(&row))
            .transpose()
            .map_err(|source| RetryError::Permanent {
                operation: "Location query".to_string(),
                attempt: 1,
                source,
            })
    }

    async fn fetch_all(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, AttemptFailure> {
        let mut connection = self.pool.acquire().await.map_err(classify_sqlx_error)?;

        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *connection)
            .await
            .map_err(classify_sqlx_error)?;

        rows.iter()
            .map(to_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify_sqlx_error)
    }

    async fn fetch_optional(&self, sql: &str, params: &[QueryParam]) -> Result<Option<Row>, AttemptFailure> {
        let mut connection = self.pool.acquire().await.map_err(classify_sqlx_error)?;

        let maybe_row = bind_params(sqlx::query(sql), params)
            .fetch_optional(&mut *connection)
            .await
            .map_err(classify_sqlx_error)?;

        maybe_row.as_ref().map(to_row).transpose().map_err(classify_sqlx_error)
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &'q [QueryParam],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            QueryParam::Text(value) => query.bind(value.as_str()),
            QueryParam::Integer(value) => query.bind(*value),
            QueryParam::Float(value) => query.bind(*value),
        };
    }
    query
}

fn to_row(row: &AnyRow) -> Result<Row, sqlx::Error> {
    row.columns()
        .iter()
        .map(|column| -> Result<(String, ScalarValue), sqlx::Error> {
            Ok((column.name().to_string(), decode_column(row, column.ordinal())?))
        })
        .collect()
}

/// The Any driver only decodes a value into a compatible rust type, so the
/// candidates are tried in turn. NULL decodes on the first try.
fn decode_column(row: &AnyRow, index: usize) -> Result<ScalarValue, sqlx::Error> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.map_or(ScalarValue::Null, ScalarValue::Integer));
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return Ok(value.map_or(ScalarValue::Null, ScalarValue::Float));
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value.map_or(ScalarValue::Null, ScalarValue::Text));
    }

    let bytes = row.try_get::<Option<Vec<u8>>, _>(index)?;
    Ok(bytes.map_or(ScalarValue::Null, |bytes| {
        ScalarValue::Text(String::from_utf8_lossy(&bytes).into_owned())
    }))
}

fn location_from_row(row: &Row) -> anyhow::Result<Location> {
    let coordinate = |index: usize| {
        row.get_index(index)
            .and_then(ScalarValue::as_f64)
            .ok_or_else(|| anyhow!("location row {:?} has no numeric coordinate at column {}", row, index))
    };

    Ok(Location::new(coordinate(0)?, coordinate(1)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::sqlite_memory_settings;
    use crate::db::{ConnectionSettings, PoolSettings};
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use tracing_test::traced_test;

    const SEED: &[&str] = &[
        "create table codes (code text primary key, name text not null)",
        "create table cities (uuid text primary key, name text not null, country_code text not null, latitude real, longitude real)",
        "insert into codes (code, name) values ('de', 'Germany'), ('at', 'Austria'), ('fr', 'France')",
        "insert into cities values ('abc-123', 'Wuppertal', 'de', 51.0, 7.0)",
        "insert into cities values ('def-456', 'Wien', 'at', 48.2, 16.37)",
        "insert into cities values ('ghi-789', 'Wuerzburg', 'de', 49.79, 9.95)",
    ];

    pub(crate) async fn seeded_query_service() -> QueryService {
        let retry = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(10)).unwrap());
        let (_, service) = seeded_pool(sqlite_memory_settings(), retry).await;
        service
    }

    /// The pool is handed back too so tests can hold its only connection.
    async fn seeded_pool(settings: ConnectionSettings, retry: RetryExecutor) -> (Arc<ConnectionPool>, QueryService) {
        let pool = Arc::new(ConnectionPool::initialize(&settings, &retry).await.unwrap());

        {
            let mut connection = pool.acquire().await.unwrap();
            for statement in SEED {
                sqlx::query(statement).execute(&mut *connection).await.unwrap();
            }
        }

        (pool.clone(), QueryService::new(pool, retry))
    }

    /// One connection and a short acquire timeout, so a held connection
    /// turns the next checkout into a pool timeout.
    fn contended_settings() -> ConnectionSettings {
        ConnectionSettings {
            pool: PoolSettings {
                acquire_timeout: Duration::from_millis(100),
                ..sqlite_memory_settings().pool
            },
            ..sqlite_memory_settings()
        }
    }

    fn retried_attempts(lines: &[&str]) -> usize {
        lines
            .iter()
            .filter(|line| line.contains("for Database query failed, retrying"))
            .count()
    }

    #[tokio::test]
    async fn test_count_returns_a_single_row() {
        let service = seeded_query_service().await;

        let rows = service.query("select count(*) as count from cities", &[]).await.unwrap();

        assert_eq!(rows, vec![Row::from_iter([("count", ScalarValue::Integer(3))])]);
        assert_eq!(serde_json::to_string(&rows).unwrap(), r#"[{"count":3}]"#);
    }

    #[tokio::test]
    async fn test_order_by_is_preserved() {
        let service = seeded_query_service().await;

        let rows = service
            .query("select code, name from codes order by name asc", &[])
            .await
            .unwrap();

        let names: Vec<_> = rows.iter().filter_map(|row| row.get("name")?.as_str()).collect();
        assert_eq!(names, vec!["Austria", "France", "Germany"]);
        assert_eq!(rows[0].column_names().collect::<Vec<_>>(), vec!["code", "name"]);
        assert_eq!(
            serde_json::to_string(&rows[0]).unwrap(),
            r#"{"code":"at","name":"Austria"}"#
        );
    }

    #[tokio::test]
    async fn test_params_are_bound_in_order() {
        let service = seeded_query_service().await;

        let rows = service
            .query(
                "select uuid, name from cities where country_code = ? and name like ? order by name asc limit 10",
                &[QueryParam::from("de"), QueryParam::from("Wu%")],
            )
            .await
            .unwrap();

        let uuids: Vec<_> = rows.iter().filter_map(|row| row.get("uuid")?.as_str()).collect();
        assert_eq!(uuids, vec!["ghi-789", "abc-123"]);
    }

    #[tokio::test]
    async fn test_params_are_never_interpreted_as_sql() {
        let service = seeded_query_service().await;

        let rows = service
            .query(
                "select uuid, name from cities where country_code = ?",
                &[QueryParam::from("de' or '1'='1")],
            )
            .await
            .unwrap();
        assert!(rows.is_empty());

        let location = service.location("x' or 1=1 --").await.unwrap();
        assert_eq!(location, None);
    }

    #[tokio::test]
    async fn test_location_lookup() {
        let service = seeded_query_service().await;

        assert_eq!(service.location("abc-123").await.unwrap(), Some(Location::new(51.0, 7.0)));
        assert_eq!(service.location("does-not-exist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_one() {
        let service = seeded_query_service().await;

        let row = service
            .query_one(LOCATION_QUERY, &[QueryParam::from("abc-123")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("latitude"), Some(&ScalarValue::Float(51.0)));
        assert_eq!(row.get("longitude"), Some(&ScalarValue::Float(7.0)));

        let none = service.query_one(LOCATION_QUERY, &[QueryParam::from("nope")]).await.unwrap();
        assert_eq!(none, None);

        // several matches: only the first one is used
        let first = service
            .query_one("select uuid from cities order by name desc", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.get("uuid").and_then(ScalarValue::as_str), Some("abc-123"));
    }

    #[tokio::test]
    async fn test_nulls_and_mixed_types() {
        let service = seeded_query_service().await;

        let row = service
            .query_one("select null as empty, 1.5 as half, 'x' as letter, ? as bound", &[QueryParam::from(42i64)])
            .await
            .unwrap()
            .unwrap();

        assert!(row.get("empty").unwrap().is_null());
        assert_eq!(row.get("half"), Some(&ScalarValue::Float(1.5)));
        assert_eq!(row.get("letter"), Some(&ScalarValue::Text("x".to_string())));
        assert_eq!(row.get("bound").and_then(ScalarValue::as_i64), Some(42));
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"empty":null,"half":1.5,"letter":"x","bound":42}"#
        );
    }

    #[tokio::test]
    async fn test_location_reads_decimal_columns_as_floats() {
        let service = seeded_query_service().await;
        service
            .query(
                "create table depots (uuid text primary key, latitude decimal(9,6), longitude decimal(9,6))",
                &[],
            )
            .await
            .unwrap();
        service
            .query("insert into depots values ('d-1', 51.0, 7.0)", &[])
            .await
            .unwrap();

        let sql = LOCATION_QUERY.replace("from cities", "from depots");
        let row = service.query_one(&sql, &[QueryParam::from("d-1")]).await.unwrap().unwrap();

        // decimal affinity stores 51.0 as an integer, the cast hands it back as a float
        assert_eq!(row.get("latitude"), Some(&ScalarValue::Float(51.0)));
        assert_eq!(row.get("longitude"), Some(&ScalarValue::Float(7.0)));
    }

    #[tokio::test]
    async fn test_location_without_coordinates_is_a_permanent_failure() {
        let service = seeded_query_service().await;
        service
            .query("insert into cities values ('nul-000', 'Nowhere', 'de', null, null)", &[])
            .await
            .unwrap();

        let result = service.location("nul-000").await;

        match result {
            Err(RetryError::Permanent { operation, attempt, .. }) => {
                assert_eq!(operation, "Location query");
                assert_eq!(attempt, 1);
            }
            other => panic!("expected Permanent, got {:?}", other),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_pool_timeout_is_retried_on_a_fresh_checkout() {
        let retry = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(200)).unwrap());
        let (pool, service) = seeded_pool(contended_settings(), retry).await;

        let held = pool.acquire().await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(held);
        });

        let rows = service.query("select code from codes order by code", &[]).await.unwrap();

        assert_eq!(rows.len(), 3);
        logs_assert(|lines: &[&str]| match retried_attempts(lines) {
            1 => Ok(()),
            n => Err(format!("expected one retried attempt, saw {}", n)),
        });
    }

    #[tokio::test]
    #[traced_test]
    async fn test_pool_timeout_on_every_attempt_exhausts_retries() {
        let retry = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(20)).unwrap());
        let (pool, service) = seeded_pool(contended_settings(), retry).await;

        let held = pool.acquire().await.unwrap();
        let result = service.query("select code from codes", &[]).await;
        drop(held);

        match result {
            Err(RetryError::ExhaustedRetries { operation, attempts, .. }) => {
                assert_eq!(operation, "Database query");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ExhaustedRetries, got {:?}", other),
        }
        logs_assert(|lines: &[&str]| match retried_attempts(lines) {
            2 => Ok(()),
            n => Err(format!("expected two retried attempts, saw {}", n)),
        });
        assert!(logs_contain("Failed Database query after 3 attempts"));

        // the connection is usable again once released
        assert_eq!(service.query("select code from codes", &[]).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_sql_is_not_retried() {
        let service = seeded_query_service().await;

        let result = service.query("select * from no_such_table", &[]).await;

        assert!(matches!(result, Err(RetryError::Permanent { attempt: 1, .. })));
    }

    #[tokio::test]
    async fn test_connections_are_returned_on_every_path() {
        // the pool holds exactly one connection, a single leak would time out the next query
        let service = seeded_query_service().await;

        for _ in 0..10 {
            assert!(service.query("select * from no_such_table", &[]).await.is_err());
            assert_eq!(service.query("select count(*) as count from codes", &[]).await.unwrap().len(), 1);
            assert!(service.location("abc-123").await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_the_pool() {
        let service = seeded_query_service().await;

        let lookups = (0..8).map(|_| service.location("def-456"));
        let results = futures::future::join_all(lookups).await;

        for result in results {
            assert_eq!(result.unwrap(), Some(Location::new(48.2, 16.37)));
        }
    }

    #[test]
    fn test_location_from_row() {
        let row = Row::from_iter([
            ("latitude", ScalarValue::Text("51.5".to_string())),
            ("longitude", ScalarValue::Integer(7)),
        ]);
        assert_eq!(location_from_row(&row).unwrap(), Location::new(51.5, 7.0));

        let broken = Row::from_iter([("latitude", ScalarValue::Null), ("longitude", ScalarValue::Float(7.0))]);
        assert!(location_from_row(&broken).is_err());
    }
}
