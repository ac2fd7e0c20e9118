use std::fmt::Debug;

use async_trait::async_trait;
use mockall::automock;

use crate::distance::Location;
use crate::query_service::{QueryParam, QueryService, Row};
use crate::retry::RetryError;

const COUNT_CITIES: &str = "select count(*) as count from cities";
const LIST_CODES: &str = "select code, name from codes order by name asc";
const CITIES_IN_COUNTRY: &str = "select uuid, name from cities where country_code = ?";
const MATCH_CITIES: &str =
    "select uuid, name from cities where country_code = ? and name like ? order by name asc limit 10";

/// Lookups the route layer issues against the cities database.
#[automock]
#[async_trait]
pub trait CityStoreTrait: Send + Sync + Debug {
    async fn count_cities(&self) -> Result<Vec<Row>, RetryError>;
    async fn country_codes(&self) -> Result<Vec<Row>, RetryError>;
    async fn cities_in(&self, country_code: &str) -> Result<Vec<Row>, RetryError>;
    /// At most ten cities of a country whose name starts with `prefix`.
    async fn match_cities(&self, country_code: &str, prefix: &str) -> Result<Vec<Row>, RetryError>;
    async fn location(&self, uuid: &str) -> Result<Option<Location>, RetryError>;
}

#[derive(Debug, Clone)]
pub struct DbCityStore {
    queries: QueryService,
}

impl DbCityStore {
    pub fn new(queries: QueryService) -> Self {
        Self { queries }
    }
}

#[async_trait]
impl CityStoreTrait for DbCityStore {
    async fn count_cities(&self) -> Result<Vec<Row>, RetryError> {
        self.queries.query(COUNT_CITIES, &[]).await
    }

    async fn country_codes(&self) -> Result<Vec<Row>, RetryError> {
        self.queries.query(LIST_CODES, &[]).await
    }

    async fn cities_in(&self, country_code: &str) -> Result<Vec<Row>, RetryError> {
        self.queries
            .query(CITIES_IN_COUNTRY, &[QueryParam::from(country_code)])
            .await
    }

    async fn match_cities(&self, country_code: &str, prefix: &str) -> Result<Vec<Row>, RetryError> {
        let pattern = format!("{}%", prefix);
        self.queries
            .query(MATCH_CITIES, &[QueryParam::from(country_code), QueryParam::from(pattern)])
            .await
    }

    async fn location(&self, uuid: &str) -> Result<Option<Location>, RetryError> {
        self.queries.location(uuid).await
    }
}
