use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{event, Level};

use crate::cart_forwarder::CartForwarderTrait;
use crate::city_store::CityStoreTrait;
use crate::distance::{Location, ShipmentQuote};
use crate::query_service::Row;
use crate::retry::RetryError;

#[derive(Clone, Debug)]
pub struct AppState {
    pub city_store: Arc<dyn CityStoreTrait>,
    pub cart: Arc<dyn CartForwarderTrait>,
    pub origin: Location,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/count", get(count))
        .route("/codes", get(codes))
        .route("/cities/:code", get(cities))
        .route("/match/:code/:text", get(match_cities))
        .route("/calc/:uuid", get(calc))
        .route("/confirm/:id", post(confirm))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps core failures onto HTTP: exhausted or cancelled retries mean the
/// backend is unavailable, anything else is an internal error.
#[derive(Debug)]
pub struct ApiError(RetryError);

impl From<RetryError> for ApiError {
    fn from(error: RetryError) -> Self {
        ApiError(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        if self.0.is_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let operation = self.0.operation().to_string();
        event!(Level::ERROR, "{}: {:#}", operation, anyhow::Error::new(self.0));
        (status, "ERROR").into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn count(State(state): State<AppState>) -> Result<Json<Vec<Row>>, ApiError> {
    Ok(Json(state.city_store.count_cities().await?))
}

async fn codes(State(state): State<AppState>) -> Result<Json<Vec<Row>>, ApiError> {
    Ok(Json(state.city_store.country_codes().await?))
}

async fn cities(State(state): State<AppState>, Path(code): Path<String>) -> Result<Json<Vec<Row>>, ApiError> {
    event!(Level::INFO, "cities for {}", code);
    Ok(Json(state.city_store.cities_in(&code).await?))
}

async fn match_cities(
    State(state): State<AppState>,
    Path((code, text)): Path<(String, String)>,
) -> Result<Json<Vec<Row>>, ApiError> {
    event!(Level::INFO, "match {} '{}'", code, text);
    Ok(Json(state.city_store.match_cities(&code, &text).await?))
}

/// Unknown cities answer 500 with a zeroed quote, the same body shape as a
/// successful calculation.
async fn calc(State(state): State<AppState>, Path(uuid): Path<String>) -> Response {
    match state.city_store.location(&uuid).await {
        Ok(Some(location)) => Json(ShipmentQuote::between(&state.origin, &location)).into_response(),
        Ok(None) => {
            event!(Level::WARN, "no location for city {}", uuid);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ShipmentQuote::default())).into_response()
        }
        Err(e) => {
            let error = ApiError(e);
            let status = error.status();
            event!(Level::ERROR, "calc {}: {:#}", uuid, anyhow::Error::new(error.0));
            (status, Json(ShipmentQuote::default())).into_response()
        }
    }
}

/// Relays the confirmation to the cart. The quote was computed by an earlier
/// request, so a failure here leaves nothing to roll back.
async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<Response, ApiError> {
    event!(Level::INFO, "confirm {} - {}", id, body);

    let cart = state.cart.forward(&id, body).await?;
    event!(Level::INFO, "new cart {}", cart);

    if cart.is_empty() {
        Ok(StatusCode::NOT_FOUND.into_response())
    } else {
        Ok(([(header::CONTENT_TYPE, "application/json")], cart).into_response())
    }
}
