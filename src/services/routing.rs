use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;

use crate::{error::AppError, models::location::Coordinate};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRoute {
    pub polyline: Vec<Coordinate>,
    pub distance_m: f64,
    pub duration_s: f64,
}

#[async_trait]
pub trait RoutePlanner: Send + Sync {
    async fn plan(&self, from: Coordinate, to: Coordinate) -> Result<PlannedRoute, AppError>;
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    geometry: OsrmGeometry,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

fn parse_route_response(parsed: OsrmRouteResponse) -> Result<PlannedRoute, AppError> {
    if parsed.code != "Ok" {
        return Err(AppError::Upstream(format!(
            "OSRM returned {}: {}",
            parsed.code,
            parsed.message.unwrap_or_default()
        )));
    }
    let route = parsed
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Upstream("OSRM returned no routes".into()))?;
    // GeoJSON orders pairs as [lng, lat].
    let polyline = route
        .geometry
        .coordinates
        .into_iter()
        .map(|[lng, lat]| Coordinate::new(lat, lng))
        .collect();
    Ok(PlannedRoute {
        polyline,
        distance_m: route.distance,
        duration_s: route.duration,
    })
}

/// Thin HTTP client for the OSRM `/route` service.
#[derive(Debug, Clone)]
pub struct OsrmClient {
    client: Client,
    endpoint: Url,
}

impl OsrmClient {
    pub fn new(endpoint: Url) -> Result<Self, AppError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl RoutePlanner for OsrmClient {
    async fn plan(&self, from: Coordinate, to: Coordinate) -> Result<PlannedRoute, AppError> {
        let coords = format!(
            "{:.6},{:.6};{:.6},{:.6}",
            from.lng, from.lat, to.lng, to.lat
        );
        let base = self.endpoint.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/route/v1/driving/{coords}"))
            .map_err(|err| AppError::Upstream(format!("failed to build OSRM URL: {err}")))?;
        url.query_pairs_mut()
            .append_pair("overview", "full")
            .append_pair("geometries", "geojson");

        let response = self.client.get(url).send().await?;
        let parsed: OsrmRouteResponse = response.json().await?;
        parse_route_response(parsed)
    }
}

/// Used when no routing service is configured.
pub fn straight_route(from: Coordinate, to: Coordinate) -> PlannedRoute {
    PlannedRoute {
        polyline: vec![from, to],
        distance_m: from.distance_m(&to),
        duration_s: 0.0,
    }
}
