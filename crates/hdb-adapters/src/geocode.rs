use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hdb_core::GeocodedAddress;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::transport::{FetchError, Transport};
use crate::AddressResolver;

pub const DEFAULT_AUTH_URL: &str = "https://www.onemap.gov.sg/api/auth/post/getToken";
pub const DEFAULT_SEARCH_URL: &str = "https://www.onemap.gov.sg/api/common/elastic/search";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("invalid geocode configuration: {0}")]
    Config(String),
    #[error("geocode authentication failed: {0}")]
    Authentication(String),
    #[error("no geocode match for {query:?}")]
    NoMatch { query: String },
    #[error("malformed geocode response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
}

impl GeocodeError {
    pub fn is_no_match(&self) -> bool {
        matches!(self, GeocodeError::NoMatch { .. })
    }
}

/// Credentials and endpoints for the geocoding service.
#[derive(Clone)]
pub struct GeocodeConfig {
    pub auth_url: String,
    pub search_url: String,
    pub email: String,
    password: String,
}

impl fmt::Debug for GeocodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeocodeConfig")
            .field("auth_url", &self.auth_url)
            .field("search_url", &self.search_url)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl GeocodeConfig {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Result<Self, GeocodeError> {
        let email = email.into().trim().to_string();
        let password = password.into();
        if email.is_empty() {
            return Err(GeocodeError::Config("geocode email is empty".to_string()));
        }
        if password.is_empty() {
            return Err(GeocodeError::Config("geocode password is empty".to_string()));
        }
        Ok(Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            email,
            password,
        })
    }

    /// Reads `ONEMAP_EMAIL` / `ONEMAP_EMAIL_PASSWORD`, with optional
    /// `HDB_GEOCODE_AUTH_URL` / `HDB_GEOCODE_SEARCH_URL` overrides.
    pub fn from_env() -> Result<Self, GeocodeError> {
        let required = |name: &str| {
            std::env::var(name).map_err(|_| GeocodeError::Config(format!("{name} must be set")))
        };
        let mut config = Self::new(required("ONEMAP_EMAIL")?, required("ONEMAP_EMAIL_PASSWORD")?)?;
        if let Ok(url) = std::env::var("HDB_GEOCODE_AUTH_URL") {
            config.auth_url = url;
        }
        if let Ok(url) = std::env::var("HDB_GEOCODE_SEARCH_URL") {
            config.search_url = url;
        }
        Ok(config)
    }

    pub fn with_endpoints(mut self, auth_url: impl Into<String>, search_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self.search_url = search_url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "BLK_NO", default)]
    block_number: String,
    #[serde(rename = "ROAD_NAME", default)]
    road_name: String,
    #[serde(rename = "BUILDING", default)]
    building_name: String,
    #[serde(rename = "ADDRESS", default)]
    formatted_address: String,
    #[serde(rename = "POSTAL", default)]
    postal_code: String,
    #[serde(rename = "X")]
    x: String,
    #[serde(rename = "Y")]
    y: String,
    #[serde(rename = "LATITUDE")]
    latitude: String,
    #[serde(rename = "LONGITUDE")]
    longitude: String,
}

/// Authenticated geocoding client. The token is acquired once at construction.
#[derive(Debug)]
pub struct GeocodeClient {
    http: Arc<Transport>,
    search_url: Url,
    token: String,
    run_id: Uuid,
}

impl GeocodeClient {
    pub async fn connect(
        config: GeocodeConfig,
        http: Arc<Transport>,
        run_id: Uuid,
    ) -> Result<Self, GeocodeError> {
        let search_url = Url::parse(&config.search_url)
            .map_err(|e| GeocodeError::Config(format!("search url {}: {e}", config.search_url)))?;

        let request = http
            .client()
            .post(&config.auth_url)
            .json(&TokenRequest {
                email: &config.email,
                password: &config.password,
            })
            .build()
            .map_err(|e| GeocodeError::Authentication(e.to_string()))?;
        let response = http
            .execute(run_id, request)
            .await
            .map_err(|e| GeocodeError::Authentication(e.to_string()))?;
        let token = parse_token(&response.body)?;

        info!(email = %config.email, "authenticated with geocoding service");
        Ok(Self {
            http,
            search_url,
            token,
            run_id,
        })
    }
}

#[async_trait]
impl AddressResolver for GeocodeClient {
    async fn resolve(&self, query: &str) -> Result<GeocodedAddress, GeocodeError> {
        let request = self
            .http
            .client()
            .get(search_url(&self.search_url, query))
            .bearer_auth(&self.token)
            .build()
            .map_err(FetchError::from)?;
        let response = self.http.execute(self.run_id, request).await?;
        let found = first_match(query, &response.body)?;
        debug!(query, postal_code = %found.postal_code, "geocoded address");
        Ok(found)
    }
}

/// Pull the access token out of a token-exchange response.
pub fn parse_token(body: &[u8]) -> Result<String, GeocodeError> {
    let response: TokenResponse = serde_json::from_slice(body)
        .map_err(|e| GeocodeError::Authentication(format!("unreadable token response: {e}")))?;
    match response.access_token.filter(|t| !t.is_empty()) {
        Some(token) => Ok(token),
        None => Err(GeocodeError::Authentication(
            response
                .error
                .unwrap_or_else(|| "response carried no access_token".to_string()),
        )),
    }
}

/// Search URL for `query`. Spaces go out as `%20`, not the form-style `+`.
pub fn search_url(base: &Url, query: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("searchVal", query)
        .append_pair("returnGeom", "Y")
        .append_pair("getAddrDetails", "Y")
        .append_pair("pageNum", "1");
    // A literal '+' was already escaped to %2B, so every '+' left is a space.
    let encoded = url.query().map(|q| q.replace('+', "%20"));
    url.set_query(encoded.as_deref());
    url
}

/// First result of a search response, or [`GeocodeError::NoMatch`] when there is none.
pub fn first_match(query: &str, body: &[u8]) -> Result<GeocodedAddress, GeocodeError> {
    let response: SearchResponse =
        serde_json::from_slice(body).map_err(|e| GeocodeError::Malformed(e.to_string()))?;
    let Some(first) = response.results.into_iter().next() else {
        return Err(GeocodeError::NoMatch {
            query: query.to_string(),
        });
    };

    Ok(GeocodedAddress {
        projected_x: parse_coordinate("X", &first.x)?,
        projected_y: parse_coordinate("Y", &first.y)?,
        latitude: parse_coordinate("LATITUDE", &first.latitude)?,
        longitude: parse_coordinate("LONGITUDE", &first.longitude)?,
        block_number: first.block_number,
        road_name: first.road_name,
        building_name: first.building_name,
        formatted_address: first.formatted_address,
        postal_code: first.postal_code,
    })
}

fn parse_coordinate(field: &str, raw: &str) -> Result<f64, GeocodeError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| GeocodeError::Malformed(format!("{field} is not a number: {raw:?}")))
}
