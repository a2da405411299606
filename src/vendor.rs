// Vendor collaborators: the auth endpoint and the per-hotel rate call.
// Both are injectable; the HTTP versions below talk to a JSON vendor API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    archive::{ArchiveSink, TrafficKind, TrafficRecord},
    config::VendorConfig,
    error::{AuthError, VendorError},
    types::{RateInfo, RateQuery, Token},
};

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self) -> Result<Token, AuthError>;
}

#[async_trait]
pub trait RateFetcher: Send + Sync + 'static {
    async fn fetch(&self, query: &RateQuery, token: &Token) -> Result<RateInfo, VendorError>;
}

#[derive(Debug, Serialize)]
struct AuthRequestBody<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponseBody {
    access_token: String,
    expires_in: u64,
}

pub struct HttpAuthenticator {
    client: reqwest::Client,
    config: VendorConfig,
}

impl HttpAuthenticator {
    pub fn new(config: VendorConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AuthError::NetworkError(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn token_url(&self) -> String {
        format!("{}/auth/token", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self) -> Result<Token, AuthError> {
        let response = self
            .client
            .post(self.token_url())
            .json(&AuthRequestBody {
                client_id: &self.config.client_id,
                client_secret: &self.config.client_secret,
            })
            .send()
            .await
            .map_err(|e| AuthError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status_code: status.as_u16(),
                message,
            });
        }

        let body: AuthResponseBody = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        Ok(Token::new(body.access_token, Duration::from_secs(body.expires_in)))
    }
}

pub struct HttpRateFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout_ms: u64,
    archive: Option<ArchiveSink>,
}

impl HttpRateFetcher {
    pub fn new(config: &VendorConfig) -> Result<Self, VendorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VendorError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout_ms: config.timeout_ms,
            archive: None,
        })
    }

    // Raw request/response bodies get copied to the sink, best effort
    pub fn with_archive(mut self, sink: ArchiveSink) -> Self {
        self.archive = Some(sink);
        self
    }

    fn rates_url(&self, query: &RateQuery) -> String {
        format!(
            "{}/hotels/{}/rates?check_in={}&check_out={}",
            self.base_url,
            query.hotel_id,
            query.stay.check_in.format("%Y-%m-%d"),
            query.stay.check_out.format("%Y-%m-%d"),
        )
    }

    fn archive_traffic(&self, hotel_id: &str, kind: TrafficKind, body: impl Into<bytes::Bytes>) {
        if let Some(sink) = &self.archive {
            sink.record(TrafficRecord::new(hotel_id, kind, body));
        }
    }
}

#[async_trait]
impl RateFetcher for HttpRateFetcher {
    async fn fetch(&self, query: &RateQuery, token: &Token) -> Result<RateInfo, VendorError> {
        let url = self.rates_url(query);
        self.archive_traffic(&query.hotel_id, TrafficKind::Request, format!("GET {url}"));

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token.value)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VendorError::Timeout(self.timeout_ms)
                } else {
                    VendorError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| VendorError::NetworkError(e.to_string()))?;
        self.archive_traffic(&query.hotel_id, TrafficKind::Response, body.clone());

        match status.as_u16() {
            200..=299 => parse_rate(&body),
            401 | 403 => Err(VendorError::TokenRejected),
            404 => Err(VendorError::NoAvailability(query.hotel_id.clone())),
            code => Err(VendorError::ApiResponseError {
                status_code: code,
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }
}

fn parse_rate(body: &[u8]) -> Result<RateInfo, VendorError> {
    serde_json::from_slice(body).map_err(|e| VendorError::InvalidResponse(e.to_string()))
}
