//! HTTP client for the dashboard's domain endpoints.
//!
//! Every request is a GET against `api.baseUrl` joined with the domain's
//! path, carrying the identity as query parameters. Responses are decoded
//! into `DomainPayload`; a body that does not decode is a `Malformed` error.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::SyncError;
use crate::types::{Domain, DomainPayload, UserIdentity};

use super::{DomainFetcher, FetchOptions};

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
    api: ApiConfig,
}

impl HttpFetcher {
    pub fn new(api: &ApiConfig) -> Result<Self, SyncError> {
        let base_url = parse_base_url(&api.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(api.request_timeout_ms))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            api: api.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build the request URL for a domain path with identity parameters.
    pub fn request_url(
        &self,
        path: &str,
        domain: Domain,
        identity: &UserIdentity,
        options: FetchOptions,
    ) -> Result<Url, SyncError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::Config(format!("Invalid path '{}' for {}: {}", path, domain, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("email", &identity.email);
            query.append_pair("id", &identity.internal_id);
            query.append_pair("initials", &identity.initials);
            if options.force_refresh && domain.accepts_force_refresh() {
                query.append_pair("forceRefresh", "true");
            }
        }
        Ok(url)
    }

    async fn get(&self, url: Url, domain: Domain) -> Result<DomainPayload, SyncError> {
        let request_id = Uuid::new_v4();
        log::debug!("HttpFetcher: GET {} [{}] ({})", url.path(), domain, request_id);

        let resp = self
            .client
            .get(url)
            .header("x-request-id", request_id.to_string())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout(self.api.request_timeout_ms)
                } else {
                    SyncError::from(e)
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(SyncError::Http {
                status,
                message: text,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(format!("{} response: {}", domain, e)))?;
        DomainPayload::decode(domain, body)
    }
}

pub(crate) fn parse_base_url(raw: &str) -> Result<Url, SyncError> {
    // Without a trailing slash Url::join would replace the last segment
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&normalized)
        .map_err(|e| SyncError::Config(format!("Invalid base URL '{}': {}", raw, e)))
}

#[async_trait]
impl DomainFetcher for HttpFetcher {
    async fn fetch(
        &self,
        domain: Domain,
        identity: &UserIdentity,
        options: FetchOptions,
    ) -> Result<DomainPayload, SyncError> {
        let endpoint = self.api.endpoint(domain);
        let url = self.request_url(&endpoint.path, domain, identity, options)?;
        self.get(url, domain).await
    }

    fn has_fallback(&self, domain: Domain) -> bool {
        self.api.endpoint(domain).fallback_path.is_some()
    }

    async fn fetch_fallback(
        &self,
        domain: Domain,
        identity: &UserIdentity,
    ) -> Result<DomainPayload, SyncError> {
        let endpoint = self.api.endpoint(domain);
        let path = endpoint
            .fallback_path
            .ok_or_else(|| SyncError::NotConfigured(format!("{} fallback", domain)))?;
        let url = self.request_url(&path, domain, identity, FetchOptions::default())?;
        self.get(url, domain).await
    }
}
