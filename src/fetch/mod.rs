//! Domain fetch endpoints.
//!
//! The coordinator only sees `DomainFetcher`; `http::HttpFetcher` is the
//! production implementation and tests plug in fakes.

pub mod http;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::{Domain, DomainPayload, UserIdentity};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Ask the backend to bypass its own cache (only some domains honour it).
    pub force_refresh: bool,
}

#[async_trait]
pub trait DomainFetcher: Send + Sync {
    async fn fetch(
        &self,
        domain: Domain,
        identity: &UserIdentity,
        options: FetchOptions,
    ) -> Result<DomainPayload, SyncError>;

    /// Whether `domain` has a legacy endpoint worth one attempt after a failure.
    fn has_fallback(&self, _domain: Domain) -> bool {
        false
    }

    async fn fetch_fallback(
        &self,
        domain: Domain,
        _identity: &UserIdentity,
    ) -> Result<DomainPayload, SyncError> {
        Err(SyncError::NotConfigured(format!("{} fallback", domain)))
    }
}

pub use http::HttpFetcher;
