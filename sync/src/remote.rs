//! The remote activities API as seen by the client.

use crate::config::{normalize_endpoint, ConfigError};
use crate::error::RemoteError;
use async_trait::async_trait;
use nestlog_engine::wire::{
    ActivityPage, ConflictBody, CreateActivityRequest, ErrorBody, RemoteActivity,
    UpdateActivityRequest,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// CRUD access to the remote authority.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `POST /activities`. Creating twice with the same client id returns
    /// the existing record.
    async fn create(&self, request: CreateActivityRequest) -> Result<RemoteActivity, RemoteError>;

    /// `PATCH /activities/{serverId}`.
    async fn update(
        &self,
        server_id: &str,
        request: UpdateActivityRequest,
    ) -> Result<RemoteActivity, RemoteError>;

    /// `GET /activities?owner=&page=&limit=`, pages are 1-based.
    async fn list(&self, owner: &str, page: u32, limit: u32) -> Result<ActivityPage, RemoteError>;

    /// `DELETE /activities/{serverId}`.
    async fn delete(&self, server_id: &str) -> Result<(), RemoteError>;
}

/// [`RemoteApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let base_url = normalize_endpoint(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create(&self, request: CreateActivityRequest) -> Result<RemoteActivity, RemoteError> {
        let response = self
            .client
            .post(self.url("/activities"))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn update(
        &self,
        server_id: &str,
        request: UpdateActivityRequest,
    ) -> Result<RemoteActivity, RemoteError> {
        let response = self
            .client
            .patch(self.url(&format!("/activities/{server_id}")))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn list(&self, owner: &str, page: u32, limit: u32) -> Result<ActivityPage, RemoteError> {
        let response = self
            .client
            .get(self.url("/activities"))
            .query(&[("owner", owner.to_string()), ("page", page.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn delete(&self, server_id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.url(&format!("/activities/{server_id}")))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Transient(format!("malformed response: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Map a failed response onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::CONFLICT => match serde_json::from_str::<ConflictBody>(body) {
            Ok(conflict) => RemoteError::VersionConflict(Box::new(conflict.current)),
            Err(_) => RemoteError::Transient(api_error_message(status, body)),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(api_error_message(status, body))
        }
        s if s.is_server_error() => RemoteError::Transient(api_error_message(status, body)),
        _ => RemoteError::Validation(api_error_message(status, body)),
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() {
        RemoteError::Offline(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

fn api_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        return match payload.details {
            Some(details) => format!("{}: {} ({})", payload.error, details, status.as_u16()),
            None => format!("{} ({})", payload.error, status.as_u16()),
        };
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}
