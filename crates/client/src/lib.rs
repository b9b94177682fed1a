//! REST client for Girder-style upload endpoints.
//!
//! Async HTTP client using `reqwest` with `Girder-Token` authentication.
//! [`GirderClient`] implements [`RemoteStore`] so the upload sequencer can
//! drive it directly.

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use scrubdrop_protocol::{
    ErrorResponse, RemoteDocument, TokenGrant, UploadAck, UploadToken, UploadTokenRequest,
};
use scrubdrop_uploader::{RemoteFuture, RemoteStore, UploadError};
use serde_json::Value;
use tracing::debug;

const TOKEN_HEADER: &str = "girder-token";

/// Errors from the REST client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid API token")]
    InvalidToken,
}

impl From<ClientError> for UploadError {
    fn from(e: ClientError) -> Self {
        UploadError::Remote(e.to_string())
    }
}

/// Client for the file upload endpoints.
#[derive(Debug, Clone)]
pub struct GirderClient {
    http: reqwest::Client,
    base_url: String,
}

impl GirderClient {
    /// Creates a client for the API rooted at `api_url`, e.g.
    /// `https://data.example.org/api/v1`.
    pub fn new(api_url: &str, token: Option<&str>) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            headers.insert(
                HeaderName::from_static(TOKEN_HEADER),
                HeaderValue::from_str(token).map_err(|_| ClientError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a request and decodes the returned upload or file document.
    async fn document(&self, req: reqwest::RequestBuilder) -> Result<RemoteDocument, ClientError> {
        let body = send(req).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// `POST /file`: creates an upload beneath a folder or item.
    pub async fn create_upload(
        &self,
        request: &UploadTokenRequest,
    ) -> Result<RemoteDocument, ClientError> {
        let url = format!("{}/file", self.base_url);
        let params = build_params(request);
        self.document(self.http.post(&url).query(&params)).await
    }

    /// `PUT /file/{id}/contents`: starts replacing an existing file.
    pub async fn update_contents(
        &self,
        file_id: &str,
        size: u64,
    ) -> Result<RemoteDocument, ClientError> {
        let url = format!("{}/file/{file_id}/contents", self.base_url);
        self.document(self.http.put(&url).query(&[("size", size.to_string())]))
            .await
    }

    /// `POST /file/chunk`: sends bytes at `offset` of an upload.
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<RemoteDocument, ClientError> {
        let url = format!("{}/file/chunk", self.base_url);
        let req = self
            .http
            .post(&url)
            .query(&[("uploadId", upload_id.to_string()), ("offset", offset.to_string())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data);
        self.document(req).await
    }

    /// `DELETE /file/upload/{id}`: discards a partial upload.
    pub async fn cancel_upload(&self, upload_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/file/upload/{upload_id}", self.base_url);
        send(self.http.delete(&url)).await?;
        Ok(())
    }
}

impl RemoteStore for GirderClient {
    fn request_upload_token<'a>(
        &'a self,
        request: &'a UploadTokenRequest,
    ) -> RemoteFuture<'a, TokenGrant> {
        Box::pin(async move { Ok(self.create_upload(request).await?.into()) })
    }

    fn open_existing<'a>(&'a self, file_id: &'a str, size: u64) -> RemoteFuture<'a, TokenGrant> {
        Box::pin(async move { Ok(self.update_contents(file_id, size).await?.into()) })
    }

    fn send_chunk<'a>(
        &'a self,
        token: &'a UploadToken,
        offset: u64,
        data: Bytes,
    ) -> RemoteFuture<'a, UploadAck> {
        Box::pin(async move {
            debug!(upload = %token.upload_id, offset, len = data.len(), "POST file/chunk");
            Ok(self.upload_chunk(&token.upload_id, offset, data).await?.into())
        })
    }

    fn abort_upload<'a>(&'a self, token: &'a UploadToken) -> RemoteFuture<'a, ()> {
        Box::pin(async move { Ok(self.cancel_upload(&token.upload_id).await?) })
    }
}

/// Sends a request and returns the body of a successful response.
async fn send(req: reqwest::RequestBuilder) -> Result<Bytes, ClientError> {
    let resp = req.send().await?;
    let status = resp.status();

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        return Err(ClientError::Api {
            status: status.as_u16(),
            message,
        });
    }

    Ok(resp.bytes().await?)
}

/// Builds the token request query. Extra parameters override the standard
/// ones; strings are sent verbatim, other values as JSON.
fn build_params(request: &UploadTokenRequest) -> Vec<(String, String)> {
    let mut params = vec![
        ("parentType".to_string(), request.parent_type.to_string()),
        ("parentId".to_string(), request.parent_id.clone()),
        ("name".to_string(), request.name.clone()),
        ("size".to_string(), request.size.to_string()),
    ];
    if !request.mime_type.is_empty() {
        params.push(("mimeType".to_string(), request.mime_type.clone()));
    }

    for (key, value) in &request.extra {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match params.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value,
            None => params.push((key.clone(), value)),
        }
    }
    params
}
