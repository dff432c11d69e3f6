use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, Response,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{IntentId, SessionId},
    error::ApiError,
    protocol::{
        MessageResponse, SessionInfo, StartResponse, UploadResponse, IDEMPOTENCY_KEY_HEADER,
        SESSION_ID_HEADER,
    },
};
use tracing::{info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    error::TransportError,
    gateway::{Action, RemoteGateway, ServerDelta, SessionHandle, StartConfig, UploadFile},
};

/// [`RemoteGateway`] over the builder's JSON HTTP API.
pub struct HttpGateway {
    http: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        Self::new(&settings.base_url()?, settings.request_timeout())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Sends one request and returns the success body. No retries.
    async fn send(
        &self,
        request: RequestBuilder,
        route: &'static str,
        intent: IntentId,
    ) -> Result<Vec<u8>, TransportError> {
        let response = request
            .header(IDEMPOTENCY_KEY_HEADER, intent.to_string())
            .send()
            .await
            .map_err(|err| {
                let err = TransportError::from(err);
                warn!(route, %intent, error = %err, "gateway: request failed");
                err
            })?;
        read_body(response).await.inspect_err(|err| {
            warn!(route, %intent, error = %err, "gateway: request rejected");
        })
    }
}

async fn read_body(response: Response) -> Result<Vec<u8>, TransportError> {
    let status = response.status();
    let body = response.bytes().await?;
    if status.is_success() {
        return Ok(body.to_vec());
    }

    let message = match serde_json::from_slice::<ApiError>(&body) {
        Ok(api_error) => api_error.message,
        Err(_) if body.is_empty() => status.to_string(),
        Err(_) => String::from_utf8_lossy(&body).into_owned(),
    };
    Err(TransportError::server(Some(status.as_u16()), message))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(body)
        .map_err(|err| TransportError::server(None, format!("malformed response: {err}")))
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn start(
        &self,
        config: &StartConfig,
        intent: IntentId,
    ) -> Result<SessionHandle, TransportError> {
        let request = self.http.post(self.endpoint("start")).json(&config.request());
        let response: StartResponse = decode(&self.send(request, "start", intent).await?)?;
        info!(
            session_id = %response.session_id,
            state = ?response.state,
            "gateway: session started"
        );
        Ok(response.into())
    }

    async fn send_action(
        &self,
        session_id: &SessionId,
        action: &Action,
        intent: IntentId,
    ) -> Result<ServerDelta, TransportError> {
        let request = self
            .http
            .post(self.endpoint("message"))
            .json(&action.to_request(session_id));
        let response: MessageResponse = decode(&self.send(request, "message", intent).await?)?;
        info!(
            session_id = %session_id,
            action = ?action.kind(),
            state = ?response.state,
            "gateway: action acknowledged"
        );
        Ok(response.into())
    }

    async fn upload_file(
        &self,
        session_id: &SessionId,
        file: &UploadFile,
        intent: IntentId,
    ) -> Result<ServerDelta, TransportError> {
        let part = Part::bytes(file.content.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.mime_type())?;
        let form = Form::new()
            .text("session_id", session_id.to_string())
            .part("file", part);
        let request = self.http.post(self.endpoint("upload")).multipart(form);
        let response: UploadResponse = decode(&self.send(request, "upload", intent).await?)?;
        info!(
            session_id = %session_id,
            filename = %file.filename,
            records = response.file_result.as_ref().map(|r| r.record_count),
            "gateway: file uploaded"
        );
        Ok(response.into())
    }

    async fn end_session(
        &self,
        session_id: &SessionId,
        intent: IntentId,
    ) -> Result<(), TransportError> {
        let request = self
            .http
            .delete(self.endpoint("session"))
            .header(SESSION_ID_HEADER, session_id.as_str());
        // 200 and 204 both count; whatever body comes back is ignored.
        self.send(request, "session", intent).await?;
        info!(session_id = %session_id, "gateway: session ended");
        Ok(())
    }

    async fn session_info(
        &self,
        session_id: &SessionId,
        intent: IntentId,
    ) -> Result<SessionInfo, TransportError> {
        let request = self
            .http
            .get(self.endpoint("session/info"))
            .header(SESSION_ID_HEADER, session_id.as_str());
        decode(&self.send(request, "session/info", intent).await?)
    }
}

#[cfg(test)]
#[path = "tests/http_gateway_tests.rs"]
mod tests;
