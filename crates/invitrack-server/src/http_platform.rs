use async_trait::async_trait;
use invitrack_core::platform::{Platform, PlatformError};
use invitrack_models::invite::{InvitePayload, InviteRecord};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// REST client for the platform's invite endpoints.
pub struct HttpPlatform {
    http: Client,
    api_base: String,
    token: String,
}

impl HttpPlatform {
    pub fn new(api_base: &str, token: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Invitrack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Http(e.to_string()))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// GET with exponential backoff on 5xx, 429 and transport errors.
    async fn get_with_retry(&self, url: &str) -> Result<String, PlatformError> {
        let mut last_err = PlatformError::Http("no attempts made".to_string());
        for attempt in 0..MAX_RETRIES {
            let request = self
                .http
                .get(url)
                .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token));

            match request.send().await {
                Ok(resp) => match classify(resp.status()) {
                    Attempt::Success => {
                        return resp.text().await.map_err(|e| PlatformError::Http(e.to_string()))
                    }
                    Attempt::Retry => {
                        last_err = PlatformError::RemoteError(format!(
                            "server error {} from {}",
                            resp.status(),
                            url
                        ));
                    }
                    Attempt::Fail(err) => return Err(err),
                },
                Err(e) => {
                    last_err = PlatformError::Http(e.to_string());
                }
            }
            if attempt + 1 < MAX_RETRIES {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                tracing::debug!(url, attempt, ?delay, "retrying platform request");
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn fetch_invites(&self, server_id: i64) -> Result<Vec<InviteRecord>, PlatformError> {
        let url = format!("{}/guilds/{}/invites", self.api_base, server_id);
        let body = self.get_with_retry(&url).await?;
        decode_invites(server_id, &body)
    }

    async fn fetch_vanity_invite(
        &self,
        server_id: i64,
    ) -> Result<Option<InviteRecord>, PlatformError> {
        let url = format!("{}/guilds/{}/vanity-url", self.api_base, server_id);
        match self.get_with_retry(&url).await {
            Ok(body) => decode_vanity(server_id, &body),
            Err(PlatformError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

enum Attempt {
    Success,
    Retry,
    Fail(PlatformError),
}

fn classify(status: StatusCode) -> Attempt {
    if status.is_success() {
        Attempt::Success
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Attempt::Retry
    } else if status == StatusCode::FORBIDDEN {
        Attempt::Fail(PlatformError::Forbidden)
    } else if status == StatusCode::NOT_FOUND {
        Attempt::Fail(PlatformError::NotFound)
    } else {
        Attempt::Fail(PlatformError::RemoteError(format!("request returned {status}")))
    }
}

fn decode_invites(server_id: i64, body: &str) -> Result<Vec<InviteRecord>, PlatformError> {
    let payloads: Vec<InvitePayload> =
        serde_json::from_str(body).map_err(|e| PlatformError::Decode(e.to_string()))?;
    payloads
        .into_iter()
        .map(|payload| {
            payload
                .into_record(server_id)
                .map_err(|e| PlatformError::Decode(e.to_string()))
        })
        .collect()
}

fn decode_vanity(server_id: i64, body: &str) -> Result<Option<InviteRecord>, PlatformError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| PlatformError::Decode(e.to_string()))?;
    if value.get("code").map_or(true, Value::is_null) {
        return Ok(None);
    }
    let mut payload: InvitePayload =
        serde_json::from_value(value).map_err(|e| PlatformError::Decode(e.to_string()))?;
    // Vanity responses are not tied to a channel.
    payload.channel_id.get_or_insert_with(|| "0".to_string());
    payload
        .into_record(server_id)
        .map(Some)
        .map_err(|e| PlatformError::Decode(e.to_string()))
}
