use async_trait::async_trait;
use live_proto::{ConflictBody, MoveAccepted, MoveSubmission, TabStatus};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::stream::{StreamConfig, DEFAULT_HEARTBEAT_INTERVAL};
use crate::{SubmitError, SyncError};

/// Where moves go. `HttpTransport` talks to the relay; tests script their own.
#[async_trait]
pub trait MoveTransport: Send + Sync {
    async fn submit_move(
        &self,
        game_id: &str,
        submission: &MoveSubmission,
    ) -> Result<MoveAccepted, SubmitError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, SyncError> {
        Ok(Self::with_client(Client::new(), Url::parse(base_url)?, token))
    }

    pub fn with_client(http: Client, base_url: Url, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, SubmitError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SubmitError::Transport(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Stream settings for one game tab: this transport's token plus a heartbeat that keeps
    /// the tab fresh while it is connected.
    pub fn game_stream(&self, game_id: &str, tab_id: &str) -> Result<StreamConfig, SubmitError> {
        let stream = self.endpoint(&["games", game_id, "stream"])?;
        let heartbeat = self.endpoint(&["games", game_id, "tabs", tab_id, "heartbeat"])?;
        let mut config =
            StreamConfig::new(stream, tab_id).with_heartbeat(heartbeat, DEFAULT_HEARTBEAT_INTERVAL);
        if !self.token.is_empty() {
            config = config.with_token(self.token.clone());
        }
        Ok(config)
    }

    /// Refreshes this tab's `lastSeen` on the relay.
    pub async fn heartbeat(&self, game_id: &str, tab_id: &str) -> Result<TabStatus, SubmitError> {
        let url = self.endpoint(&["games", game_id, "tabs", tab_id, "heartbeat"])?;
        self.post_empty(url).await
    }

    /// Asks the relay to make this tab the active one.
    pub async fn activate(&self, game_id: &str, tab_id: &str) -> Result<TabStatus, SubmitError> {
        let url = self.endpoint(&["games", game_id, "tabs", tab_id, "activate"])?;
        self.post_empty(url).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, url: Url) -> Result<T, SubmitError> {
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(to_transport_error)?;
        decode(res).await
    }
}

#[async_trait]
impl MoveTransport for HttpTransport {
    async fn submit_move(
        &self,
        game_id: &str,
        submission: &MoveSubmission,
    ) -> Result<MoveAccepted, SubmitError> {
        let url = self.endpoint(&["games", game_id, "moves"])?;
        debug!(
            target = "live.http",
            game_id,
            move_id = %submission.move_id,
            expected_version = submission.expected_version,
            "submitting move"
        );
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(submission)
            .send()
            .await
            .map_err(to_transport_error)?;
        decode(res).await
    }
}

async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, SubmitError> {
    let status = res.status();
    if status.is_success() {
        return res.json::<T>().await.map_err(to_transport_error);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(SubmitError::Unauthorized),
        StatusCode::CONFLICT => {
            let body = res.text().await.map_err(to_transport_error)?;
            match serde_json::from_str::<ConflictBody>(&body) {
                Ok(conflict) => Err(SubmitError::Conflict(Box::new(conflict))),
                Err(_) => Err(SubmitError::Rejected {
                    status: status.as_u16(),
                    message: body,
                }),
            }
        }
        status if status.is_server_error() => Err(SubmitError::Transport(format!(
            "server error {status}"
        ))),
        _ => Err(SubmitError::Rejected {
            status: status.as_u16(),
            message: res.text().await.unwrap_or_default(),
        }),
    }
}

fn to_transport_error(err: reqwest::Error) -> SubmitError {
    SubmitError::Transport(err.to_string())
}
