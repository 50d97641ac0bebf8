use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use strider_core::upstream::{FriendLocation, LocationService, Profile};
use strider_core::{Identity, LocationUpdate, UpstreamError};

use crate::wire::{self, FriendsResponse, LoginResponse, ProfileResponse};

pub const DEFAULT_BASE_URL: &str = "https://www.wh00.ooo";
const DEFAULT_USER_AGENT: &str = "app.whoo/0.33.3 iOS/18.3.2";
const DEFAULT_LANGUAGE: &str = "en-JP";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub user_agent: String,
    pub accept_language: String,
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            accept_language: DEFAULT_LANGUAGE.to_owned(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// HTTP client for the upstream location service.
pub struct UpstreamClient {
    http: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        let lang = HeaderValue::from_str(&config.accept_language)
            .map_err(|e| UpstreamError::Network(format!("invalid accept-language: {e}")))?;
        headers.insert(ACCEPT_LANGUAGE, lang);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .gzip(true)
            .build()
            .map_err(|e| UpstreamError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder, identity: &Identity) -> RequestBuilder {
        builder.bearer_auth(identity.expose())
    }

    /// Send a request and decode a JSON body, mapping transport failures and
    /// non-2xx statuses into [`UpstreamError`].
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, UpstreamError> {
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "upstream returned error status");
            return Err(UpstreamError::from_status(status.as_u16(), body));
        }

        let body = if body.trim().is_empty() { "null" } else { body.as_str() };
        serde_json::from_str(body).map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

#[async_trait]
impl LocationService for UpstreamClient {
    #[instrument(skip_all)]
    async fn login(&self, email: &str, password: &str) -> Result<String, UpstreamError> {
        let request = self
            .http
            .post(self.url(wire::LOGIN_PATH))
            .form(&[("email", email), ("password", password)]);
        let response: LoginResponse = self.send(request).await?;
        wire::check_errors(&response.errors)?;
        response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| UpstreamError::Decode("login response without access_token".into()))
    }

    #[instrument(skip_all, fields(identity = %identity))]
    async fn update_location(
        &self,
        identity: &Identity,
        update: &LocationUpdate,
    ) -> Result<(), UpstreamError> {
        let request = self.authed(
            self.http
                .patch(self.url(wire::LOCATION_PATH))
                .form(&wire::location_form(update)),
            identity,
        );
        let response: Option<serde_json::Value> = self.send(request).await?;
        if let Some(serde_json::Value::Object(body)) = &response {
            wire::check_errors(&body.get("errors").cloned())?;
        }
        debug!(lat = update.step.lat, lng = update.step.lng, "location reported");
        Ok(())
    }

    #[instrument(skip_all, fields(identity = %identity))]
    async fn get_profile(&self, identity: &Identity) -> Result<Profile, UpstreamError> {
        let request = self.authed(self.http.get(self.url(wire::PROFILE_PATH)), identity);
        let response: ProfileResponse = self.send(request).await?;
        wire::check_errors(&response.errors)?;
        response
            .user
            .ok_or_else(|| UpstreamError::Decode("profile response without user".into()))
    }

    #[instrument(skip_all, fields(identity = %identity))]
    async fn friend_locations(
        &self,
        identity: &Identity,
    ) -> Result<Vec<FriendLocation>, UpstreamError> {
        let request = self.authed(self.http.get(self.url(wire::FRIENDS_PATH)), identity);
        let response: FriendsResponse = self.send(request).await?;
        wire::check_errors(&response.errors)?;
        response
            .locations
            .ok_or_else(|| UpstreamError::Decode("locations response without locations".into()))
    }
}
