//! HTTP delivery client for a JSON mail API.
//!
//! [`HttpMailClient`] is a `tower::Service<Arc<OutboundMessage>>`, so it plugs
//! straight into a [`mail_dispatch::Dispatcher`]. Credentials, region and
//! endpoint are resolved up front by [`MailClientConfig`]; a missing or
//! invalid value is returned as a [`ClientError`] instead of producing a
//! client that fails on every send.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bon::Builder;
use futures::future::BoxFuture;
use http::{HeaderName, StatusCode};
use mail_dispatch::OutboundMessage;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tower::Service;
use tracing::{debug, error, info, warn};
use url::Url;

// --- Constants ---
pub const ENV_API_KEY: &str = "MAIL_API_KEY";
pub const ENV_REGION: &str = "MAIL_API_REGION";
pub const ENV_ENDPOINT: &str = "MAIL_API_ENDPOINT";
pub const ENV_TIMEOUT_SECS: &str = "MAIL_API_TIMEOUT_SECS";

const REGION_PLACEHOLDER: &str = "{region}";
const SEND_PATH: &str = "v1/messages";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const REGION_HEADER: HeaderName = HeaderName::from_static("x-mail-region");

// --- Error Definition ---
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("missing required setting {name}"))]
    MissingSetting { name: &'static str },

    #[snafu(display("invalid value for {name}: {value:?}"))]
    InvalidSetting { name: &'static str, value: String },

    #[snafu(display("invalid mail API endpoint {endpoint:?}: {source}"))]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },

    #[snafu(display("failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("mail API request timed out: {source}"))]
    Timeout { source: reqwest::Error },

    #[snafu(display("mail API transport error: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("mail API error (status {status}): {message}"))]
    Api { status: u16, message: String },

    #[snafu(display("failed to decode mail API response: {source}"))]
    Decode { source: reqwest::Error },
}

impl ClientError {
    /// Whether the provider rejected the message because of its own rate
    /// limit, as opposed to the message itself.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS.as_u16())
    }
}

// --- Configuration ---

/// Connection settings for the mail API.
///
/// `endpoint` may contain a `{region}` placeholder, which is replaced with
/// `region` when the client is built.
#[derive(Clone, Builder)]
pub struct MailClientConfig {
    #[builder(into)]
    pub api_key: String,
    #[builder(into)]
    pub region: String,
    #[builder(into)]
    pub endpoint: String,
    #[builder(default = Duration::from_secs(DEFAULT_TIMEOUT_SECS))]
    pub timeout: Duration,
    #[builder(into, default = DEFAULT_USER_AGENT.to_string())]
    pub user_agent: String,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` from the environment.
    #[builder(default = true)]
    pub use_system_proxy: bool,
}

impl fmt::Debug for MailClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailClientConfig")
            .field("api_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("use_system_proxy", &self.use_system_proxy)
            .finish()
    }
}

impl MailClientConfig {
    /// Reads the configuration from the process environment, loading a
    /// `.env` file first if one exists.
    pub fn from_env() -> Result<Self, ClientError> {
        if dotenvy::dotenv().is_ok() {
            debug!(target: "mail_client", ".env file loaded");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// (`MAIL_API_KEY`, `MAIL_API_REGION`, `MAIL_API_ENDPOINT`,
    /// `MAIL_API_TIMEOUT_SECS`) to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .context(MissingSettingSnafu { name })
        };

        let api_key = required(ENV_API_KEY)?;
        let region = required(ENV_REGION)?;
        let endpoint = required(ENV_ENDPOINT)?;
        let timeout = match lookup(ENV_TIMEOUT_SECS) {
            Some(raw) => {
                let secs = raw.trim().parse::<u64>().ok().filter(|secs| *secs > 0);
                secs.map(Duration::from_secs).context(InvalidSettingSnafu {
                    name: ENV_TIMEOUT_SECS,
                    value: raw,
                })?
            }
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        Ok(Self::builder()
            .api_key(api_key)
            .region(region)
            .endpoint(endpoint)
            .timeout(timeout)
            .build())
    }

    /// The URL messages are POSTed to, with the region substituted in.
    pub fn send_url(&self) -> Result<Url, ClientError> {
        let mut base = self.endpoint.trim().replace(REGION_PLACEHOLDER, self.region.trim());
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .and_then(|url| url.join(SEND_PATH))
            .context(InvalidEndpointSnafu {
                endpoint: self.endpoint.clone(),
            })
    }
}

// --- API Request/Response Structures ---

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct SendEmailRequest {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl From<&OutboundMessage> for SendEmailRequest {
    fn from(message: &OutboundMessage) -> Self {
        Self {
            from: message.from.to_string(),
            to: message.to.clone(),
            subject: message.subject.clone(),
            html_body: message.body_html.clone(),
            metadata: message.metadata.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SendEmailResponse {
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Pulls `error.message` out of a JSON error body, falling back to the raw
/// body text.
fn api_error_message(body: String) -> String {
    serde_json::from_str::<ApiErrorBody>(&body)
        .map(|parsed| parsed.error.message)
        .unwrap_or(body)
}

// --- The Mail Client ---

/// Sends one [`OutboundMessage`] per call to the mail API.
#[derive(Clone, Debug)]
pub struct HttpMailClient {
    http: reqwest::Client,
    send_url: Url,
    api_key: Arc<str>,
    region: Arc<str>,
}

impl HttpMailClient {
    pub fn new(config: MailClientConfig) -> Result<Self, ClientError> {
        if config.api_key.trim().is_empty() {
            return MissingSettingSnafu { name: ENV_API_KEY }.fail();
        }
        if config.region.trim().is_empty() {
            return MissingSettingSnafu { name: ENV_REGION }.fail();
        }
        let send_url = config.send_url()?;

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10).min(config.timeout))
            .user_agent(config.user_agent.as_str());
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let http = builder.build()
            .context(BuildClientSnafu)?;

        info!(target: "mail_client", endpoint = %send_url, region = %config.region, "HttpMailClient initialized");
        debug!(target: "mail_client", client_config = ?config, "Full client configuration");

        Ok(Self {
            http,
            send_url,
            api_key: config.api_key.trim().into(),
            region: config.region.trim().into(),
        })
    }

    pub fn send_url(&self) -> &Url {
        &self.send_url
    }
}

impl Service<Arc<OutboundMessage>> for HttpMailClient {
    type Response = SendEmailResponse;
    type Error = ClientError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: Arc<OutboundMessage>) -> Self::Future {
        let payload = SendEmailRequest::from(message.as_ref());
        debug!(target: "mail_client", recipients = payload.to.len(), subject = %payload.subject, "Preparing send request");

        let request = self
            .http
            .post(self.send_url.clone())
            .bearer_auth(&self.api_key)
            .header(REGION_HEADER, &*self.region)
            .json(&payload);

        Box::pin(async move {
            let response = request.send().await.map_err(|source| {
                if source.is_timeout() {
                    warn!(target: "mail_client", error = %source, "Request timed out");
                    ClientError::Timeout { source }
                } else {
                    error!(target: "mail_client", error = %source, "Transport error");
                    ClientError::Transport { source }
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Could not read error body".to_string());

                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    warn!(target: "mail_client", %status, error_body = %body, "Server error or rate limited");
                } else {
                    error!(target: "mail_client", %status, error_body = %body, "Client error");
                }

                return ApiSnafu {
                    status: status.as_u16(),
                    message: api_error_message(body),
                }
                .fail();
            }

            response.json::<SendEmailResponse>().await.context(DecodeSnafu)
        })
    }
}
