use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{
    StatusCode,
    blocking::{Client, Response},
    header::{ACCEPT, HeaderMap},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ApiConfig;

const USER_AGENT_HEADER: &str = "pr-dashboard/0.1";
const SCOPES_HEADER: &str = "x-oauth-scopes";
const TOKEN_EXPIRY_HEADER: &str = "github-authentication-token-expiration";

/// Blocking GitHub API client. Requests are issued from background workers,
/// never from the UI thread.
pub struct GitHubClient {
    http: Client,
    graphql_url: String,
    root_url: String,
}

impl GitHubClient {
    pub fn new(api: &ApiConfig) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent(USER_AGENT_HEADER)
            .build()
            .map_err(FetchError::Http)?;
        Ok(Self {
            http,
            graphql_url: api.graphql_url(),
            root_url: api.root_url(),
        })
    }

    /// Runs a GraphQL query and decodes its `data` payload into `T`.
    ///
    /// A non-success status yields [`FetchError::Transport`]; an `errors`
    /// field in the envelope yields [`FetchError::GraphQl`] even when partial
    /// data came back with it.
    pub fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        credential: &str,
        variables: Value,
    ) -> Result<T, FetchError> {
        if credential.is_empty() {
            return Err(FetchError::MissingToken);
        }

        let response = self
            .http
            .post(&self.graphql_url)
            .header(ACCEPT, "application/json")
            .bearer_auth(credential)
            .json(&json!({ "query": query, "variables": variables }))
            .send()?;

        let response = ensure_success(response)?;
        log_token_expiry(response.headers());
        let body = response.text()?;
        decode_envelope(&body)
    }

    /// Lists the OAuth scopes GitHub reports for `credential`.
    pub fn check_credential_scopes(&self, credential: &str) -> Result<Vec<String>, FetchError> {
        if credential.is_empty() {
            return Err(FetchError::MissingToken);
        }

        let response = self
            .http
            .get(&self.root_url)
            .header(ACCEPT, "application/json")
            .bearer_auth(credential)
            .send()?;

        let response = ensure_success(response)?;
        let scopes = response
            .headers()
            .get(SCOPES_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(parse_scopes)
            .unwrap_or_default();
        debug!(?scopes, "credential scopes checked");
        Ok(scopes)
    }
}

fn ensure_success(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(FetchError::Transport {
        status: status.as_u16(),
        body,
    })
}

fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T, FetchError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    if let Some(errors) = envelope.errors {
        return Err(FetchError::GraphQl { errors });
    }
    Ok(serde_json::from_value(envelope.data.unwrap_or(Value::Null))?)
}

fn parse_scopes(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|scope| !scope.is_empty())
        .map(str::to_owned)
        .collect()
}

fn log_token_expiry(headers: &HeaderMap) {
    let Some(raw) = headers.get(TOKEN_EXPIRY_HEADER) else {
        return;
    };
    let parsed = raw.to_str().ok().and_then(parse_token_expiry);
    match parsed {
        Some(expires_at) => debug!(%expires_at, "access token expiry reported"),
        None => warn!(header = ?raw, "could not parse token expiration header"),
    }
}

// GitHub sends e.g. `2024-03-01 12:00:00 UTC`.
fn parse_token_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = trimmed.strip_suffix("UTC").unwrap_or(trimmed).trim_end();
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|value| value.and_utc())
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("GitHub API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub responded with HTTP status {status}")]
    Transport { status: u16, body: String },
    #[error("GitHub reported errors: {}", summarize(.errors))]
    GraphQl { errors: Vec<GraphQlError> },
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error("Failed to decode GitHub response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("No personal access token is configured")]
    MissingToken,
    #[error("Background worker disconnected before returning a result")]
    BackgroundWorkerGone,
}

impl FetchError {
    /// True when GitHub rejected the credential itself.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FetchError::Transport { status, .. } if *status == StatusCode::UNAUTHORIZED.as_u16())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("The organisation {login} could not be found.")]
    Organisation { login: String },
    #[error("The team {slug} could not be found in {organisation}.")]
    Team { organisation: String, slug: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub path: Vec<Value>,
}

fn summarize(errors: &[GraphQlError]) -> String {
    if errors.is_empty() {
        return "unspecified error".to_owned();
    }
    errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

// Response payloads ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::runtime::Runtime;
    use wiremock::MockServer;

    use super::GitHubClient;
    use crate::config::ApiConfig;

    /// Mock GitHub server plus a blocking client pointed at it. The runtime
    /// drives mock registration; requests go out from the test thread.
    pub struct MockGitHub {
        pub client: GitHubClient,
        pub server: MockServer,
        pub runtime: Runtime,
    }

    impl MockGitHub {
        pub fn start() -> Self {
            let runtime = Runtime::new().expect("runtime should start");
            let server = runtime.block_on(MockServer::start());
            let client =
                GitHubClient::new(&ApiConfig::new(server.uri())).expect("client should build");
            Self {
                client,
                server,
                runtime,
            }
        }

        pub fn mount(&self, mock: wiremock::Mock) {
            self.runtime.block_on(mock.mount(&self.server));
        }
    }
}
