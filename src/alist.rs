//! Alist link signing.
//!
//! Alist serves files behind short-lived signed URLs. Stored records only keep
//! the Alist path (or a plain URL on the Alist host), and every read asks the
//! Alist API for a fresh `raw_url`. Nothing in here ever fails: when signing is
//! impossible the best-known path is handed back as a degraded [`Resolution`].

use std::{fmt, time::Duration};

use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use url::Url;

pub const DEFAULT_ALIST_API_URL: &str = "https://drive.movieway.site";
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_HOST_MARKER: &str = "alist";
const SIGN_ENDPOINT: &str = "/api/fs/get";

/// Everything the resolver needs, injected at construction.
#[derive(Debug, Clone)]
pub struct AlistConfig {
    pub api_url: String,
    /// Absent token is a supported state: paths are returned unsigned.
    pub token: Option<String>,
    /// Substrings that mark a URL as living on the Alist host.
    pub host_markers: Vec<String>,
    pub timeout: Duration,
}

impl AlistConfig {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_owned();
        let host_markers = default_host_markers(&api_url);
        Self {
            api_url,
            token: token.filter(|value| !value.is_empty()),
            host_markers,
            timeout: DEFAULT_SIGN_TIMEOUT,
        }
    }

    pub fn with_host_markers(mut self, markers: Vec<String>) -> Self {
        self.host_markers = markers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn sign_url(&self) -> String {
        format!("{}{SIGN_ENDPOINT}", self.api_url)
    }
}

/// The host of the API URL plus the generic `alist` marker.
pub fn default_host_markers(api_url: &str) -> Vec<String> {
    let mut markers = Vec::new();
    if let Some(host) = Url::parse(api_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
    {
        markers.push(host);
    }
    if !markers.iter().any(|marker| marker == FALLBACK_HOST_MARKER) {
        markers.push(FALLBACK_HOST_MARKER.to_owned());
    }
    markers
}

/// How a stored link reference is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// Absolute URL on the Alist host; carries the decoded path.
    AlistUrl(String),
    /// Looked like an Alist URL but did not parse.
    MalformedAlistUrl,
    /// Any other absolute URL, already directly fetchable.
    External,
    /// Root-relative path understood by Alist; carries the decoded path.
    AlistPath(String),
}

impl LinkKind {
    /// Marker matching is a plain substring test, so a foreign URL that happens
    /// to contain a marker is treated as an Alist URL.
    pub fn classify(input: &str, host_markers: &[String]) -> Self {
        if host_markers
            .iter()
            .any(|marker| !marker.is_empty() && input.contains(marker.as_str()))
        {
            return match Url::parse(input) {
                Ok(url) => LinkKind::AlistUrl(decode_path(url.path())),
                Err(_) => LinkKind::MalformedAlistUrl,
            };
        }

        if input.starts_with("http://") || input.starts_with("https://") {
            return LinkKind::External;
        }

        LinkKind::AlistPath(decode_path(input))
    }
}

/// Percent-decodes a path, keeping the raw text when the bytes are not UTF-8.
pub fn decode_path(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_owned())
}

/// Why a link could not be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degradation {
    MalformedUrl,
    MissingToken,
    Status(u16),
    Transport(String),
    MissingRawUrl,
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::MalformedUrl => f.write_str("link looks like an Alist URL but does not parse"),
            Degradation::MissingToken => f.write_str("ALIST_TOKEN is not configured"),
            Degradation::Status(code) => write!(f, "Alist API answered with status {code}"),
            Degradation::Transport(detail) => write!(f, "Alist API request failed: {detail}"),
            Degradation::MissingRawUrl => f.write_str("Alist API response has no raw_url"),
        }
    }
}

/// Outcome of resolving one link. Every variant carries a usable string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Signed(String),
    Passthrough(String),
    Degraded { link: String, reason: Degradation },
}

impl Resolution {
    pub fn link(&self) -> &str {
        match self {
            Resolution::Signed(link) | Resolution::Passthrough(link) => link,
            Resolution::Degraded { link, .. } => link,
        }
    }

    pub fn into_link(self) -> String {
        match self {
            Resolution::Signed(link) | Resolution::Passthrough(link) => link,
            Resolution::Degraded { link, .. } => link,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Resolution::Degraded { .. })
    }
}

#[derive(Serialize)]
struct SignRequest<'a> {
    path: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct SignResponse {
    data: Option<SignData>,
}

#[derive(Deserialize)]
struct SignData {
    raw_url: Option<String>,
}

/// Resolves stored link references into fetchable URLs.
#[derive(Debug, Clone)]
pub struct AlistResolver {
    config: AlistConfig,
    client: reqwest::Client,
}

impl AlistResolver {
    pub fn new(config: AlistConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mlwio-catalog/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .context("building Alist HTTP client")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &AlistConfig {
        &self.config
    }

    pub fn classify(&self, input: &str) -> LinkKind {
        LinkKind::classify(input, &self.config.host_markers)
    }

    pub async fn resolve(&self, input: &str) -> Resolution {
        let path = match self.classify(input) {
            LinkKind::External => {
                debug!(link = input, "external link, passing through");
                return Resolution::Passthrough(input.to_owned());
            }
            LinkKind::MalformedAlistUrl => {
                error!(link = input, "could not parse Alist URL");
                return Resolution::Degraded {
                    link: input.to_owned(),
                    reason: Degradation::MalformedUrl,
                };
            }
            LinkKind::AlistUrl(path) => {
                debug!(link = input, %path, "extracted Alist path from URL");
                path
            }
            LinkKind::AlistPath(path) => path,
        };

        let Some(token) = self.config.token.as_deref() else {
            warn!(%path, "ALIST_TOKEN not configured, returning unsigned path");
            return Resolution::Degraded {
                link: path,
                reason: Degradation::MissingToken,
            };
        };

        match self.sign(token, &path).await {
            Ok(raw_url) => {
                debug!(%path, "Alist signed link generated");
                Resolution::Signed(raw_url)
            }
            Err(reason) => Resolution::Degraded { link: path, reason },
        }
    }

    async fn sign(&self, token: &str, path: &str) -> Result<String, Degradation> {
        let response = self
            .client
            .post(self.config.sign_url())
            .header(reqwest::header::AUTHORIZATION, token)
            .json(&SignRequest { path, password: "" })
            .send()
            .await
            .map_err(|err| {
                error!(%path, error = %err, "Alist API request failed");
                Degradation::Transport(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(%path, status = status.as_u16(), "Alist API error");
            return Err(Degradation::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(|err| {
            error!(%path, error = %err, "reading Alist API response failed");
            Degradation::Transport(err.to_string())
        })?;

        match serde_json::from_str::<SignResponse>(&body)
            .ok()
            .and_then(|parsed| parsed.data)
            .and_then(|data| data.raw_url)
            .filter(|raw_url| !raw_url.is_empty())
        {
            Some(raw_url) => Ok(raw_url),
            None => {
                warn!(%path, response = %body, "no raw_url in Alist response");
                Err(Degradation::MissingRawUrl)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SigningBehaviour, spawn_signing_server};

    fn markers() -> Vec<String> {
        default_host_markers(DEFAULT_ALIST_API_URL)
    }

    fn unconfigured() -> AlistResolver {
        AlistResolver::new(AlistConfig::new(DEFAULT_ALIST_API_URL, None)).unwrap()
    }

    #[test]
    fn default_markers_include_host_and_fallback() {
        assert_eq!(markers(), vec!["drive.movieway.site", "alist"]);
        assert_eq!(default_host_markers("not a url"), vec!["alist"]);
    }

    #[test]
    fn classify_extracts_decoded_path_from_alist_urls() {
        assert_eq!(
            LinkKind::classify(
                "https://drive.movieway.site/GD01/MOVIE/Spider%20Man%201.mp4?sign=abc",
                &markers()
            ),
            LinkKind::AlistUrl("/GD01/MOVIE/Spider Man 1.mp4".to_owned())
        );
    }

    #[test]
    fn classify_recognises_external_and_relative_links() {
        assert_eq!(
            LinkKind::classify("https://drive.google.com/uc?export=download&id=X", &markers()),
            LinkKind::External
        );
        assert_eq!(
            LinkKind::classify("/GD01/MOVIE/Spider%20Man%201.mp4", &markers()),
            LinkKind::AlistPath("/GD01/MOVIE/Spider Man 1.mp4".to_owned())
        );
    }

    #[test]
    fn classify_flags_unparseable_marker_urls() {
        assert_eq!(
            LinkKind::classify("/alist/movie.mp4", &markers()),
            LinkKind::MalformedAlistUrl
        );
    }

    #[test]
    fn decode_path_keeps_invalid_utf8_raw() {
        assert_eq!(decode_path("/a/%FF.mp4"), "/a/%FF.mp4");
    }

    #[tokio::test]
    async fn missing_token_returns_decoded_path() {
        let resolution = unconfigured().resolve("/GD01/a%20b.mp4").await;
        assert_eq!(
            resolution,
            Resolution::Degraded {
                link: "/GD01/a b.mp4".to_owned(),
                reason: Degradation::MissingToken,
            }
        );
    }

    #[tokio::test]
    async fn missing_token_does_not_call_the_api() {
        let server = spawn_signing_server(SigningBehaviour::Sign).await;
        let config = AlistConfig::new(server.base_url.clone(), None);
        let resolver = AlistResolver::new(config).unwrap();
        let resolution = resolver.resolve("/GD01/a.mp4").await;
        assert_eq!(resolution.link(), "/GD01/a.mp4");
        assert_eq!(server.hits(), 0);
    }

    #[tokio::test]
    async fn external_links_pass_through_with_token_configured() {
        let server = spawn_signing_server(SigningBehaviour::Sign).await;
        let resolver = server.resolver();
        let input = "https://cdn.example.com/videos/clip.mp4";
        assert_eq!(
            resolver.resolve(input).await,
            Resolution::Passthrough(input.to_owned())
        );
        assert_eq!(server.hits(), 0);
    }

    #[tokio::test]
    async fn signed_link_is_returned_on_success() {
        let server = spawn_signing_server(SigningBehaviour::Fixed("https://x/y")).await;
        let resolution = server.resolver().resolve("/GD01/a.mp4").await;
        assert_eq!(resolution, Resolution::Signed("https://x/y".to_owned()));
        assert_eq!(server.hits(), 1);
        assert_eq!(server.last_authorization().as_deref(), Some("test-token"));
        assert_eq!(server.paths(), vec!["/GD01/a.mp4".to_owned()]);
    }

    #[tokio::test]
    async fn host_urls_are_signed_by_path() {
        let server = spawn_signing_server(SigningBehaviour::Sign).await;
        let resolver = server.resolver();
        let input = format!("{}/GD01/Some%20Show/e1.mp4", server.base_url);
        let resolution = resolver.resolve(&input).await;
        assert_eq!(server.paths(), vec!["/GD01/Some Show/e1.mp4".to_owned()]);
        assert!(matches!(resolution, Resolution::Signed(_)));
    }

    #[tokio::test]
    async fn error_status_degrades_to_path() {
        let server = spawn_signing_server(SigningBehaviour::Status(500)).await;
        let resolution = server.resolver().resolve("/GD01/a%20b.mp4").await;
        assert_eq!(
            resolution,
            Resolution::Degraded {
                link: "/GD01/a b.mp4".to_owned(),
                reason: Degradation::Status(500),
            }
        );
    }

    #[tokio::test]
    async fn missing_raw_url_degrades_to_path() {
        let server = spawn_signing_server(SigningBehaviour::NoRawUrl).await;
        let resolution = server.resolver().resolve("/GD01/a.mp4").await;
        assert_eq!(
            resolution,
            Resolution::Degraded {
                link: "/GD01/a.mp4".to_owned(),
                reason: Degradation::MissingRawUrl,
            }
        );
    }

    #[tokio::test]
    async fn unreachable_api_degrades_to_path() {
        // Port 9 (discard) on loopback is not expected to accept connections.
        let config = AlistConfig::new("http://127.0.0.1:9", Some("token".to_owned()))
            .with_timeout(Duration::from_secs(2));
        let resolver = AlistResolver::new(config).unwrap();
        let resolution = resolver.resolve("/GD01/a.mp4").await;
        assert_eq!(resolution.link(), "/GD01/a.mp4");
        assert!(matches!(
            resolution,
            Resolution::Degraded {
                reason: Degradation::Transport(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn hung_api_times_out_to_decoded_path() {
        let server = spawn_signing_server(SigningBehaviour::Hang(Duration::from_secs(30))).await;
        let timeout = Duration::from_millis(300);
        let resolver = AlistResolver::new(server.config().with_timeout(timeout)).unwrap();

        let started = std::time::Instant::now();
        let resolution = resolver.resolve("/GD01/Slow%20Movie.mp4").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(resolution.link(), "/GD01/Slow Movie.mp4");
        assert!(matches!(
            resolution,
            Resolution::Degraded {
                reason: Degradation::Transport(_),
                ..
            }
        ));
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn malformed_marker_url_is_returned_unchanged() {
        let server = spawn_signing_server(SigningBehaviour::Sign).await;
        let resolution = server.resolver().resolve("/alist/movie.mp4").await;
        assert_eq!(resolution.link(), "/alist/movie.mp4");
        assert!(resolution.is_degraded());
        assert_eq!(server.hits(), 0);
    }
}
