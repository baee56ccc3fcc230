//! Source API boundary: creator discovery and paginated post listings.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::SourceConfig;
use crate::download::{DownloadError, HttpClient, RateLimiter, parse_retry_after};

/// A creator to paginate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creator {
    /// Identifier used in API paths.
    pub id: String,
    /// Sanitized display name; also the creator directory name.
    pub name: String,
    /// Service key, e.g. `patreon`.
    pub service: String,
    /// Storage label of the service, e.g. `Patreon`.
    pub directory: String,
}

/// One file reference inside a post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileRef {
    /// Server-relative path, e.g. `/ab/cd/<hash>.png`.
    #[serde(default)]
    pub path: Option<String>,
}

/// A listing record: an optional primary file plus attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PostRecord {
    /// Primary file; sources send `{}` when there is none.
    #[serde(default)]
    pub file: Option<FileRef>,
    /// Additional files.
    #[serde(default)]
    pub attachments: Vec<FileRef>,
}

impl PostRecord {
    /// Non-empty file paths, primary file first.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.file
            .iter()
            .chain(self.attachments.iter())
            .filter_map(|file| file.path.as_deref())
            .filter(|path| !path.is_empty())
    }
}

/// A paginated content-hosting API.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Absolute download URL for a file path from a listing.
    fn file_url(&self, path: &str) -> String;

    /// Creators followed by the account, restricted to configured services.
    async fn favorites(&self) -> Result<Vec<Creator>, DownloadError>;

    /// One page of posts starting at `offset`.
    ///
    /// Records that do not parse are logged and left out.
    async fn posts(&self, creator: &Creator, offset: usize) -> Result<Vec<PostRecord>, DownloadError>;
}

/// [`SourceApi`] over HTTP with a session cookie.
#[derive(Debug, Clone)]
pub struct HttpSourceApi {
    client: HttpClient,
    config: SourceConfig,
    session: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl HttpSourceApi {
    /// Creates the API for `config`, authenticating with `session`.
    #[must_use]
    pub fn new(
        client: HttpClient,
        config: SourceConfig,
        session: Option<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        if session.is_none() {
            debug!(source = %config.name, "no session credential, requests are anonymous");
        }
        Self {
            client,
            config,
            session,
            limiter,
        }
    }

    /// Configured creators, with unknown services left out.
    #[must_use]
    pub fn configured_creators(&self) -> Vec<Creator> {
        self.config
            .creators
            .iter()
            .filter_map(|creator| {
                let name = creator.name.as_deref().unwrap_or(&creator.id);
                self.creator(&creator.id, name, &creator.service)
            })
            .collect()
    }

    fn creator(&self, id: &str, raw_name: &str, service: &str) -> Option<Creator> {
        let Some(directory) = self.config.directory(service) else {
            debug!(source = %self.config.name, service, id, "service not configured, skipping creator");
            return None;
        };
        Some(Creator {
            id: id.to_string(),
            name: display_name(raw_name, id),
            service: service.to_string(),
            directory: directory.to_string(),
        })
    }

    async fn get(&self, url: &str) -> Result<serde_json::Value, DownloadError> {
        self.limiter.acquire(url).await;
        let result = self.client.get_json(url, self.session.as_deref()).await;
        if let Err(DownloadError::HttpStatus {
            status: 429,
            retry_after,
            ..
        }) = &result
        {
            let delay = retry_after
                .as_deref()
                .and_then(parse_retry_after)
                .unwrap_or(self.limiter.spacing());
            self.limiter.record_rate_limit(url, delay);
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct FavoriteRecord {
    id: serde_json::Value,
    name: String,
    service: String,
}

#[async_trait]
impl SourceApi for HttpSourceApi {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn file_url(&self, path: &str) -> String {
        format!("{}{path}", self.config.file_url.trim_end_matches('/'))
    }

    #[instrument(skip(self), fields(source = %self.config.name))]
    async fn favorites(&self) -> Result<Vec<Creator>, DownloadError> {
        let url = format!(
            "{}/account/favorites?type=artist",
            self.config.base_url.trim_end_matches('/')
        );
        let value = self.get(&url).await?;
        let records = as_array(&url, value)?;

        let mut creators = Vec::new();
        for record in records {
            match serde_json::from_value::<FavoriteRecord>(record) {
                Ok(favorite) => {
                    let id = id_string(&favorite.id);
                    if let Some(creator) = self.creator(&id, &favorite.name, &favorite.service) {
                        creators.push(creator);
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed favorite"),
            }
        }
        debug!(count = creators.len(), "fetched favorites");
        Ok(creators)
    }

    #[instrument(skip(self, creator), fields(creator = %creator.name))]
    async fn posts(&self, creator: &Creator, offset: usize) -> Result<Vec<PostRecord>, DownloadError> {
        let url = format!(
            "{}/{}/user/{}/posts?o={offset}",
            self.config.base_url.trim_end_matches('/'),
            creator.service,
            urlencoding::encode(&creator.id),
        );
        let value = self.get(&url).await?;
        let records = as_array(&url, value)?;
        Ok(records
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<PostRecord>(record) {
                Ok(post) => Some(post),
                Err(e) => {
                    warn!(url, error = %e, "skipping malformed post record");
                    None
                }
            })
            .collect())
    }
}

fn as_array(url: &str, value: serde_json::Value) -> Result<Vec<serde_json::Value>, DownloadError> {
    match value {
        serde_json::Value::Array(records) => Ok(records),
        other => Err(DownloadError::decode(
            url,
            format!("expected a JSON array, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn id_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Title-cases `raw` and turns it into a single safe path segment.
///
/// Falls back to `fallback` when nothing printable remains.
#[must_use]
pub fn display_name(raw: &str, fallback: &str) -> String {
    let titled = title_case(raw);
    let cleaned: String = titled
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Uppercases the first letter of every run of letters, lowercasing the rest.
fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_word = false;
    for c in raw.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}
