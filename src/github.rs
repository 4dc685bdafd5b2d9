//! GitHub repository search.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::traits::{DiscoveryError, RepositorySource, SearchQuery};

const USER_AGENT: &str = concat!("repo-harvester/", env!("CARGO_PKG_VERSION"));

/// Results requested per query. Later pages are not fetched.
pub const PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total_count: u64,
    items: Vec<Value>,
}

/// [`RepositorySource`] backed by `GET /search/repositories`.
#[derive(Clone)]
pub struct GitHubSearch {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubSearch {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// The `q` parameter for one query.
    pub fn query_string(query: &SearchQuery) -> String {
        format!(
            "{} language:{} size:>={} is:public",
            query.keyword, query.language, query.min_size_kb
        )
    }
}

#[async_trait]
impl RepositorySource for GitHubSearch {
    fn source_id(&self) -> &str {
        "github"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, DiscoveryError> {
        let mut params = vec![
            ("q", Self::query_string(query)),
            ("per_page", PER_PAGE.to_string()),
        ];
        if let Some(sort) = query.sort.as_param() {
            params.push(("sort", sort.to_string()));
        }

        let mut request = self
            .http
            .get(format!("{}/search/repositories", self.api_url))
            .query(&params)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: SearchResponse =
            serde_json::from_slice(&body).map_err(|e| DiscoveryError::Decode(e.to_string()))?;
        debug!(
            total_count = parsed.total_count,
            returned = parsed.items.len(),
            "Search response decoded"
        );
        Ok(parsed.items)
    }
}
