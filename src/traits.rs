use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Search API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to decode search response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("Failed to run clone: {0}")]
    Io(#[from] std::io::Error),
    #[error("Clone of {url} failed: {message}")]
    Failed { url: String, message: String },
    #[error("Clone timed out after {0:?}")]
    Timeout(Duration),
}

/// Result ordering requested from the search service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    BestMatch,
    Stars,
    Forks,
    Updated,
}

impl SortOrder {
    /// Value of the `sort` query parameter; best match is the service default.
    pub fn as_param(&self) -> Option<&'static str> {
        match self {
            SortOrder::BestMatch => None,
            SortOrder::Stars => Some("stars"),
            SortOrder::Forks => Some("forks"),
            SortOrder::Updated => Some("updated"),
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-match" | "best_match" | "" => Ok(SortOrder::BestMatch),
            "stars" => Ok(SortOrder::Stars),
            "forks" => Ok(SortOrder::Forks),
            "updated" => Ok(SortOrder::Updated),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub keyword: String,
    pub language: String,
    pub min_size_kb: u64,
    pub sort: SortOrder,
}

impl SearchQuery {
    /// Builds one query per (keyword, sort) pair, keywords outermost.
    pub fn matrix(
        keywords: &[String],
        sorts: &[SortOrder],
        language: &str,
        min_size_kb: u64,
    ) -> Vec<SearchQuery> {
        keywords
            .iter()
            .flat_map(|keyword| {
                sorts.iter().map(move |sort| SearchQuery {
                    keyword: keyword.clone(),
                    language: language.to_string(),
                    min_size_kb,
                    sort: *sort,
                })
            })
            .collect()
    }
}

/// Repository discovery service.
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Returns the service identifier used in logs (e.g., "github").
    fn source_id(&self) -> &str;

    /// Runs one search and returns the raw candidate entries, unvalidated.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, DiscoveryError>;
}

/// Version-control clone operation.
#[async_trait]
pub trait Cloner: Send + Sync {
    /// Materializes the full working tree of `url` at `dest`, or fails.
    ///
    /// `dest` does not exist when this is called.
    async fn clone_repository(&self, url: &str, dest: &Path) -> Result<(), CloneError>;
}

/// Runs every query in order and returns one candidate list per query.
///
/// Any failing query aborts discovery: a partial candidate set is never returned.
pub async fn discover_all<S>(
    source: &S,
    queries: &[SearchQuery],
) -> Result<Vec<Vec<Value>>, DiscoveryError>
where
    S: RepositorySource + ?Sized,
{
    let mut lists = Vec::with_capacity(queries.len());
    for query in queries {
        let items = source.search(query).await?;
        info!(
            source = source.source_id(),
            keyword = %query.keyword,
            sort = ?query.sort,
            candidates = items.len(),
            "Search completed"
        );
        lists.push(items);
    }
    Ok(lists)
}
