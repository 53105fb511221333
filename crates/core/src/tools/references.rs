//! # References
//!
//! Reference lookup for generated worklets. Repository and academic sources
//! are queried concurrently; when the academic source comes back empty a
//! web search fills in. Results are ordered scholar, github, web.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::search::WebSearch;
use crate::llm::outputs::ReferenceKeywordResult;
use crate::llm::retry::RetryPolicy;

const GITHUB_SEARCH: &str = "https://api.github.com/search/repositories";

/// Maximum words kept from a reference description
pub const DESCRIPTION_WORDS: usize = 100;

/// Hits requested from the web fallback
pub const WEB_FALLBACK_RESULTS: usize = 10;

/// A reference attached to a worklet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub title: String,
    pub link: String,
    pub description: String,
    /// Where the reference came from (`github`, `scholar`, `web`)
    pub tag: String,
}

impl Reference {
    /// Text as it appears in the ranking prompt and is counted by the budgeter
    pub fn prompt_text(&self) -> String {
        format!("{} [{}] {}", self.title, self.tag, self.description)
    }
}

/// A provider that turns a search phrase into references
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn lookup(&self, keyword: &str) -> anyhow::Result<Vec<Reference>>;
}

/// Keep at most `limit` words
pub fn first_words(text: &str, limit: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= limit {
        text.to_string()
    } else {
        words[..limit].join(" ")
    }
}

/// Concurrent multi-provider reference lookup
pub struct ReferenceFinder {
    github: Option<Arc<dyn ReferenceSource>>,
    scholar: Option<Arc<dyn ReferenceSource>>,
    web: Option<Arc<dyn WebSearch>>,
}

impl Default for ReferenceFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceFinder {
    pub fn new() -> Self {
        Self {
            github: None,
            scholar: None,
            web: None,
        }
    }

    pub fn with_github(mut self, source: Arc<dyn ReferenceSource>) -> Self {
        self.github = Some(source);
        self
    }

    pub fn with_scholar(mut self, source: Arc<dyn ReferenceSource>) -> Self {
        self.scholar = Some(source);
        self
    }

    pub fn with_web_fallback(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.web = Some(search);
        self
    }

    /// Look up references for one worklet
    ///
    /// Provider errors propagate so the caller can degrade the whole worklet.
    pub async fn find(&self, keywords: &ReferenceKeywordResult) -> anyhow::Result<Vec<Reference>> {
        let github = async {
            match &self.github {
                Some(source) => source.lookup(&keywords.github_keyword).await,
                None => Ok(Vec::new()),
            }
        };
        let scholar = async {
            match &self.scholar {
                Some(source) => source.lookup(&keywords.google_scholar_keyword).await,
                None => Ok(Vec::new()),
            }
        };
        let (github, scholar) = tokio::join!(github, scholar);
        let (github, scholar) = (github?, scholar?);

        let mut web = Vec::new();
        if scholar.is_empty() {
            if let Some(search) = &self.web {
                if let Some(found) = search
                    .search(&keywords.google_scholar_keyword, WEB_FALLBACK_RESULTS)
                    .await
                {
                    web = found
                        .results
                        .into_iter()
                        .map(|hit| Reference {
                            title: hit.title,
                            link: hit.url,
                            description: hit.content,
                            tag: "web".to_string(),
                        })
                        .collect();
                }
            }
        }

        let mut references = scholar;
        references.extend(github);
        references.extend(web);
        Ok(references)
    }
}

#[derive(Deserialize)]
struct RepoSearch {
    #[serde(default)]
    items: Vec<Repo>,
}

#[derive(Deserialize)]
struct Repo {
    name: String,
    html_url: String,
    #[serde(default)]
    description: Option<String>,
}

/// GitHub repository search
#[derive(Debug, Clone)]
pub struct GithubReferences {
    client: reqwest::Client,
    token: Option<String>,
    per_page: usize,
    search_url: String,
    retry: RetryPolicy,
}

impl GithubReferences {
    pub fn new(token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("worklet-pipeline/0.1")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            token: token.filter(|t| !t.trim().is_empty()),
            per_page: 10,
            search_url: GITHUB_SEARCH.to_string(),
            retry: RetryPolicy::upstream(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_search_url(mut self, search_url: impl Into<String>) -> Self {
        self.search_url = search_url.into();
        self
    }

    /// Use `GITHUB_TOKEN` when set
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(std::env::var("GITHUB_TOKEN").ok())
    }

    async fn search_once(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request.send().await?.error_for_status()
    }
}

#[async_trait]
impl ReferenceSource for GithubReferences {
    async fn lookup(&self, keyword: &str) -> anyhow::Result<Vec<Reference>> {
        let url = format!(
            "{}?q={}&per_page={}",
            self.search_url,
            urlencoding::encode(keyword),
            self.per_page
        );

        // An error status after the last attempt degrades to no references;
        // a connection failure is returned to the caller
        let response = match self.retry.run("github search", |_| self.search_once(&url)).await {
            Ok(response) => response,
            Err(e) if e.status().is_some() => {
                tracing::warn!(keyword, "GitHub search failed: {}", e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let found: RepoSearch = response.json().await?;
        Ok(found
            .items
            .into_iter()
            .map(|repo| Reference {
                title: repo.name,
                link: repo.html_url,
                description: repo
                    .description
                    .map(|d| first_words(&d, DESCRIPTION_WORDS))
                    .unwrap_or_default(),
                tag: "github".to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::search::{SearchHit, SearchResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Fixed(Vec<Reference>);

    #[async_trait]
    impl ReferenceSource for Fixed {
        async fn lookup(&self, _keyword: &str) -> anyhow::Result<Vec<Reference>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl ReferenceSource for Broken {
        async fn lookup(&self, _keyword: &str) -> anyhow::Result<Vec<Reference>> {
            anyhow::bail!("provider unavailable")
        }
    }

    struct OneHit;

    #[async_trait]
    impl WebSearch for OneHit {
        async fn search(&self, query: &str, _max_results: usize) -> Option<SearchResult> {
            Some(SearchResult {
                query: query.to_string(),
                answer: None,
                results: vec![SearchHit {
                    title: "Paper".into(),
                    url: "https://w.example".into(),
                    content: "abstract".into(),
                }],
            })
        }
    }

    fn reference(title: &str, tag: &str) -> Reference {
        Reference {
            title: title.into(),
            link: format!("https://{title}.example"),
            description: String::new(),
            tag: tag.into(),
        }
    }

    fn keywords() -> ReferenceKeywordResult {
        ReferenceKeywordResult {
            google_scholar_keyword: "edge ocr".into(),
            github_keyword: "ocr rust".into(),
        }
    }

    #[tokio::test]
    async fn test_order_is_scholar_then_github() {
        let finder = ReferenceFinder::new()
            .with_github(Arc::new(Fixed(vec![reference("repo", "github")])))
            .with_scholar(Arc::new(Fixed(vec![reference("paper", "scholar")])))
            .with_web_fallback(Arc::new(OneHit));

        let refs = finder.find(&keywords()).await.unwrap();
        let tags: Vec<_> = refs.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["scholar", "github"]);
    }

    #[tokio::test]
    async fn test_web_fallback_when_scholar_empty() {
        let finder = ReferenceFinder::new()
            .with_github(Arc::new(Fixed(vec![reference("repo", "github")])))
            .with_scholar(Arc::new(Fixed(Vec::new())))
            .with_web_fallback(Arc::new(OneHit));

        let refs = finder.find(&keywords()).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].tag, "web");
        assert_eq!(refs[1].description, "abstract");
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let finder = ReferenceFinder::new().with_github(Arc::new(Broken));
        assert!(finder.find(&keywords()).await.is_err());
    }

    /// Local endpoint answering every request with 503
    async fn unavailable_endpoint(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/search/repositories")
    }

    #[tokio::test]
    async fn test_github_error_status_retried_by_policy() {
        let hits = Arc::new(AtomicUsize::new(0));
        let github = GithubReferences::new(None)
            .unwrap()
            .with_search_url(unavailable_endpoint(hits.clone()).await)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10)));

        let refs = github.lookup("edge ocr").await.unwrap();

        assert!(refs.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_first_words() {
        assert_eq!(first_words("a b c", 2), "a b");
        assert_eq!(first_words("a  b", 5), "a  b");
    }
}
