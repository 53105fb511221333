//! # Tools
//!
//! External collaborators of the pipeline and their default adapters:
//! - `search` - web search and link extraction (Tavily)
//! - `references` - reference providers (GitHub) and the concurrent finder
//! - `artifacts` - output sink (JSON files)
//! - `clusters` - built-in cluster terms

pub mod artifacts;
pub mod clusters;
pub mod references;
pub mod search;

pub use artifacts::{sanitize_filename, ArtifactSink, JsonArtifactSink};
pub use clusters::{cluster_terms, ClusterTerms};
pub use references::{GithubReferences, Reference, ReferenceFinder, ReferenceSource};
pub use search::{
    parallel_search, LinkData, LinkExtractor, SearchHit, SearchResult, TavilyClient, WebSearch,
};
