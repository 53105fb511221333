//! Known topic clusters and the terms they contribute to keyword approval.

/// Keywords and domains a cluster always contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTerms {
    pub id: &'static str,
    pub keywords: &'static [&'static str],
    pub domains: &'static [&'static str],
}

const CLUSTERS: &[ClusterTerms] = &[
    ClusterTerms {
        id: "ai",
        keywords: &["genai", "rag"],
        domains: &["artificial intelligence", "machine learning"],
    },
    ClusterTerms {
        id: "web_search",
        keywords: &["serpapi", "google", "bing", "search"],
        domains: &["search engines", "web search"],
    },
    ClusterTerms {
        id: "vision",
        keywords: &["gemma", "image parsing", "vision model", "ocr"],
        domains: &["computer vision", "image analysis"],
    },
];

const ALIASES: &[(&str, &str)] = &[
    ("ai domain", "ai"),
    ("ai", "ai"),
    ("artificial intelligence", "ai"),
    ("web search", "web_search"),
    ("search", "web_search"),
    ("search engines", "web_search"),
    ("vision", "vision"),
    ("image parsing", "vision"),
];

/// Look up a cluster by alias or canonical id, ignoring case and surrounding whitespace
pub fn cluster_terms(name: &str) -> Option<&'static ClusterTerms> {
    let name = name.trim().to_lowercase();
    let id = ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, id)| *id)
        .unwrap_or(name.as_str());

    CLUSTERS.iter().find(|cluster| cluster.id == id)
}
