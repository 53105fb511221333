//! # Artifacts
//!
//! Final output of a workflow. Rendering (PDF, slides) and persistence live
//! behind [`ArtifactSink`]; the default sink writes plain JSON.
//!
//! ```text
//! {output_dir}/{session}/
//!   ├── worklets.json        all worklets, in order
//!   └── worklets/
//!       └── {title}.json     one file per worklet
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::EmitError;
use crate::pipeline::state::Worklet;

/// Receives the finished worklets of a session
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Persist the full set of worklets for a session
    async fn store(&self, session: &str, worklets: &[Worklet]) -> Result<(), EmitError>;

    /// Produce the file for one worklet, returning where it was written
    async fn emit(&self, session: &str, worklet: &Worklet) -> Result<PathBuf, EmitError>;
}

/// Replace characters that are not allowed in file names
pub fn sanitize_filename(name: &str) -> String {
    static UNSAFE: OnceLock<Option<Regex>> = OnceLock::new();
    match UNSAFE.get_or_init(|| Regex::new(r#"[\\/:*?"<>|]"#).ok()) {
        Some(re) => re.replace_all(name, "_").into_owned(),
        None => name.to_string(),
    }
}

/// Writes worklets as JSON under `{root}/{session}`
#[derive(Debug, Clone)]
pub struct JsonArtifactSink {
    root: PathBuf,
}

impl JsonArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session: &str) -> PathBuf {
        self.root.join(sanitize_filename(session))
    }

    fn file_stem(worklet: &Worklet) -> String {
        let stem = sanitize_filename(worklet.content.title.trim());
        if stem.is_empty() {
            format!("untitled_{}", &worklet.worklet_id.simple().to_string()[..8])
        } else {
            stem
        }
    }
}

async fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), EmitError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[async_trait]
impl ArtifactSink for JsonArtifactSink {
    async fn store(&self, session: &str, worklets: &[Worklet]) -> Result<(), EmitError> {
        let path = self.session_dir(session).join("worklets.json");
        write_json(&path, worklets).await
    }

    async fn emit(&self, session: &str, worklet: &Worklet) -> Result<PathBuf, EmitError> {
        let path = self
            .session_dir(session)
            .join("worklets")
            .join(format!("{}.json", Self::file_stem(worklet)));
        write_json(&path, worklet).await?;
        Ok(path)
    }
}
