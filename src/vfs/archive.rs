//! Whole-archive remote source
//!
//! Downloads a gzipped tarball of the repository at a revision (the way
//! code hosts such as `codeload.github.com` serve them) and unpacks it into
//! a [`Snapshot`]. Archives carry a single top-level directory
//! (`mux-0a192a19/...`) which is stripped.

use std::io::Read;

use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tar::Archive;

use super::{RemoteSource, Snapshot};
use crate::uri::WorkspaceRoot;

/// Default archive location, GitHub's tarball endpoint
pub const DEFAULT_URL_TEMPLATE: &str = "https://codeload.{host}/{repo}/tar.gz/{rev}";

/// Remote source backed by HTTP tarball downloads
pub struct ArchiveSource {
    client: reqwest::Client,
    url_template: String,
    token: Option<String>,
}

impl ArchiveSource {
    /// Create a source from a URL template
    ///
    /// The template may use `{host}`, `{repo}` (repository path without the
    /// leading `/`) and `{rev}`.
    pub fn new(url_template: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url_template: url_template.into(),
            token,
        }
    }

    /// Archive URL for a workspace root
    pub fn archive_url(&self, root: &WorkspaceRoot) -> String {
        let rev = if root.rev().is_empty() { "HEAD" } else { root.rev() };
        self.url_template
            .replace("{host}", root.host())
            .replace("{repo}", root.path().trim_start_matches('/'))
            .replace("{rev}", rev)
    }
}

impl Default for ArchiveSource {
    fn default() -> Self {
        Self::new(DEFAULT_URL_TEMPLATE, None)
    }
}

#[async_trait]
impl RemoteSource for ArchiveSource {
    async fn fetch_archive(&self, root: &WorkspaceRoot) -> anyhow::Result<Snapshot> {
        let url = self.archive_url(root);
        tracing::debug!("Downloading archive {}", url);

        let mut request = self.client.get(&url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("download of {} failed", url))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {} failed", url))?;
        tracing::debug!("Downloaded {} bytes from {}", bytes.len(), url);

        // tar/flate2 are synchronous
        tokio::task::spawn_blocking(move || unpack_tarball(&bytes))
            .await
            .context("archive extraction task failed")?
    }
}

/// Unpack a `.tar.gz` into a snapshot, stripping the top-level directory
pub fn unpack_tarball(bytes: &[u8]) -> anyhow::Result<Snapshot> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut snapshot = Snapshot::new();

    for entry in archive.entries().context("failed to read archive entries")? {
        let mut entry = entry.context("failed to read archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let relative: Vec<String> = entry
            .path()
            .context("invalid entry path")?
            .components()
            .skip(1)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if relative.is_empty() {
            continue;
        }
        let relative = relative.join("/");

        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .with_context(|| format!("failed to read {}", relative))?;
        snapshot.insert(&relative, contents);
    }

    Ok(snapshot)
}
