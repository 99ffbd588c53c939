//! Source resolution.
//!
//! Maps a user-supplied source (local path, `file://` URI, or
//! `http(s)://` URL) to a local readable path. Remote sources are
//! fetched and staged as process-private files through the engine;
//! the resolver tracks those files and removes them on dispose, so
//! they survive an engine reset but not a server shutdown.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::Engine;

/// Errors raised while resolving a source.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Remote source loading is disabled. Enable it in the viewer settings to open http(s) sources.")]
    RemoteLoadingDisabled,

    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Failed to stage remote source: {0}")]
    Stage(String),
}

enum SourceKind {
    Local(PathBuf),
    Remote(Url),
}

fn classify(source: &str) -> SourceKind {
    match Url::parse(source) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => SourceKind::Remote(url),
        Ok(url) if url.scheme() == "file" => {
            let path = url
                .to_file_path()
                .unwrap_or_else(|_| PathBuf::from(source.trim_start_matches("file://")));
            SourceKind::Local(path)
        }
        // Anything else (plain paths, drive letters) is a local path.
        _ => SourceKind::Local(PathBuf::from(source)),
    }
}

/// Resolves sources to local paths, honoring the remote-loading policy.
pub struct SourceResolver {
    allow_remote: bool,
    client: reqwest::Client,
    staged: Mutex<Vec<PathBuf>>,
}

impl SourceResolver {
    pub fn new(allow_remote: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("gdxview/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            allow_remote,
            client,
            staged: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a source to a local readable path.
    ///
    /// Local paths and `file://` URIs never touch the disk; remote URLs
    /// are downloaded and staged through `engine.register_blob`, which
    /// appends a random suffix so concurrent opens of the same URL do
    /// not collide.
    pub async fn resolve(
        &self,
        source: &str,
        engine: &dyn Engine,
    ) -> Result<PathBuf, ResolveError> {
        match classify(source) {
            SourceKind::Local(path) => Ok(path),
            SourceKind::Remote(url) => {
                if !self.allow_remote {
                    return Err(ResolveError::RemoteLoadingDisabled);
                }
                self.fetch_remote(url, engine).await
            }
        }
    }

    async fn fetch_remote(&self, url: Url, engine: &dyn Engine) -> Result<PathBuf, ResolveError> {
        info!("Fetching remote source: {}", url);
        let fetch_err = |message: String| ResolveError::Fetch {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?
            .error_for_status()
            .map_err(|e| fetch_err(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("remote.gdx")
            .to_string();

        let path = engine
            .register_blob(&name, &bytes)
            .map_err(|e| ResolveError::Stage(e.to_string()))?;

        debug!("Staged {} bytes from {} at {}", bytes.len(), url, path.display());
        self.staged.lock().push(path.clone());
        Ok(path)
    }

    /// Paths of every staged remote file still tracked.
    pub fn staged_files(&self) -> Vec<PathBuf> {
        self.staged.lock().clone()
    }

    /// Remove all staged remote files. Called on server shutdown, never
    /// on an engine recovery reset.
    pub fn dispose(&self) {
        for path in self.staged.lock().drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed staged source {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged source {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StubController;

    #[tokio::test]
    async fn local_path_passes_through_untouched() {
        let resolver = SourceResolver::new(false);
        let stub = StubController::new();
        let path = resolver
            .resolve("/tmp/does-not-need-to-exist.gdx", stub.engine().as_ref())
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/tmp/does-not-need-to-exist.gdx"));
    }

    #[tokio::test]
    async fn file_uri_is_stripped_to_a_path() {
        let resolver = SourceResolver::new(false);
        let stub = StubController::new();
        let path = resolver
            .resolve("file:///tmp/transport.gdx", stub.engine().as_ref())
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/tmp/transport.gdx"));
    }

    #[tokio::test]
    async fn remote_source_rejected_when_disabled() {
        let resolver = SourceResolver::new(false);
        let stub = StubController::new();
        let err = resolver
            .resolve("https://example.com/y.gdx", stub.engine().as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::RemoteLoadingDisabled));
        assert!(err.to_string().starts_with("Remote source loading is disabled"));
        // Policy check happens before any I/O; nothing was staged.
        assert!(resolver.staged_files().is_empty());
    }

    #[test]
    fn classify_treats_unknown_schemes_as_local() {
        assert!(matches!(classify("relative/path.gdx"), SourceKind::Local(_)));
        assert!(matches!(classify("/abs/path.gdx"), SourceKind::Local(_)));
        assert!(matches!(
            classify("https://example.com/a.gdx"),
            SourceKind::Remote(_)
        ));
    }

    #[test]
    fn dispose_removes_tracked_files() {
        let resolver = SourceResolver::new(true);
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("staged.gdx");
        std::fs::write(&file, b"data").unwrap();
        resolver.staged.lock().push(file.clone());

        resolver.dispose();
        assert!(!file.exists());
        assert!(resolver.staged_files().is_empty());
    }
}
