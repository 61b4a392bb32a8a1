use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Manages the shared-directory layout used by both sides of the status
/// protocol.
///
/// All harness artifacts live under a single shared root (default `shared/`):
/// the worker's status mailbox, the monitor's mirror of the live display,
/// per-domain historical logs, and the dated archive tree. Components receive
/// this context at construction instead of reaching for fixed global paths,
/// so tests can point everything at a temporary directory.
#[derive(Debug, Clone)]
pub struct ObservabilityContext {
    root: PathBuf,
    domain: Option<String>,
}

impl ObservabilityContext {
    /// Create a context rooted at the given shared directory.
    pub fn new(root: impl Into<PathBuf>, domain: Option<String>) -> Self {
        Self {
            root: root.into(),
            domain,
        }
    }

    /// The shared root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition key for per-domain logs, if one was derived.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Path to the worker-owned status mailbox.
    pub fn mailbox_file(&self) -> PathBuf {
        self.root.join("worker_status.txt")
    }

    /// Path to the monitor's mirror of the last rendered display line.
    pub fn monitor_file(&self) -> PathBuf {
        self.root.join("monitor_status.txt")
    }

    /// Fallback diagnostic file used when the primary status or log paths
    /// cannot be written.
    pub fn fallback_file(&self) -> PathBuf {
        self.root.join("fallback_status.txt")
    }

    /// Directory holding the append-only historical logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Directory holding dated archive snapshots.
    pub fn archive_dir(&self) -> PathBuf {
        self.logs_dir().join("archive")
    }

    /// Create the root, logs, and archive directories.
    pub fn init(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.archive_dir())?;
        Ok(())
    }
}

/// Derive a filesystem-safe partition key from a target URL or hostname.
///
/// Strips the scheme and a leading `www.`, keeps only the host portion, and
/// replaces dots with underscores: `https://www.example.com/page` becomes
/// `example_com`.
pub fn normalize_domain(url: &str) -> String {
    static SCHEME: OnceLock<Regex> = OnceLock::new();
    let scheme = SCHEME.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").unwrap());

    let stripped = scheme.replace(url, "");
    let stripped = stripped.strip_prefix("www.").unwrap_or(&stripped);
    let host = stripped.split('/').next().unwrap_or(stripped);
    host.replace('.', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_domain_full_url() {
        assert_eq!(normalize_domain("https://www.example.com/page"), "example_com");
    }

    #[test]
    fn test_normalize_domain_bare_host() {
        assert_eq!(normalize_domain("news.ycombinator.com"), "news_ycombinator_com");
    }

    #[test]
    fn test_normalize_domain_http_no_www() {
        assert_eq!(normalize_domain("http://docs.rs/regex"), "docs_rs");
    }

    #[test]
    fn test_init_creates_layout() {
        let dir = tempdir().unwrap();
        let ctx = ObservabilityContext::new(dir.path().join("shared"), Some("example_com".into()));
        ctx.init().unwrap();

        assert!(ctx.root().is_dir());
        assert!(ctx.logs_dir().is_dir());
        assert!(ctx.archive_dir().is_dir());
        assert_eq!(ctx.domain(), Some("example_com"));
    }

    #[test]
    fn test_paths_live_under_root() {
        let ctx = ObservabilityContext::new("/tmp/shared", None);
        assert_eq!(ctx.mailbox_file(), PathBuf::from("/tmp/shared/worker_status.txt"));
        assert_eq!(ctx.monitor_file(), PathBuf::from("/tmp/shared/monitor_status.txt"));
        assert!(ctx.archive_dir().starts_with(ctx.logs_dir()));
    }
}
