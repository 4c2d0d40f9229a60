use crate::state::{FetchStats, HasFetchStats};
use crate::url::{extract_domain, server_key};
use dashmap::DashMap;
use std::sync::Arc;
use url::Url;

/// Statistics holder for one `host:port`
#[derive(Debug)]
pub struct CrawlServer {
    key: String,
    stats: FetchStats,
}

impl CrawlServer {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            stats: FetchStats::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl HasFetchStats for CrawlServer {
    fn substats(&self) -> &FetchStats {
        &self.stats
    }
}

/// Statistics holder for one host name, across all ports
#[derive(Debug)]
pub struct CrawlHost {
    name: String,
    stats: FetchStats,
}

impl CrawlHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats: FetchStats::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl HasFetchStats for CrawlHost {
    fn substats(&self) -> &FetchStats {
        &self.stats
    }
}

/// Registry of server and host statistics holders
///
/// Holders are created lazily the first time the frontier accounts for a
/// fetch on them, and live for the rest of the crawl. Lookups never create.
#[derive(Debug, Default)]
pub struct ServerCache {
    servers: DashMap<String, Arc<CrawlServer>>,
    hosts: DashMap<String, Arc<CrawlHost>>,
}

impl ServerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the server holder for a URL without creating it
    pub fn server_for(&self, url: &Url) -> Option<Arc<CrawlServer>> {
        let key = server_key(url)?;
        self.servers.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Looks up the host holder for a URL without creating it
    pub fn host_for(&self, url: &Url) -> Option<Arc<CrawlHost>> {
        let name = extract_domain(url)?;
        self.hosts.get(&name).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the server holder for a URL, creating it on first use
    pub fn get_or_create_server(&self, url: &Url) -> Option<Arc<CrawlServer>> {
        let key = server_key(url)?;
        let server = self
            .servers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CrawlServer::new(key)));
        Some(Arc::clone(server.value()))
    }

    /// Returns the host holder for a URL, creating it on first use
    pub fn get_or_create_host(&self, url: &Url) -> Option<Arc<CrawlHost>> {
        let name = extract_domain(url)?;
        let host = self
            .hosts
            .entry(name.clone())
            .or_insert_with(|| Arc::new(CrawlHost::new(name)));
        Some(Arc::clone(host.value()))
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// All known servers, sorted by key
    pub fn servers(&self) -> Vec<Arc<CrawlServer>> {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        servers.sort_by(|a, b| a.key().cmp(b.key()));
        servers
    }
}
