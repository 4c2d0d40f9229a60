//! Crawler coordinator - runs URIs through the processor chain
//!
//! This module is the minimal frontier around the fetch core, including:
//! - Grouping URIs into queues by class key
//! - Running queues concurrently, each one sequentially
//! - Accounting every attempt into server, host and group statistics
//! - Retrying once credentials were attached after a 401/407
//! - Retiring a queue when the quota gate asks for it

use crate::config::Config;
use crate::crawler::{FetchHttp, Frontier, ProcessorChain, QuotaEnforcer};
use crate::state::{CrawlUri, FetchStats, HasFetchStats, ServerCache};
use crate::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Attempts allowed for one URI: the first plus one per credential retry
const MAX_ATTEMPTS: u32 = 3;

/// Statistics holder for one queue
#[derive(Debug)]
pub struct QueueGroup {
    key: String,
    stats: FetchStats,
}

impl QueueGroup {
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

impl HasFetchStats for QueueGroup {
    fn substats(&self) -> &FetchStats {
        &self.stats
    }
}

/// Registry of queue groups, keyed by class key
#[derive(Debug, Default)]
pub struct QueueGroups {
    groups: DashMap<String, Arc<QueueGroup>>,
}

impl QueueGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<QueueGroup>> {
        self.groups.get(key).map(|g| Arc::clone(g.value()))
    }

    pub fn get_or_create(&self, key: &str) -> Arc<QueueGroup> {
        let group = self
            .groups
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(QueueGroup::new(key)));
        Arc::clone(group.value())
    }

    /// All groups, sorted by key
    pub fn groups(&self) -> Vec<Arc<QueueGroup>> {
        let mut groups: Vec<_> = self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        groups.sort_by(|a, b| a.key().cmp(b.key()));
        groups
    }
}

impl Frontier for QueueGroups {
    fn group_for(&self, curi: &CrawlUri) -> Option<Arc<dyn HasFetchStats>> {
        self.get(&curi.class_key)
            .map(|g| g as Arc<dyn HasFetchStats>)
    }
}

/// The final state of one URI
#[derive(Debug)]
pub struct CrawlOutcome {
    pub curi: CrawlUri,
    /// Number of passes through the chain
    pub attempts: u32,
    /// True when the URI's queue was retired before or by this URI
    pub retired: bool,
}

/// Everything a run produced, in input order
#[derive(Debug, Default)]
pub struct CrawlReport {
    pub outcomes: Vec<CrawlOutcome>,
    pub elapsed: Duration,
}

impl CrawlReport {
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.curi.is_success()).count()
    }

    pub fn retired(&self) -> impl Iterator<Item = &CrawlOutcome> {
        self.outcomes.iter().filter(|o| o.retired)
    }
}

/// Main coordinator structure
pub struct Coordinator {
    chain: ProcessorChain,
    servers: Arc<ServerCache>,
    groups: Arc<QueueGroups>,
    max_concurrent_queues: usize,
}

impl Coordinator {
    /// Creates a coordinator with the standard chain: quota gate, then fetch
    ///
    /// # Arguments
    ///
    /// * `config` - The full configuration
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to run
    /// * `Err(FetchError)` - The fetch engine could not be set up
    pub fn new(config: &Config) -> Result<Self> {
        let servers = Arc::new(ServerCache::new());
        let groups = Arc::new(QueueGroups::new());
        let quota = QuotaEnforcer::new(
            config.quota.clone(),
            Arc::clone(&servers),
            Arc::clone(&groups) as Arc<dyn Frontier>,
        );
        let fetcher = FetchHttp::new(config)?;
        let chain = ProcessorChain::new()
            .with(Arc::new(quota))
            .with(Arc::new(fetcher));

        Ok(Self::with_chain(
            chain,
            servers,
            groups,
            config.crawler.max_concurrent_queues,
        ))
    }

    /// Creates a coordinator around a caller-built chain
    ///
    /// `servers` and `groups` must be the ones the chain's processors read.
    pub fn with_chain(
        chain: ProcessorChain,
        servers: Arc<ServerCache>,
        groups: Arc<QueueGroups>,
        max_concurrent_queues: usize,
    ) -> Self {
        Self {
            chain,
            servers,
            groups,
            max_concurrent_queues: max_concurrent_queues.max(1),
        }
    }

    pub fn servers(&self) -> &Arc<ServerCache> {
        &self.servers
    }

    pub fn groups(&self) -> &Arc<QueueGroups> {
        &self.groups
    }

    /// Runs every URI through the chain
    ///
    /// URIs sharing a class key form one queue and are processed in order;
    /// at most `max_concurrent_queues` queues are in flight at once.
    pub async fn run(&self, uris: Vec<CrawlUri>) -> CrawlReport {
        let start_time = Instant::now();
        let total = uris.len();

        let mut order: Vec<String> = Vec::new();
        let mut queues: HashMap<String, Vec<(usize, CrawlUri)>> = HashMap::new();
        for (index, curi) in uris.into_iter().enumerate() {
            let key = curi.class_key.clone();
            if !queues.contains_key(&key) {
                order.push(key.clone());
            }
            queues.entry(key).or_default().push((index, curi));
        }
        tracing::info!("Starting run: {} URIs in {} queues", total, order.len());

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_queues));
        let mut tasks = JoinSet::new();
        for key in order {
            let Some(queue) = queues.remove(&key) else {
                continue;
            };
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let chain = self.chain.clone();
            let servers = Arc::clone(&self.servers);
            let group = self.groups.get_or_create(&key);
            tasks.spawn(async move {
                let _permit = permit;
                process_queue(queue, &chain, &servers, &group).await
            });
        }

        let mut indexed = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcomes) => indexed.extend(outcomes),
                Err(e) => tracing::error!("Queue task failed: {}", e),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);

        let report = CrawlReport {
            outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
            elapsed: start_time.elapsed(),
        };
        tracing::info!(
            "Run completed: {} URIs, {} successes, {} retired in {:?}",
            report.outcomes.len(),
            report.successes(),
            report.retired().count(),
            report.elapsed
        );
        report
    }
}

async fn process_queue(
    queue: Vec<(usize, CrawlUri)>,
    chain: &ProcessorChain,
    servers: &ServerCache,
    group: &QueueGroup,
) -> Vec<(usize, CrawlOutcome)> {
    let mut outcomes = Vec::with_capacity(queue.len());
    let mut retired = false;

    for (index, mut curi) in queue {
        if retired {
            tracing::debug!("{}: queue {} retired, not fetched", curi.uri, group.key());
            outcomes.push((
                index,
                CrawlOutcome {
                    curi,
                    attempts: 0,
                    retired: true,
                },
            ));
            continue;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            chain.process(&mut curi).await;
            tally(&curi, servers, group);

            let challenged = matches!(curi.fetch_status, 401 | 407) && !curi.credentials.is_empty();
            if !challenged || attempts >= MAX_ATTEMPTS || curi.force_retire {
                break;
            }
            tracing::debug!("{}: retrying with attached credentials", curi.uri);
        }

        if curi.force_retire {
            tracing::info!("Retiring queue {} at {}", group.key(), curi.uri);
            retired = true;
        }
        outcomes.push((
            index,
            CrawlOutcome {
                curi,
                attempts,
                retired,
            },
        ));
    }
    outcomes
}

/// Post-fetch accounting, once per attempt
fn tally(curi: &CrawlUri, servers: &ServerCache, group: &QueueGroup) {
    if curi.fetch_status <= 0 {
        return;
    }
    if let Some(server) = servers.get_or_create_server(&curi.uri) {
        server.substats().tally(curi);
    }
    if let Some(host) = servers.get_or_create_host(&curi.uri) {
        host.substats().tally(curi);
    }
    group.substats().tally(curi);
}
