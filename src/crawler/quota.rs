//! Quota gate
//!
//! Admission is decided from usage already accumulated in the server, host
//! and group statistics. The size of the attempt about to happen never
//! counts, and the gate never writes to the counters it reads.

use crate::config::QuotaConfig;
use crate::crawler::{Frontier, ProcessResult, Processor};
use crate::state::{status, CrawlUri, FetchStats, HasFetchStats, ServerCache};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// The three scopes a quota applies to, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaScope {
    Server,
    Host,
    Group,
}

impl QuotaScope {
    pub const ALL: [QuotaScope; 3] = [Self::Server, Self::Host, Self::Group];

    fn prefix(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Host => "host",
            Self::Group => "group",
        }
    }
}

/// The six metrics a quota can cap, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaMetric {
    FetchSuccesses,
    SuccessKb,
    FetchResponses,
    AllKb,
    NovelKb,
    NovelUrls,
}

impl QuotaMetric {
    pub const ALL: [QuotaMetric; 6] = [
        Self::FetchSuccesses,
        Self::SuccessKb,
        Self::FetchResponses,
        Self::AllKb,
        Self::NovelKb,
        Self::NovelUrls,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            Self::FetchSuccesses => "MaxFetchSuccesses",
            Self::SuccessKb => "MaxSuccessKb",
            Self::FetchResponses => "MaxFetchResponses",
            Self::AllKb => "MaxAllKb",
            Self::NovelKb => "MaxNovelKb",
            Self::NovelUrls => "MaxNovelUrls",
        }
    }

    /// Current value of this metric; byte metrics are in whole KB
    pub fn current(&self, stats: &FetchStats) -> u64 {
        match self {
            Self::FetchSuccesses => stats.fetch_successes(),
            Self::SuccessKb => stats.success_bytes() / 1024,
            Self::FetchResponses => stats.fetch_responses(),
            Self::AllKb => stats.total_bytes() / 1024,
            Self::NovelKb => stats.novel_bytes() / 1024,
            Self::NovelUrls => stats.novel_urls(),
        }
    }
}

/// Name of the setting for a scope and metric, e.g. `serverMaxFetchSuccesses`
pub fn setting_name(scope: QuotaScope, metric: QuotaMetric) -> String {
    format!("{}{}", scope.prefix(), metric.suffix())
}

/// Looks up the configured ceiling for a scope and metric
fn ceiling(quotas: &QuotaConfig, scope: QuotaScope, metric: QuotaMetric) -> i64 {
    use QuotaMetric::*;
    use QuotaScope::*;
    match (scope, metric) {
        (Server, FetchSuccesses) => quotas.server_max_fetch_successes,
        (Server, SuccessKb) => quotas.server_max_success_kb,
        (Server, FetchResponses) => quotas.server_max_fetch_responses,
        (Server, AllKb) => quotas.server_max_all_kb,
        (Server, NovelKb) => quotas.server_max_novel_kb,
        (Server, NovelUrls) => quotas.server_max_novel_urls,
        (Host, FetchSuccesses) => quotas.host_max_fetch_successes,
        (Host, SuccessKb) => quotas.host_max_success_kb,
        (Host, FetchResponses) => quotas.host_max_fetch_responses,
        (Host, AllKb) => quotas.host_max_all_kb,
        (Host, NovelKb) => quotas.host_max_novel_kb,
        (Host, NovelUrls) => quotas.host_max_novel_urls,
        (Group, FetchSuccesses) => quotas.group_max_fetch_successes,
        (Group, SuccessKb) => quotas.group_max_success_kb,
        (Group, FetchResponses) => quotas.group_max_fetch_responses,
        (Group, AllKb) => quotas.group_max_all_kb,
        (Group, NovelKb) => quotas.group_max_novel_kb,
        (Group, NovelUrls) => quotas.group_max_novel_urls,
    }
}

/// The first quota found exhausted for a URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaViolation {
    pub scope: QuotaScope,
    pub metric: QuotaMetric,
    pub limit: i64,
    pub current: u64,
}

impl QuotaViolation {
    /// The annotation recorded on a blocked URI, e.g. `Q:hostMaxAllKb`
    pub fn annotation(&self) -> String {
        format!("Q:{}", setting_name(self.scope, self.metric))
    }
}

impl fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reached ({} >= {})",
            setting_name(self.scope, self.metric),
            self.current,
            self.limit
        )
    }
}

/// Blocks or retires URIs whose server, host or group used up a quota
pub struct QuotaEnforcer {
    quotas: QuotaConfig,
    servers: Arc<ServerCache>,
    frontier: Arc<dyn Frontier>,
}

impl QuotaEnforcer {
    pub fn new(quotas: QuotaConfig, servers: Arc<ServerCache>, frontier: Arc<dyn Frontier>) -> Self {
        Self {
            quotas,
            servers,
            frontier,
        }
    }

    pub fn quotas(&self) -> &QuotaConfig {
        &self.quotas
    }

    fn holder(&self, scope: QuotaScope, curi: &CrawlUri) -> Option<Arc<dyn HasFetchStats>> {
        match scope {
            QuotaScope::Server => self
                .servers
                .server_for(&curi.uri)
                .map(|s| s as Arc<dyn HasFetchStats>),
            QuotaScope::Host => self
                .servers
                .host_for(&curi.uri)
                .map(|h| h as Arc<dyn HasFetchStats>),
            QuotaScope::Group => self.frontier.group_for(curi),
        }
    }

    /// Finds the first exhausted quota, server before host before group
    ///
    /// A scope that is not tracked yet cannot be over quota.
    pub fn check(&self, curi: &CrawlUri) -> Option<QuotaViolation> {
        for scope in QuotaScope::ALL {
            let Some(holder) = self.holder(scope, curi) else {
                continue;
            };
            let stats = holder.substats();
            for metric in QuotaMetric::ALL {
                let limit = ceiling(&self.quotas, scope, metric);
                if limit < 0 {
                    continue;
                }
                let current = metric.current(stats);
                if current >= limit as u64 {
                    return Some(QuotaViolation {
                        scope,
                        metric,
                        limit,
                        current,
                    });
                }
            }
        }
        None
    }

    /// Applies the quota gate to a URI
    ///
    /// On a violation the URI is annotated and the chain is finished. With
    /// force-retire the URI is flagged so the frontier retires its queue and
    /// its status stays untouched; otherwise its status becomes
    /// [`status::BLOCKED_BY_QUOTA`].
    pub fn enforce(&self, curi: &mut CrawlUri) -> ProcessResult {
        let Some(violation) = self.check(curi) else {
            return ProcessResult::Proceed;
        };

        curi.annotate(violation.annotation());
        if self.quotas.force_retire {
            tracing::info!("{}: {}, retiring queue {}", curi.uri, violation, curi.class_key);
            curi.force_retire = true;
        } else {
            tracing::info!("{}: {}, blocked", curi.uri, violation);
            curi.fetch_status = status::BLOCKED_BY_QUOTA;
        }
        ProcessResult::Finish
    }
}

#[async_trait]
impl Processor for QuotaEnforcer {
    fn name(&self) -> &str {
        "quota-enforcer"
    }

    async fn process(&self, curi: &mut CrawlUri) -> ProcessResult {
        self.enforce(curi)
    }
}
