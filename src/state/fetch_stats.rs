use crate::state::CrawlUri;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-scope fetch counters (a server, a host or a frontier group)
///
/// All counters only grow. [`record`](Self::record) bumps them in the order
/// responses, total bytes, successes, success bytes, novel URLs, novel bytes,
/// and [`snapshot`](Self::snapshot) reads them in exactly the reverse order,
/// so a reader never observes more successes than responses or more novel
/// URLs than successes.
#[derive(Debug, Default)]
pub struct FetchStats {
    fetch_successes: AtomicU64,
    success_bytes: AtomicU64,
    fetch_responses: AtomicU64,
    total_bytes: AtomicU64,
    novel_bytes: AtomicU64,
    novel_urls: AtomicU64,
}

/// A point-in-time copy of [`FetchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubstatsSnapshot {
    pub fetch_successes: u64,
    pub success_bytes: u64,
    pub fetch_responses: u64,
    pub total_bytes: u64,
    pub novel_bytes: u64,
    pub novel_urls: u64,
}

/// Anything that carries fetch counters
pub trait HasFetchStats: Send + Sync {
    fn substats(&self) -> &FetchStats;
}

impl FetchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch_successes(&self) -> u64 {
        self.fetch_successes.load(Ordering::SeqCst)
    }

    pub fn success_bytes(&self) -> u64 {
        self.success_bytes.load(Ordering::SeqCst)
    }

    pub fn fetch_responses(&self) -> u64 {
        self.fetch_responses.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub fn novel_bytes(&self) -> u64 {
        self.novel_bytes.load(Ordering::SeqCst)
    }

    pub fn novel_urls(&self) -> u64 {
        self.novel_urls.load(Ordering::SeqCst)
    }

    /// Records one completed attempt
    ///
    /// `success` implies a response; `novel` is only counted for successes.
    pub fn record(&self, bytes: u64, success: bool, novel: bool) {
        self.fetch_responses.fetch_add(1, Ordering::SeqCst);
        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
        if !success {
            return;
        }
        self.fetch_successes.fetch_add(1, Ordering::SeqCst);
        self.success_bytes.fetch_add(bytes, Ordering::SeqCst);
        if novel {
            self.novel_urls.fetch_add(1, Ordering::SeqCst);
            self.novel_bytes.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    /// Accounts for a finished fetch attempt
    ///
    /// Attempts that produced no HTTP response (unattempted, blocked,
    /// connect failures) leave the counters alone. Returns true if anything
    /// was counted.
    pub fn tally(&self, curi: &CrawlUri) -> bool {
        if curi.fetch_status <= 0 {
            return false;
        }
        let novel = curi.revisit_profile.is_none();
        self.record(curi.content_size, curi.is_success(), novel);
        true
    }

    pub fn snapshot(&self) -> SubstatsSnapshot {
        let novel_bytes = self.novel_bytes();
        let novel_urls = self.novel_urls();
        let success_bytes = self.success_bytes();
        let fetch_successes = self.fetch_successes();
        let total_bytes = self.total_bytes();
        let fetch_responses = self.fetch_responses();
        SubstatsSnapshot {
            fetch_successes,
            success_bytes,
            fetch_responses,
            total_bytes,
            novel_bytes,
            novel_urls,
        }
    }
}

impl HasFetchStats for FetchStats {
    fn substats(&self) -> &FetchStats {
        self
    }
}
