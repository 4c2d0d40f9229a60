//! Crawler module: the per-URI processor chain
//!
//! This module contains the fetch-time pipeline, including:
//! - The `Processor` seam and the ordered `ProcessorChain`
//! - The quota gate (`QuotaEnforcer`)
//! - The wire-level HTTP engine (`FetchHttp`)
//! - The queue worker pool (`Coordinator`)

mod coordinator;
mod fetcher;
mod quota;

pub use coordinator::{Coordinator, CrawlOutcome, CrawlReport, QueueGroup, QueueGroups};
pub use fetcher::{
    basic_authorization, digest_response, form_body, parse_challenges, FetchBodyRule, FetchHttp,
    FetchHttpBuilder, ANNOTATION_UNSATISFIABLE_CHARSET, DEFAULT_ACCEPT,
};
pub use quota::{setting_name, QuotaEnforcer, QuotaMetric, QuotaScope, QuotaViolation};

use crate::state::{CrawlUri, HasFetchStats};
use async_trait::async_trait;
use std::sync::Arc;

/// What the chain does after a processor ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Continue with the next processor
    Proceed,
    /// Skip the remaining processors for this URI
    Finish,
}

/// One stage of the per-URI pipeline
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Returns false to skip this processor for the URI
    fn should_process(&self, _curi: &CrawlUri) -> bool {
        true
    }

    async fn process(&self, curi: &mut CrawlUri) -> ProcessResult;
}

/// Read-only view the processors need of the frontier
pub trait Frontier: Send + Sync {
    /// Statistics holder of the queue group the URI belongs to
    fn group_for(&self, curi: &CrawlUri) -> Option<Arc<dyn HasFetchStats>>;
}

/// An ordered list of processors applied to each URI
#[derive(Clone, Default)]
pub struct ProcessorChain {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn push(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Runs every applicable processor in order until one finishes the URI
    pub async fn process(&self, curi: &mut CrawlUri) -> ProcessResult {
        for processor in &self.processors {
            if !processor.should_process(curi) {
                tracing::trace!("{} skipped for {}", processor.name(), curi.uri);
                continue;
            }
            if processor.process(curi).await == ProcessResult::Finish {
                tracing::debug!("{} finished {}", processor.name(), curi.uri);
                return ProcessResult::Finish;
            }
        }
        ProcessResult::Proceed
    }
}

impl std::fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.processors.iter().map(|p| p.name()))
            .finish()
    }
}
