//! State module for crawl work items and fetch statistics
//!
//! # Components
//!
//! - `CrawlUri`: one work item, mutated in place by the processor chain
//! - `FetchStats`: monotonic per-scope counters read by the quota gate
//! - `ServerCache`: registry of server and host statistics holders

mod crawl_uri;
mod fetch_stats;
mod server_cache;

// Re-export main types
pub use crawl_uri::{
    status, AuthChallenge, Credential, CrawlUri, FetchHistory, FetchType, FormField,
    ResponseHeaders, RevisitProfile, ANNOTATION_LENGTH_TRUNC, ANNOTATION_MID_FETCH_ABORT,
    ANNOTATION_TIME_TRUNC,
};
pub use fetch_stats::{FetchStats, HasFetchStats, SubstatsSnapshot};
pub use server_cache::{CrawlHost, CrawlServer, ServerCache};
