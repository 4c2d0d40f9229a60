//! Integration tests for quota enforcement
//!
//! Quotas are checked against statistics the coordinator accumulates from
//! real fetches of wiremock servers, and against hand-tallied holders.

use std::sync::Arc;
use sumi_fetch::config::{Config, CrawlerConfig, FetchConfig, QuotaConfig, UserAgentConfig};
use sumi_fetch::crawler::{
    Coordinator, Frontier, ProcessResult, QuotaEnforcer, QuotaMetric, QuotaScope, QueueGroups,
};
use sumi_fetch::state::{status, CrawlUri, HasFetchStats, ServerCache};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration with the given quotas, one queue at a time
fn create_test_config(quota: QuotaConfig) -> Config {
    Config {
        crawler: CrawlerConfig {
            max_concurrent_queues: 1,
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
            template: None,
        },
        fetch: FetchConfig {
            timeout_seconds: 10,
            so_timeout_ms: 2_000,
            ..FetchConfig::default()
        },
        quota,
        credentials: vec![],
    }
}

async fn mock_server(body_len: usize, expected_requests: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("x".repeat(body_len))
                .insert_header("content-type", "text/plain"),
        )
        .expect(expected_requests)
        .mount(&server)
        .await;
    server
}

fn uris(base: &str, count: usize) -> Vec<CrawlUri> {
    (0..count)
        .map(|i| CrawlUri::parse(&format!("{}/page{}", base, i)).unwrap())
        .collect()
}

fn enforcer(quota: QuotaConfig) -> (QuotaEnforcer, Arc<ServerCache>, Arc<QueueGroups>) {
    let servers = Arc::new(ServerCache::new());
    let groups = Arc::new(QueueGroups::new());
    let enforcer = QuotaEnforcer::new(
        quota,
        Arc::clone(&servers),
        Arc::clone(&groups) as Arc<dyn Frontier>,
    );
    (enforcer, servers, groups)
}

#[tokio::test]
async fn test_server_success_quota_retires_queue() {
    let server = mock_server(100, 2).await;
    let config = create_test_config(QuotaConfig {
        server_max_fetch_successes: 2,
        ..Default::default()
    });

    let coordinator = Coordinator::new(&config).unwrap();
    let report = coordinator.run(uris(&server.uri(), 5)).await;

    assert_eq!(report.successes(), 2);
    assert_eq!(report.retired().count(), 3);
    let first_retired = &report.outcomes[2].curi;
    assert!(first_retired.force_retire);
    assert_eq!(first_retired.fetch_status, status::UNATTEMPTED);
    assert_eq!(first_retired.annotations, vec!["Q:serverMaxFetchSuccesses"]);

    // URIs behind the retired one are never offered to the chain
    for outcome in &report.outcomes[3..] {
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.curi.annotations.is_empty());
    }
}

#[tokio::test]
async fn test_success_kb_quota_blocks_without_retiring() {
    let server = mock_server(2048, 1).await;
    let config = create_test_config(QuotaConfig {
        server_max_success_kb: 1,
        force_retire: false,
        ..Default::default()
    });

    let coordinator = Coordinator::new(&config).unwrap();
    let report = coordinator.run(uris(&server.uri(), 3)).await;

    assert_eq!(report.outcomes[0].curi.fetch_status, 200);
    for outcome in &report.outcomes[1..] {
        assert!(!outcome.retired);
        assert_eq!(outcome.curi.fetch_status, status::BLOCKED_BY_QUOTA);
        assert!(outcome.curi.has_annotation("Q:serverMaxSuccessKb"));
        assert!(outcome.curi.recorder.is_none());
    }
}

#[tokio::test]
async fn test_host_quota_spans_ports() {
    let first = mock_server(10, 1).await;
    let second = mock_server(10, 0).await;
    let config = create_test_config(QuotaConfig {
        host_max_fetch_responses: 1,
        force_retire: false,
        ..Default::default()
    });

    let coordinator = Coordinator::new(&config).unwrap();
    let mut list = uris(&first.uri(), 1);
    list.extend(uris(&second.uri(), 1));
    let report = coordinator.run(list).await;

    assert_eq!(report.outcomes[0].curi.fetch_status, 200);
    assert_eq!(report.outcomes[1].curi.fetch_status, status::BLOCKED_BY_QUOTA);
    assert!(report.outcomes[1].curi.has_annotation("Q:hostMaxFetchResponses"));
    assert_eq!(coordinator.servers().server_count(), 1);
    assert_eq!(coordinator.servers().host_count(), 1);
}

#[tokio::test]
async fn test_group_quota_follows_class_key() {
    let first = mock_server(10, 1).await;
    let second = mock_server(10, 0).await;
    let config = create_test_config(QuotaConfig {
        group_max_novel_urls: 1,
        ..Default::default()
    });

    let coordinator = Coordinator::new(&config).unwrap();
    let list = vec![
        CrawlUri::parse(&format!("{}/a", first.uri()))
            .unwrap()
            .with_class_key("campaign"),
        CrawlUri::parse(&format!("{}/b", second.uri()))
            .unwrap()
            .with_class_key("campaign"),
    ];
    let report = coordinator.run(list).await;

    assert_eq!(report.outcomes[0].curi.fetch_status, 200);
    assert!(report.outcomes[1].retired);
    assert!(report.outcomes[1].curi.has_annotation("Q:groupMaxNovelUrls"));
    let group = coordinator.groups().get("campaign").unwrap();
    assert_eq!(group.substats().novel_urls(), 1);
}

#[test]
fn test_server_is_checked_before_host_and_group() {
    let (enforcer, servers, groups) = enforcer(QuotaConfig {
        server_max_all_kb: 1,
        host_max_fetch_successes: 1,
        group_max_fetch_successes: 1,
        force_retire: false,
        ..Default::default()
    });
    let mut curi = CrawlUri::parse("http://example.com/").unwrap();
    let server = servers.get_or_create_server(&curi.uri).unwrap();
    let host = servers.get_or_create_host(&curi.uri).unwrap();
    let group = groups.get_or_create(&curi.class_key);
    for holder in [server.substats(), host.substats(), group.substats()] {
        holder.record(4096, true, true);
    }

    let violation = enforcer.check(&curi).unwrap();
    assert_eq!(violation.scope, QuotaScope::Server);
    assert_eq!(violation.metric, QuotaMetric::AllKb);
    assert_eq!(violation.current, 4);

    assert_eq!(enforcer.enforce(&mut curi), ProcessResult::Finish);
    assert_eq!(curi.annotations, vec!["Q:serverMaxAllKb"]);
}

#[test]
fn test_check_reads_without_counting() {
    let (enforcer, servers, _groups) = enforcer(QuotaConfig {
        server_max_fetch_responses: 3,
        ..Default::default()
    });
    let curi = CrawlUri::parse("http://example.com/").unwrap();
    let server = servers.get_or_create_server(&curi.uri).unwrap();
    server.substats().record(10, false, false);

    for _ in 0..5 {
        assert!(enforcer.check(&curi).is_none());
    }
    assert_eq!(server.substats().fetch_responses(), 1);
}

#[test]
fn test_once_blocked_stays_blocked() {
    let (enforcer, servers, _groups) = enforcer(QuotaConfig {
        server_max_fetch_successes: 2,
        force_retire: false,
        ..Default::default()
    });
    let next = CrawlUri::parse("http://example.com/next").unwrap();
    let server = servers.get_or_create_server(&next.uri).unwrap();

    server.substats().record(10, true, true);
    assert!(enforcer.check(&next).is_none());
    server.substats().record(10, true, true);

    for _ in 0..3 {
        let mut curi = CrawlUri::parse("http://example.com/next").unwrap();
        assert_eq!(enforcer.enforce(&mut curi), ProcessResult::Finish);
        assert_eq!(curi.fetch_status, status::BLOCKED_BY_QUOTA);
        // failures and revisits never lower the counters
        server.substats().record(10, false, false);
    }
}

#[test]
fn test_zero_ceiling_applies_once_scope_is_tracked() {
    let (enforcer, servers, _groups) = enforcer(QuotaConfig {
        server_max_fetch_responses: 0,
        force_retire: false,
        ..Default::default()
    });
    let curi = CrawlUri::parse("http://example.com/").unwrap();

    assert!(enforcer.check(&curi).is_none());
    servers.get_or_create_server(&curi.uri);
    let violation = enforcer.check(&curi).unwrap();
    assert_eq!(violation.limit, 0);
    assert_eq!(violation.current, 0);
}
