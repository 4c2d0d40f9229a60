//! Integration tests for the fetch engine
//!
//! These tests run the fetcher against wiremock servers and against raw
//! TCP listeners that script exactly what goes on the wire.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::future::Future;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use sumi_fetch::config::{
    Config, CrawlerConfig, CredentialEntry, FetchConfig, QuotaConfig, SslTrustLevel,
    UserAgentConfig,
};
use sumi_fetch::crawler::{basic_authorization, digest_response, Coordinator, FetchHttp};
use sumi_fetch::state::{status, CrawlUri, FormField, HasFetchStats, RevisitProfile};
use sumi_fetch::FetchFailure;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER_AGENT: &str = "TestBot/1.0.0 (+https://example.com/contact; test@example.com)";

/// Creates a test configuration with short timeouts
fn create_test_config() -> Config {
    Config {
        crawler: CrawlerConfig::default(),
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
        quota: QuotaConfig::default(),
        credentials: vec![],
    }
}

fn fetcher(edit: impl FnOnce(&mut Config)) -> FetchHttp {
    let mut config = create_test_config();
    edit(&mut config);
    FetchHttp::new(&config).expect("Failed to build fetcher")
}

fn curi(url: &str) -> CrawlUri {
    CrawlUri::parse(url).expect("Failed to parse test URL")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads one request: the header block plus any Content-Length body
async fn read_request<S: AsyncRead + Unpin>(socket: &mut S) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let body_len = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Accepts `connections` connections in turn; each request is read and the
/// socket handed to `handler`. The join handle yields the requests.
async fn serve<F, Fut>(connections: usize, handler: F) -> (SocketAddr, JoinHandle<Vec<String>>)
where
    F: Fn(usize, TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for i in 0..connections {
            let (mut socket, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut socket).await);
            handler(i, socket).await;
        }
        requests
    });
    (addr, handle)
}

/// Serves one canned response per connection, then closes
async fn serve_responses(responses: Vec<Vec<u8>>) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let responses = Arc::new(responses);
    serve(responses.len(), move |i, mut socket| {
        let response = responses[i].clone();
        async move {
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        }
    })
    .await
}

fn response(head: &str, body: &[u8]) -> Vec<u8> {
    let mut bytes = head.replace('\n', "\r\n").into_bytes();
    bytes.extend_from_slice(b"\r\n");
    bytes.extend_from_slice(body);
    bytes
}

fn ok_with_length(content_type: &str, body: &[u8]) -> Vec<u8> {
    response(
        &format!(
            "HTTP/1.0 200 OK\nContent-Type: {}\nContent-Length: {}\n",
            content_type,
            body.len()
        ),
        body,
    )
}

fn header_line<'a>(request: &'a str, name: &str) -> Option<&'a str> {
    request.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

// ===== Basic fetches =====

#[tokio::test]
async fn test_simple_get_against_mock_server() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .and(header("user-agent", USER_AGENT))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("abc")
                .insert_header("content-type", "text/plain"),
        )
        .mount(&mock_server)
        .await;

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("{}/hello", mock_server.uri()));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    assert_eq!(uri.content_type.as_deref(), Some("text/plain"));
    assert_eq!(uri.content_length, 3);
    assert_eq!(
        uri.content_digest.as_deref(),
        Some("sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5")
    );
    assert_eq!(uri.server_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert!(uri.fetch_completed_time.is_some());
    assert!(uri.fetch_began_time.is_some());
    assert!(uri.non_fatal_failures.is_empty());

    let recorder = uri.recorder.as_ref().expect("recorder attached");
    assert_eq!(recorder.message_body(), b"abc");
    assert_eq!(recorder.entity().unwrap().as_ref(), b"abc");
    assert_eq!(recorder.content().unwrap().as_ref(), b"abc");
    assert_eq!(uri.recorded_size, recorder.replay_input().len() as u64);
    assert_eq!(uri.content_size, uri.recorded_size);
}

#[tokio::test]
async fn test_request_is_recorded_byte_for_byte() {
    let (addr, server) = serve_responses(vec![ok_with_length("text/plain", b"ok")]).await;

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("http://{}/path/page?q=1", addr));
    fetcher.fetch(&mut uri).await;
    let requests = server.await.unwrap();

    let sent = String::from_utf8(uri.recorder.as_ref().unwrap().recorded_output().to_vec()).unwrap();
    assert_eq!(sent, requests[0]);
    assert!(sent.starts_with("GET /path/page?q=1 HTTP/1.0\r\n"));
    assert_eq!(header_line(&sent, "host"), Some(addr.to_string().as_str()));
    assert_eq!(header_line(&sent, "user-agent"), Some(USER_AGENT));
    assert_eq!(header_line(&sent, "connection"), Some("close"));
    assert!(sent.contains(&format!("{}\r\n", sumi_fetch::crawler::DEFAULT_ACCEPT)));
    assert!(header_line(&sent, "accept-encoding").is_none());
    assert!(header_line(&sent, "range").is_none());
}

#[tokio::test]
async fn test_http11_and_custom_accept_lines() {
    let (addr, server) = serve_responses(vec![ok_with_length("text/plain", b"ok")]).await;

    let fetcher = fetcher(|c| {
        c.fetch.use_http11 = true;
        c.fetch.accept_headers = Some(vec![
            "Accept: text/plain".to_string(),
            "Accept-Language: en".to_string(),
        ]);
    });
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;
    let requests = server.await.unwrap();

    assert!(requests[0].starts_with("GET / HTTP/1.1\r\n"));
    assert_eq!(header_line(&requests[0], "accept"), Some("text/plain"));
    assert_eq!(header_line(&requests[0], "accept-language"), Some("en"));
    assert_eq!(uri.fetch_status, 200);
}

#[tokio::test]
async fn test_bind_address() {
    let (addr, _server) = serve_responses(vec![ok_with_length("text/plain", b"bound")]).await;

    let fetcher = fetcher(|c| c.fetch.http_bind_address = Some("127.0.0.1".to_string()));
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    assert_eq!(uri.server_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
}

// ===== Payload layers =====

#[tokio::test]
async fn test_chunked_response_layers() {
    let raw = response(
        "HTTP/1.1 200 OK\nTransfer-Encoding: chunked\nContent-Type: text/plain\n",
        b"7\r\nHello, \r\n9\r\ncrawler!\n\r\n0\r\n\r\n",
    );
    let (addr, _server) = serve_responses(vec![raw]).await;

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("http://{}/chunked", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    let recorder = uri.recorder.as_ref().unwrap();
    assert!(recorder.is_chunked());
    assert_ne!(recorder.message_body(), b"Hello, crawler!\n");
    assert_eq!(recorder.entity().unwrap().as_ref(), b"Hello, crawler!\n");
    assert_eq!(recorder.content().unwrap().as_ref(), b"Hello, crawler!\n");
    assert_eq!(uri.content_length, 16);
    assert_eq!(
        uri.content_digest.as_deref(),
        Some("sha1:AVLKSYHRYF3LU2Y4DQA3QNUEDWXTUNVN")
    );
}

#[tokio::test]
async fn test_gzip_response_layers() {
    let payload = "Hello, crawler!\n".repeat(100);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let raw = response(
        &format!(
            "HTTP/1.0 200 OK\nContent-Type: text/plain\nContent-Encoding: gzip\nContent-Length: {}\n",
            compressed.len()
        ),
        &compressed,
    );
    let (addr, server) = serve_responses(vec![raw]).await;

    let fetcher = fetcher(|c| c.fetch.accept_compression = true);
    let mut uri = curi(&format!("http://{}/gzip", addr));
    fetcher.fetch(&mut uri).await;
    let requests = server.await.unwrap();

    assert_eq!(header_line(&requests[0], "accept-encoding"), Some("gzip,deflate"));
    assert_eq!(uri.fetch_status, 200);
    let recorder = uri.recorder.as_ref().unwrap();
    assert_eq!(recorder.message_body(), compressed.as_slice());
    assert_eq!(recorder.entity().unwrap().as_ref(), compressed.as_slice());
    assert_eq!(recorder.content().unwrap().as_ref(), payload.as_bytes());
    assert_eq!(recorder.content_replay_string().unwrap(), payload);
    assert_eq!(uri.content_length, compressed.len() as u64);
}

// ===== Limits =====

#[tokio::test]
async fn test_length_cap_records_one_byte_past_cap() {
    let body = vec![b'x'; 200 * 1024];
    for rate in [0, 500] {
        let (addr, _server) = serve_responses(vec![ok_with_length("text/plain", &body)]).await;

        let fetcher = fetcher(|c| {
            c.fetch.max_length_bytes = 50_000;
            c.fetch.max_fetch_kb_sec = rate;
        });
        let mut uri = curi(&format!("http://{}/big", addr));
        fetcher.fetch(&mut uri).await;

        assert_eq!(uri.fetch_status, 200, "rate {}", rate);
        assert_eq!(uri.recorded_size, 50_001, "rate {}", rate);
        assert!(uri.has_annotation("lenTrunc"));
        assert!(uri.fetch_completed_time.is_some());
    }
}

#[tokio::test]
async fn test_range_header_matches_length_cap() {
    let (addr, server) = serve_responses(vec![ok_with_length("text/plain", b"ok")]).await;

    let fetcher = fetcher(|c| {
        c.fetch.max_length_bytes = 50_000;
        c.fetch.send_range = true;
    });
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;
    let requests = server.await.unwrap();

    assert_eq!(header_line(&requests[0], "range"), Some("bytes=0-49999"));
}

#[tokio::test]
async fn test_throttle_paces_reads() {
    let body = vec![b'x'; 200 * 1024];
    let (addr, _server) = serve_responses(vec![ok_with_length("text/plain", &body)]).await;

    let fetcher = fetcher(|c| c.fetch.max_fetch_kb_sec = 100);
    let mut uri = curi(&format!("http://{}/slow", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    assert_eq!(uri.recorder.as_ref().unwrap().message_body().len(), body.len());
    let seconds = uri.fetch_duration.as_secs_f64();
    assert!(
        (1.8..=2.2).contains(&seconds),
        "200KB at 100KB/s took {:.3}s",
        seconds
    );
}

#[tokio::test]
async fn test_overall_timeout_keeps_partial_body() {
    let (addr, _server) = serve(1, |_, mut socket| async move {
        let head = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 1000\r\n\r\n";
        if socket.write_all(head).await.is_err() {
            return;
        }
        for _ in 0..25 {
            if socket.write_all(b"0123456789").await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;

    let fetcher = fetcher(|c| c.fetch.timeout_seconds = 1);
    let mut uri = curi(&format!("http://{}/drip", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    assert!(uri.has_annotation("timeTrunc"));
    assert!(uri.fetch_completed_time.is_some());
    assert!(uri.fetch_duration < Duration::from_secs(2));
    let body = uri.recorder.as_ref().unwrap().message_body().len();
    assert!(body > 0 && body < 1000, "partial body of {} bytes", body);
}

#[tokio::test]
async fn test_socket_timeout_mid_body() {
    let (addr, _server) = serve(1, |_, mut socket| async move {
        let _ = socket
            .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 100\r\n\r\nhello")
            .await;
        tokio::time::sleep(Duration::from_secs(3)).await;
    })
    .await;

    let fetcher = fetcher(|c| c.fetch.so_timeout_ms = 500);
    let mut uri = curi(&format!("http://{}/stall", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    assert!(uri.has_annotation("timeTrunc"));
    assert_eq!(uri.recorder.as_ref().unwrap().message_body(), b"hello");
}

// ===== Failures =====

#[tokio::test]
async fn test_no_response_is_connect_failed() {
    let (addr, _server) = serve(1, |_, socket| async move { drop(socket) }).await;

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, status::CONNECT_FAILED);
    assert!(uri.fetch_completed_time.is_none());
    assert_eq!(uri.non_fatal_failures.len(), 1);
    assert!(matches!(
        uri.non_fatal_failures[0],
        FetchFailure::NoResponse { .. }
    ));
    assert_eq!(uri.server_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
}

#[tokio::test]
async fn test_timeout_before_headers_is_connect_failed() {
    let (addr, _server) = serve(1, |_, _socket| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
    })
    .await;

    let fetcher = fetcher(|c| c.fetch.so_timeout_ms = 300);
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, status::CONNECT_FAILED);
    assert!(uri.non_fatal_failures[0].is_timeout());
}

#[tokio::test]
async fn test_garbage_response_is_connect_failed() {
    let (addr, _server) =
        serve_responses(vec![b"SSH-2.0-OpenSSH_9.6\r\n\r\n".to_vec()]).await;

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, status::CONNECT_FAILED);
    assert!(matches!(
        uri.non_fatal_failures[0],
        FetchFailure::MalformedResponse { .. }
    ));
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, status::CONNECT_FAILED);
    assert!(uri.server_ip.is_none());
    assert!(matches!(
        uri.non_fatal_failures[0],
        FetchFailure::Connect { .. }
    ));
}

#[tokio::test]
async fn test_bad_bind_address_is_a_hard_error() {
    let mut config = create_test_config();
    config.fetch.http_bind_address = Some("not-an-address".to_string());
    assert!(FetchHttp::new(&config).is_err());
}

// ===== Proxies =====

#[tokio::test]
async fn test_http_proxy_uses_absolute_form() {
    let (proxy, server) = serve_responses(vec![ok_with_length("text/plain", b"proxied")]).await;

    let fetcher = fetcher(|c| {
        c.fetch.http_proxy_host = Some("127.0.0.1".to_string());
        c.fetch.http_proxy_port = Some(proxy.port());
    });
    let mut uri = curi("http://origin.test/page?x=1");
    fetcher.fetch(&mut uri).await;
    let requests = server.await.unwrap();

    assert!(requests[0].starts_with("GET http://origin.test/page?x=1 HTTP/1.0\r\n"));
    assert_eq!(header_line(&requests[0], "proxy-connection"), Some("close"));
    assert!(header_line(&requests[0], "connection").is_none());
    assert_eq!(header_line(&requests[0], "host"), Some("origin.test"));
    assert_eq!(uri.fetch_status, 200);
    assert_eq!(uri.server_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
}

#[tokio::test]
async fn test_http_proxy_authentication() {
    let challenge = response(
        "HTTP/1.0 407 Proxy Authentication Required\nProxy-Authenticate: Basic realm=\"proxy-realm\"\nContent-Length: 0\n",
        b"",
    );
    let (proxy, server) = serve_responses(vec![
        challenge,
        ok_with_length("text/plain", b"two"),
        ok_with_length("text/plain", b"one"),
    ])
    .await;

    let fetcher = fetcher(|c| {
        c.fetch.http_proxy_host = Some("127.0.0.1".to_string());
        c.fetch.http_proxy_port = Some(proxy.port());
        c.fetch.http_proxy_user = Some("proxy-login".to_string());
        c.fetch.http_proxy_password = Some("proxy-password".to_string());
    });

    let mut uri = curi("http://origin.test/one");
    fetcher.fetch(&mut uri).await;
    assert_eq!(uri.fetch_status, 407);
    assert_eq!(uri.credentials.len(), 1);
    assert!(uri.auth_challenges.values().any(|c| c.proxy));
    assert!(fetcher.has_proxy_authorization());

    // a URI that never saw the challenge goes through with the credential
    let mut other = curi("http://origin.test/two");
    fetcher.fetch(&mut other).await;
    assert_eq!(other.fetch_status, 200);
    assert!(other.credentials.is_empty());

    fetcher.fetch(&mut uri).await;
    assert_eq!(uri.fetch_status, 200);
    assert!(uri.credentials.is_empty());
    assert!(fetcher.has_proxy_authorization());

    let requests = server.await.unwrap();
    let expected = basic_authorization("proxy-login", "proxy-password");
    assert!(header_line(&requests[0], "proxy-authorization").is_none());
    assert!(requests[1].starts_with("GET http://origin.test/two HTTP/1.0\r\n"));
    assert_eq!(header_line(&requests[1], "proxy-authorization"), Some(expected.as_str()));
    assert_eq!(header_line(&requests[2], "proxy-authorization"), Some(expected.as_str()));
}

/// Minimal SOCKS5 proxy: one connection, no auth, relays to `origin`
/// whatever name was asked for. Yields the requested host and port.
async fn socks_proxy(origin: SocketAddr) -> (SocketAddr, JoinHandle<(String, u16)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        client.write_all(&[0x05, 0x00]).await.unwrap();

        let mut request = [0u8; 4];
        client.read_exact(&mut request).await.unwrap();
        assert_eq!(request, [0x05, 0x01, 0x00, 0x03]);
        let mut len = [0u8; 1];
        client.read_exact(&mut len).await.unwrap();
        let mut name = vec![0u8; len[0] as usize];
        client.read_exact(&mut name).await.unwrap();
        let mut port = [0u8; 2];
        client.read_exact(&mut port).await.unwrap();

        let mut upstream = TcpStream::connect(origin).await.unwrap();
        client
            .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
            .await
            .unwrap();
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        (String::from_utf8(name).unwrap(), u16::from_be_bytes(port))
    });
    (addr, handle)
}

#[tokio::test]
async fn test_socks5_proxy() {
    let (origin, server) = serve_responses(vec![ok_with_length("text/plain", b"via socks")]).await;
    let (proxy, socks) = socks_proxy(origin).await;

    let fetcher = fetcher(|c| {
        c.fetch.socks_proxy_host = Some("127.0.0.1".to_string());
        c.fetch.socks_proxy_port = Some(proxy.port());
    });
    let mut uri = curi("http://origin.test:8080/socks");
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    assert_eq!(uri.recorder.as_ref().unwrap().message_body(), b"via socks");
    assert_eq!(socks.await.unwrap(), ("origin.test".to_string(), 8080));

    let requests = server.await.unwrap();
    assert!(requests[0].starts_with("GET /socks HTTP/1.0\r\n"));
    assert_eq!(header_line(&requests[0], "host"), Some("origin.test:8080"));
    assert_eq!(header_line(&requests[0], "connection"), Some("close"));
}

// ===== TLS =====

/// HTTPS server with a fresh self-signed certificate for `localhost`; the
/// join handle yields the request read inside TLS
async fn tls_server(body: &'static [u8]) -> (u16, JoinHandle<String>) {
    use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio_rustls::rustls::{crypto::ring, ServerConfig};

    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![generated.cert.der().clone()], key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let Ok(mut tls) = acceptor.accept(socket).await else {
            return String::new();
        };
        let request = read_request(&mut tls).await;
        let _ = tls.write_all(&ok_with_length("text/plain", body)).await;
        let _ = tls.shutdown().await;
        request
    });
    (port, handle)
}

#[tokio::test]
async fn test_https_with_open_trust() {
    let (port, _server) = tls_server(b"secret").await;

    let fetcher = fetcher(|c| c.fetch.ssl_trust_level = SslTrustLevel::Open);
    let mut uri = curi(&format!("https://localhost:{}/secure", port));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200, "{:?}", uri.non_fatal_failures);
    assert_eq!(uri.recorder.as_ref().unwrap().message_body(), b"secret");
}

#[tokio::test]
async fn test_https_with_normal_trust_rejects_self_signed() {
    let (port, _server) = tls_server(b"secret").await;

    let fetcher = fetcher(|c| c.fetch.ssl_trust_level = SslTrustLevel::Normal);
    let mut uri = curi(&format!("https://localhost:{}/secure", port));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, status::CONNECT_FAILED);
    assert!(matches!(uri.non_fatal_failures[0], FetchFailure::Tls { .. }));
}

/// HTTP proxy answering each connection's `CONNECT` with the next scripted
/// reply; a 200 relays the connection to `origin_port`. Yields the
/// `CONNECT` requests.
async fn tunnel_proxy(
    origin_port: u16,
    replies: Vec<Vec<u8>>,
) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let replies = Arc::new(replies);
    serve(replies.len(), move |i, mut client| {
        let reply = replies[i].clone();
        async move {
            let _ = client.write_all(&reply).await;
            if !reply.starts_with(b"HTTP/1.0 200") {
                return;
            }
            if let Ok(mut upstream) = TcpStream::connect(("127.0.0.1", origin_port)).await {
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            }
        }
    })
    .await
}

fn tunnel_established() -> Vec<u8> {
    response("HTTP/1.0 200 Connection established\n", b"")
}

#[tokio::test]
async fn test_https_through_http_proxy_tunnel() {
    let (port, origin) = tls_server(b"tunnelled").await;
    let (proxy, server) = tunnel_proxy(port, vec![tunnel_established()]).await;

    let fetcher = fetcher(|c| {
        c.fetch.http_proxy_host = Some("127.0.0.1".to_string());
        c.fetch.http_proxy_port = Some(proxy.port());
    });
    let mut uri = curi(&format!("https://localhost:{}/secure?q=1", port));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200, "{:?}", uri.non_fatal_failures);
    assert_eq!(uri.recorder.as_ref().unwrap().message_body(), b"tunnelled");
    assert_eq!(uri.server_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let connects = server.await.unwrap();
    assert!(connects[0].starts_with(&format!("CONNECT localhost:{} HTTP/1.0\r\n", port)));

    let inner = origin.await.unwrap();
    assert!(inner.starts_with("GET /secure?q=1 HTTP/1.0\r\n"), "{}", inner);
    assert!(header_line(&inner, "proxy-connection").is_none());
    assert!(header_line(&inner, "proxy-authorization").is_none());
}

#[tokio::test]
async fn test_https_through_authenticating_proxy() {
    let (port, origin) = tls_server(b"tunnelled").await;
    let challenge = response(
        "HTTP/1.0 407 Proxy Authentication Required\nProxy-Authenticate: Basic realm=\"proxy-realm\"\n",
        b"",
    );
    let (proxy, server) = tunnel_proxy(port, vec![challenge, tunnel_established()]).await;

    let fetcher = fetcher(|c| {
        c.fetch.http_proxy_host = Some("127.0.0.1".to_string());
        c.fetch.http_proxy_port = Some(proxy.port());
        c.fetch.http_proxy_user = Some("proxy-login".to_string());
        c.fetch.http_proxy_password = Some("proxy-password".to_string());
    });
    let mut uri = curi(&format!("https://localhost:{}/secure", port));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 407);
    assert!(uri.non_fatal_failures.is_empty());
    assert!(uri.auth_challenges.values().any(|c| c.proxy));
    assert_eq!(uri.credentials.len(), 1);
    assert!(fetcher.has_proxy_authorization());

    fetcher.fetch(&mut uri).await;
    assert_eq!(uri.fetch_status, 200, "{:?}", uri.non_fatal_failures);
    assert_eq!(uri.recorder.as_ref().unwrap().message_body(), b"tunnelled");

    let connects = server.await.unwrap();
    let expected = basic_authorization("proxy-login", "proxy-password");
    assert!(header_line(&connects[0], "proxy-authorization").is_none());
    assert_eq!(header_line(&connects[1], "proxy-authorization"), Some(expected.as_str()));
    assert!(header_line(&origin.await.unwrap(), "proxy-authorization").is_none());
}

// ===== Conditional requests =====

async fn conditional_round_trip(
    if_modified_since: bool,
    if_none_match: bool,
) -> (Vec<String>, CrawlUri) {
    let first = response(
        "HTTP/1.0 200 OK\nContent-Type: text/plain\nLast-Modified: Mon, 01 Jan 2024 00:00:00 GMT\nETag: \"v1\"\nContent-Length: 4\n",
        b"body",
    );
    let second = response("HTTP/1.0 304 Not Modified\nETag: \"v1\"\n", b"");
    let (addr, server) = serve_responses(vec![first, second]).await;

    let fetcher = fetcher(|c| {
        c.fetch.send_if_modified_since = if_modified_since;
        c.fetch.send_if_none_match = if_none_match;
    });
    let mut uri = curi(&format!("http://{}/doc", addr));
    fetcher.fetch(&mut uri).await;
    assert_eq!(uri.fetch_status, 200);
    assert!(uri.revisit_profile.is_none());

    uri.remember_validators();
    fetcher.fetch(&mut uri).await;
    (server.await.unwrap(), uri)
}

#[tokio::test]
async fn test_if_modified_since_revisit() {
    let (requests, uri) = conditional_round_trip(true, false).await;

    assert!(header_line(&requests[0], "if-modified-since").is_none());
    assert_eq!(
        header_line(&requests[1], "if-modified-since"),
        Some("Mon, 01 Jan 2024 00:00:00 GMT")
    );
    assert!(header_line(&requests[1], "if-none-match").is_none());
    assert_eq!(uri.fetch_status, 304);
    assert_eq!(
        uri.revisit_profile,
        Some(RevisitProfile {
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            etag: None,
        })
    );
    assert!(uri.recorder.as_ref().unwrap().message_body().is_empty());
}

#[tokio::test]
async fn test_if_none_match_revisit() {
    let (requests, uri) = conditional_round_trip(false, true).await;

    assert!(header_line(&requests[1], "if-modified-since").is_none());
    assert_eq!(header_line(&requests[1], "if-none-match"), Some("\"v1\""));
    assert_eq!(
        uri.revisit_profile,
        Some(RevisitProfile {
            last_modified: None,
            etag: Some("\"v1\"".to_string()),
        })
    );
}

// ===== Authentication =====

fn basic_credential(addr: SocketAddr) -> CredentialEntry {
    CredentialEntry {
        domain: addr.to_string(),
        realm: "basic-auth-realm".to_string(),
        login: "basic-auth-login".to_string(),
        password: "basic-auth-password".to_string(),
    }
}

fn basic_challenge() -> Vec<u8> {
    response(
        "HTTP/1.0 401 Unauthorized\nWWW-Authenticate: Basic realm=\"basic-auth-realm\"\nContent-Length: 0\n",
        b"",
    )
}

#[tokio::test]
async fn test_basic_auth_is_cached_for_domain() {
    let (addr, server) = serve_responses(vec![
        basic_challenge(),
        ok_with_length("text/plain", b"first"),
        ok_with_length("text/plain", b"third"),
    ])
    .await;

    let fetcher = fetcher(|c| c.credentials.push(basic_credential(addr)));

    let mut first = curi(&format!("http://{}/auth/1", addr));
    fetcher.fetch(&mut first).await;
    assert_eq!(first.fetch_status, 401);
    assert_eq!(first.credentials.len(), 1);
    assert!(first.auth_challenges.contains_key("basic"));

    fetcher.fetch(&mut first).await;
    assert_eq!(first.fetch_status, 200);
    assert_eq!(fetcher.accepted_credential_count(), 1);

    let mut third = curi(&format!("http://{}/auth/3", addr));
    fetcher.fetch(&mut third).await;
    assert_eq!(third.fetch_status, 200);

    let requests = server.await.unwrap();
    let expected = "Basic YmFzaWMtYXV0aC1sb2dpbjpiYXNpYy1hdXRoLXBhc3N3b3Jk";
    assert!(header_line(&requests[0], "authorization").is_none());
    assert_eq!(header_line(&requests[1], "authorization"), Some(expected));
    assert_eq!(header_line(&requests[2], "authorization"), Some(expected));
}

#[tokio::test]
async fn test_wrong_realm_gets_no_credential() {
    let (addr, _server) = serve_responses(vec![response(
        "HTTP/1.0 401 Unauthorized\nWWW-Authenticate: Basic realm=\"other-realm\"\nContent-Length: 0\n",
        b"",
    )])
    .await;

    let fetcher = fetcher(|c| c.credentials.push(basic_credential(addr)));
    let mut uri = curi(&format!("http://{}/auth", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 401);
    assert!(uri.credentials.is_empty());
}

#[tokio::test]
async fn test_coordinator_retries_after_challenge() {
    let (addr, server) = serve_responses(vec![
        basic_challenge(),
        ok_with_length("text/plain", b"first"),
        ok_with_length("text/plain", b"second"),
    ])
    .await;

    let mut config = create_test_config();
    config.credentials.push(basic_credential(addr));
    let coordinator = Coordinator::new(&config).unwrap();
    let report = coordinator
        .run(vec![
            curi(&format!("http://{}/auth/1", addr)),
            curi(&format!("http://{}/auth/2", addr)),
        ])
        .await;

    assert_eq!(report.outcomes[0].attempts, 2);
    assert_eq!(report.outcomes[0].curi.fetch_status, 200);
    assert_eq!(report.outcomes[1].attempts, 1);
    assert_eq!(report.outcomes[1].curi.fetch_status, 200);
    assert_eq!(server.await.unwrap().len(), 3);

    // the 401 counts as a response, not a success
    let server_stats = coordinator
        .servers()
        .server_for(&report.outcomes[0].curi.uri)
        .unwrap();
    assert_eq!(server_stats.substats().fetch_responses(), 3);
    assert_eq!(server_stats.substats().fetch_successes(), 2);
}

#[tokio::test]
async fn test_digest_auth() {
    let nonce = "dcd98b7102dd2f0e8b11d0f600bfb0c093";
    let challenge = response(
        &format!(
            "HTTP/1.0 401 Unauthorized\nWWW-Authenticate: Digest realm=\"digest-realm\", nonce=\"{}\", qop=\"auth\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"\nContent-Length: 0\n",
            nonce
        ),
        b"",
    );
    let (addr, server) =
        serve_responses(vec![challenge, ok_with_length("text/plain", b"digest ok")]).await;

    let fetcher = fetcher(|c| {
        c.credentials.push(CredentialEntry {
            domain: addr.to_string(),
            realm: "digest-realm".to_string(),
            login: "Mufasa".to_string(),
            password: "Circle Of Life".to_string(),
        })
    });
    let mut uri = curi(&format!("http://{}/dir/index.html", addr));
    fetcher.fetch(&mut uri).await;
    assert_eq!(uri.fetch_status, 401);
    assert!(uri.auth_challenges.contains_key("digest"));
    fetcher.fetch(&mut uri).await;
    assert_eq!(uri.fetch_status, 200);

    let requests = server.await.unwrap();
    let authorization = header_line(&requests[1], "authorization").unwrap();
    assert!(authorization.starts_with("Digest "));
    assert!(authorization.contains("username=\"Mufasa\""));
    assert!(authorization.contains("uri=\"/dir/index.html\""));
    assert!(authorization.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    assert!(authorization.contains("nc=00000001"));

    let cnonce = authorization
        .split("cnonce=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap();
    let expected = digest_response(
        "Mufasa",
        "digest-realm",
        "Circle Of Life",
        None,
        "GET",
        "/dir/index.html",
        nonce,
        "00000001",
        cnonce,
        Some("auth"),
    );
    assert!(authorization.contains(&format!("response=\"{}\"", expected)));
}

// ===== Cookies, POST, charsets, body rules =====

#[tokio::test]
async fn test_cookies_are_sent_back() {
    for ignore_cookies in [false, true] {
        let (addr, server) = serve_responses(vec![
            response(
                "HTTP/1.0 200 OK\nSet-Cookie: session=abc123; Path=/\nContent-Length: 0\n",
                b"",
            ),
            ok_with_length("text/plain", b"ok"),
        ])
        .await;

        let fetcher = fetcher(|c| c.fetch.ignore_cookies = ignore_cookies);
        fetcher.fetch(&mut curi(&format!("http://{}/login", addr))).await;
        fetcher.fetch(&mut curi(&format!("http://{}/account", addr))).await;
        let requests = server.await.unwrap();

        if ignore_cookies {
            assert_eq!(fetcher.cookie_count(), 0);
            assert!(header_line(&requests[1], "cookie").is_none());
        } else {
            assert_eq!(fetcher.cookie_count(), 1);
            assert_eq!(header_line(&requests[1], "cookie"), Some("session=abc123"));
        }
    }
}

#[tokio::test]
async fn test_post_form_body() {
    let (addr, server) = serve_responses(vec![ok_with_length("text/plain", b"posted")]).await;

    let fetcher = fetcher(|_| {});
    let url = url::Url::parse(&format!("http://{}/form", addr)).unwrap();
    let mut uri = CrawlUri::post(
        url,
        vec![
            FormField::new("name1", "value1"),
            FormField::new("funky name 2", "a&b"),
        ],
    );
    fetcher.fetch(&mut uri).await;
    let requests = server.await.unwrap();

    let body = "name1=value1&funky+name+2=a%26b";
    assert!(requests[0].starts_with("POST /form HTTP/1.0\r\n"));
    assert_eq!(
        header_line(&requests[0], "content-type"),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(
        header_line(&requests[0], "content-length"),
        Some(body.len().to_string().as_str())
    );
    assert!(requests[0].ends_with(&format!("\r\n\r\n{}", body)));
    assert_eq!(uri.fetch_status, 200);
}

#[tokio::test]
async fn test_declared_charset_decodes_content() {
    let cp1251 = [0xCF, 0xF0, 0xE8, 0xE2, 0xE5, 0xF2];
    let (addr, _server) =
        serve_responses(vec![ok_with_length("text/plain; charset=windows-1251", &cp1251)]).await;

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("http://{}/ru", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.charset, Some(encoding_rs::WINDOWS_1251));
    assert!(uri.annotations.is_empty());
    let text = uri.recorder.as_ref().unwrap().content_replay_string().unwrap();
    assert_eq!(text, "Привет");
}

#[tokio::test]
async fn test_unknown_charset_falls_back_and_annotates() {
    let (addr, _server) =
        serve_responses(vec![ok_with_length("text/plain; charset=x-no-such-charset", b"caf\xe9")])
            .await;

    let fetcher = fetcher(|_| {});
    let mut uri = curi(&format!("http://{}/", addr));
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, 200);
    assert!(uri.has_annotation("unsatisfiableCharsetInHeader:x-no-such-charset"));
    assert_eq!(uri.charset, Some(encoding_rs::WINDOWS_1252));
    let text = uri.recorder.as_ref().unwrap().content_replay_string().unwrap();
    assert_eq!(text, "café");
}

#[tokio::test]
async fn test_body_rule_aborts_after_headers() {
    let image = vec![0u8; 10_000];
    let (addr, _server) = serve_responses(vec![
        ok_with_length("image/png", &image),
        ok_with_length("text/html", b"<html></html>"),
    ])
    .await;

    let fetcher = fetcher(|c| c.fetch.fetch_body_content_types = Some(vec!["text/".to_string()]));

    let mut png = curi(&format!("http://{}/image.png", addr));
    fetcher.fetch(&mut png).await;
    assert_eq!(png.fetch_status, 200);
    assert!(png.has_annotation("midFetchAbort"));
    assert_eq!(png.http_header("content-type"), Some("image/png"));
    let recorder = png.recorder.as_ref().unwrap();
    assert!(recorder.message_body().is_empty());
    assert_eq!(Some(png.recorded_size as usize), recorder.header_size());

    let mut html = curi(&format!("http://{}/page.html", addr));
    fetcher.fetch(&mut html).await;
    assert!(!html.has_annotation("midFetchAbort"));
    assert_eq!(html.recorder.as_ref().unwrap().message_body(), b"<html></html>");
}

#[tokio::test]
async fn test_unsupported_scheme_is_left_untouched() {
    let fetcher = fetcher(|_| {});
    let mut uri = curi("ftp://example.com/file.txt");
    fetcher.fetch(&mut uri).await;

    assert_eq!(uri.fetch_status, status::UNATTEMPTED);
    assert!(uri.recorder.is_none());
    assert!(uri.fetch_began_time.is_none());
}
