//! Connection setup: direct, HTTP proxy (CONNECT tunnel for https), SOCKS5,
//! optional local bind address, and TLS at either trust level

use super::response::{parse_head, ResponseHead};
use crate::config::{FetchConfig, SslTrustLevel};
use crate::{FetchError, FetchFailure};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

/// A byte stream the fetcher can write a request to and read a response from
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// How the TCP connection reaches the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Direct,
    HttpProxy { host: String, port: u16 },
    Socks { host: String, port: u16 },
}

impl Route {
    pub fn from_config(config: &FetchConfig) -> Self {
        if let (Some(host), Some(port)) = (&config.http_proxy_host, config.http_proxy_port) {
            return Self::HttpProxy {
                host: host.clone(),
                port,
            };
        }
        if let (Some(host), Some(port)) = (&config.socks_proxy_host, config.socks_proxy_port) {
            return Self::Socks {
                host: host.clone(),
                port,
            };
        }
        Self::Direct
    }
}

/// An established connection, ready for the request
pub(crate) struct Connection {
    pub stream: Box<dyn AsyncStream>,
    /// Request target must be in absolute form (plain http through a proxy)
    pub absolute_form: bool,
    /// The request travels through an HTTP proxy without a tunnel
    pub via_proxy: bool,
}

/// What a connection attempt ended with, short of a failure
pub(crate) enum Connected {
    Open(Connection),
    /// The proxy answered `CONNECT` with 407; the head carries its challenges
    ProxyAuthRequired(ResponseHead),
}

/// Opens connections according to the fetch configuration
pub(crate) struct Connector {
    route: Route,
    bind: Option<IpAddr>,
    connect_timeout: Duration,
    socket_timeout: Duration,
    tls: TlsConnector,
}

impl Connector {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let bind = config
            .http_bind_address
            .as_deref()
            .map(|addr| {
                addr.parse::<IpAddr>()
                    .map_err(|_| FetchError::BindAddress(addr.to_string()))
            })
            .transpose()?;

        Ok(Self {
            route: Route::from_config(config),
            bind,
            connect_timeout: Duration::from_millis(config.so_timeout_ms),
            socket_timeout: Duration::from_millis(config.so_timeout_ms),
            tls: TlsConnector::from(Arc::new(tls_config(config.ssl_trust_level)?)),
        })
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Connects to the origin of `url`
    ///
    /// `server_ip` receives the peer address as soon as the TCP connection
    /// is up, so it is known even when a later stage fails.
    pub async fn connect(
        &self,
        url: &Url,
        proxy_authorization: Option<&str>,
        server_ip: &mut Option<IpAddr>,
    ) -> Result<Connected, FetchFailure> {
        let host = host_name(url).ok_or_else(|| FetchFailure::Unresolvable(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FetchFailure::Unresolvable(url.to_string()))?;
        let https = url.scheme() == "https";

        let (tcp, via_proxy) = match &self.route {
            Route::Direct => (self.open_tcp(&host, port).await?, false),
            Route::HttpProxy {
                host: proxy_host,
                port: proxy_port,
            } => {
                let mut tcp = self.open_tcp(proxy_host, *proxy_port).await?;
                if https {
                    *server_ip = tcp.peer_addr().ok().map(|a| a.ip());
                    let refusal = self
                        .within_socket_timeout(
                            &format!("{}:{}", host, port),
                            connect_tunnel(&mut tcp, &host, port, proxy_authorization),
                        )
                        .await?;
                    if let Some(head) = refusal {
                        return Ok(Connected::ProxyAuthRequired(head));
                    }
                    (tcp, false)
                } else {
                    (tcp, true)
                }
            }
            Route::Socks {
                host: proxy_host,
                port: proxy_port,
            } => {
                let mut tcp = self.open_tcp(proxy_host, *proxy_port).await?;
                *server_ip = tcp.peer_addr().ok().map(|a| a.ip());
                self.within_socket_timeout(
                    &format!("{}:{}", host, port),
                    socks5_connect(&mut tcp, &host, port),
                )
                .await?;
                (tcp, false)
            }
        };
        *server_ip = tcp.peer_addr().ok().map(|a| a.ip());

        if !https {
            return Ok(Connected::Open(Connection {
                stream: Box::new(tcp),
                absolute_form: via_proxy,
                via_proxy,
            }));
        }

        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| FetchFailure::TlsServerName(host.clone()))?;
        let handshake = self.tls.connect(server_name, tcp);
        let tls = match timeout(self.socket_timeout, handshake).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(source)) => return Err(FetchFailure::Tls { host, source }),
            Err(_) => {
                return Err(FetchFailure::ConnectTimeout {
                    target: format!("{}:{}", host, port),
                    timeout_ms: self.socket_timeout.as_millis() as u64,
                })
            }
        };
        Ok(Connected::Open(Connection {
            stream: Box::new(tls),
            absolute_form: false,
            via_proxy: false,
        }))
    }

    async fn within_socket_timeout<F, T>(&self, target: &str, step: F) -> Result<T, FetchFailure>
    where
        F: std::future::Future<Output = Result<T, FetchFailure>>,
    {
        timeout(self.socket_timeout, step)
            .await
            .map_err(|_| FetchFailure::ConnectTimeout {
                target: target.to_string(),
                timeout_ms: self.socket_timeout.as_millis() as u64,
            })?
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream, FetchFailure> {
        let target = format!("{}:{}", host, port);
        match timeout(self.connect_timeout, self.resolve_and_connect(host, port)).await {
            Ok(result) => result,
            Err(_) => Err(FetchFailure::ConnectTimeout {
                target,
                timeout_ms: self.connect_timeout.as_millis() as u64,
            }),
        }
    }

    async fn resolve_and_connect(&self, host: &str, port: u16) -> Result<TcpStream, FetchFailure> {
        let target = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| FetchFailure::Unresolvable(target.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(FetchFailure::Unresolvable(target));
        }

        let mut last_error = None;
        for addr in addrs {
            match connect_addr(addr, self.bind).await {
                Ok(stream) => {
                    tracing::trace!("connected to {} ({})", target, addr);
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(FetchFailure::Connect {
            target,
            source: last_error
                .unwrap_or_else(|| std::io::Error::other("no address could be connected")),
        })
    }
}

async fn connect_addr(addr: SocketAddr, bind: Option<IpAddr>) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(ip) = bind {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    socket.connect(addr).await
}

/// Host of a URL without IPv6 brackets
pub(crate) fn host_name(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

/// Opens a `CONNECT` tunnel through an HTTP proxy; the exchange is not
/// recorded
///
/// # Returns
///
/// * `Ok(None)` - The tunnel is open
/// * `Ok(Some(head))` - The proxy wants credentials (407)
/// * `Err(FetchFailure)` - Any other refusal or a broken exchange
async fn connect_tunnel<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    proxy_authorization: Option<&str>,
) -> Result<Option<ResponseHead>, FetchFailure> {
    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {} HTTP/1.0\r\nHost: {}\r\n", target, target);
    if let Some(auth) = proxy_authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // read byte by byte so nothing past the proxy's header block is consumed
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") && !head.ends_with(b"\n\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(FetchFailure::NoResponse { target });
        }
        head.push(byte[0]);
        if head.len() > 64 * 1024 {
            return Err(FetchFailure::MalformedResponse {
                target,
                message: "oversized CONNECT response".to_string(),
            });
        }
    }

    let status_line = String::from_utf8_lossy(&head)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    let parsed = match parse_head(&head) {
        Ok(Some(parsed)) => parsed,
        Ok(None) | Err(_) => {
            return Err(FetchFailure::MalformedResponse {
                target,
                message: format!("bad CONNECT response: {}", status_line),
            })
        }
    };
    match parsed.status {
        200..=299 => Ok(None),
        407 => Ok(Some(parsed)),
        _ => Err(FetchFailure::ProxyTunnel {
            target,
            status_line,
        }),
    }
}

/// SOCKS5 `CONNECT` without authentication; the proxy resolves names
async fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<(), FetchFailure> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, 0x00] {
        return Err(FetchFailure::Socks(format!(
            "proxy refused unauthenticated access (reply {:02x} {:02x})",
            choice[0], choice[1]
        )));
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            let len = u8::try_from(name.len())
                .map_err(|_| FetchFailure::Socks(format!("host name too long: {}", host)))?;
            request.push(0x03);
            request.push(len);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(FetchFailure::Socks(format!(
            "connect to {}:{} failed with reply code {}",
            host, port, reply[1]
        )));
    }
    let bound_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(FetchFailure::Socks(format!(
                "unknown bound address type {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn tls_config(trust: SslTrustLevel) -> Result<ClientConfig, FetchError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = match trust {
        SslTrustLevel::Open => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth(),
        SslTrustLevel::Normal => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    Ok(config)
}

/// Certificate verifier for the `open` trust level: any chain, any name
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
