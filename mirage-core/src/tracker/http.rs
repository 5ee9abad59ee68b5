//! HTTP tracker transport with bencoded response parsing
//!
//! Announces go out over a fresh HTTP/1.1 connection carrying exactly the
//! descriptor headers plus `Host`, with title-cased names. Nothing else is
//! added, so the tracker sees what the emulated client would send.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::{GzDecoder, ZlibDecoder};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_ENCODING, HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::{Position, Url};

use super::{AnnounceResponse, TrackerError, TrackerRequest, TrackerTransport};
use crate::config::NetworkConfig;

/// Announces over HTTP(S) with `hyper`, TLS through `rustls`.
pub struct HttpTrackerTransport {
    timeout: Duration,
    tls: TlsConnector,
}

/// Where and how one announce is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AnnounceTarget {
    secure: bool,
    host: String,
    port: u16,
    /// `Host` header value, port included when not the scheme default
    authority: String,
    /// Origin-form request target with the rendered query appended verbatim
    path_and_query: String,
}

impl AnnounceTarget {
    fn parse(request: &TrackerRequest) -> Result<Self, TrackerError> {
        let invalid = |reason: String| TrackerError::ConnectionFailed {
            url: request.announce_url.clone(),
            reason,
        };

        let url = Url::parse(&request.announce_url)
            .map_err(|e| invalid(format!("invalid announce URL: {e}")))?;
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| invalid("announce URL has no host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("announce URL has no port".to_string()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let separator = if url.query().is_some() { '&' } else { '?' };
        let path_and_query = format!(
            "{}{}{}",
            &url[Position::BeforePath..Position::AfterQuery],
            separator,
            request.query
        );

        Ok(Self {
            secure,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            authority,
            path_and_query,
        })
    }
}

impl HttpTrackerTransport {
    /// Creates the transport using the configured tracker timeout.
    ///
    /// # Errors
    /// - `TrackerError::ConnectionFailed` - The TLS configuration could not be built
    pub fn new(config: &NetworkConfig) -> Result<Self, TrackerError> {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TrackerError::ConnectionFailed {
            url: String::new(),
            reason: format!("TLS configuration failed: {e}"),
        })?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            timeout: config.tracker_timeout,
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Descriptor headers in order, preceded by `Host` unless the descriptor sets one.
    fn build_headers(request: &TrackerRequest, authority: &str) -> Result<HeaderMap, TrackerError> {
        let invalid = |reason: String| TrackerError::ConnectionFailed {
            url: request.announce_url.clone(),
            reason,
        };

        let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
        let has_host = request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(HOST.as_str()));
        if !has_host {
            let value = HeaderValue::from_str(authority)
                .map_err(|e| invalid(format!("invalid host {authority}: {e}")))?;
            headers.insert(HOST, value);
        }

        for (name, value) in &request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid(format!("invalid header name {name}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| invalid(format!("invalid value for header {name}: {e}")))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    async fn send(
        &self,
        target: &AnnounceTarget,
        request: Request<Empty<Bytes>>,
    ) -> Result<(StatusCode, HeaderMap, Bytes), String> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| e.to_string())?;

        let result = if target.secure {
            let domain = ServerName::try_from(target.host.clone()).map_err(|e| e.to_string())?;
            let stream = self
                .tls
                .connect(domain, stream)
                .await
                .map_err(|e| format!("TLS handshake failed: {e}"))?;
            exchange(TokioIo::new(stream), request).await
        } else {
            exchange(TokioIo::new(stream), request).await
        };
        result.map_err(|e| e.to_string())
    }
}

/// Runs one request over a dedicated HTTP/1.1 connection.
async fn exchange<I>(
    io: I,
    request: Request<Empty<Bytes>>,
) -> Result<(StatusCode, HeaderMap, Bytes), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let mut builder = http1::Builder::new();
    builder.title_case_headers(true);
    let (mut sender, connection) = builder.handshake::<I, Empty<Bytes>>(io).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::trace!("Tracker connection closed with error: {}", e);
        }
    });

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok((parts.status, parts.headers, body))
}

/// Undoes the `Content-Encoding` the tracker applied.
///
/// # Errors
/// - `TrackerError::MalformedResponse` - Unknown encoding or corrupt compressed body
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, TrackerError> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let corrupt = |e: std::io::Error| TrackerError::MalformedResponse {
        reason: format!("Failed to decode {encoding} body: {e}"),
    };
    let mut decoded = Vec::new();
    match encoding.as_str() {
        "" | "identity" => return Ok(body.to_vec()),
        "gzip" | "x-gzip" => {
            GzDecoder::new(&body[..])
                .read_to_end(&mut decoded)
                .map_err(corrupt)?;
        }
        "deflate" => {
            ZlibDecoder::new(&body[..])
                .read_to_end(&mut decoded)
                .map_err(corrupt)?;
        }
        other => {
            return Err(TrackerError::MalformedResponse {
                reason: format!("Unsupported content encoding {other}"),
            });
        }
    }
    Ok(decoded)
}

#[async_trait]
impl TrackerTransport for HttpTrackerTransport {
    async fn announce(&self, request: TrackerRequest) -> Result<AnnounceResponse, TrackerError> {
        let target = AnnounceTarget::parse(&request)?;
        let headers = Self::build_headers(&request, &target.authority)?;
        let uri: Uri = target.path_and_query.parse().map_err(|e| {
            TrackerError::ConnectionFailed {
                url: request.announce_url.clone(),
                reason: format!("invalid request target: {e}"),
            }
        })?;

        let mut http_request = Request::new(Empty::<Bytes>::new());
        *http_request.uri_mut() = uri;
        *http_request.headers_mut() = headers;
        tracing::debug!("Announcing to tracker: {}", request.url());

        let (status, response_headers, body) =
            match tokio::time::timeout(self.timeout, self.send(&target, http_request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(reason)) => {
                    tracing::warn!("HTTP request to {} failed: {}", request.announce_url, reason);
                    return Err(TrackerError::ConnectionFailed {
                        url: request.announce_url,
                        reason,
                    });
                }
                Err(_) => {
                    tracing::warn!("HTTP request to {} timed out", request.announce_url);
                    return Err(TrackerError::Timeout {
                        url: request.announce_url,
                    });
                }
            };

        if !status.is_success() {
            tracing::warn!(
                "Tracker {} returned error status: {}",
                request.announce_url,
                status
            );
            return Err(match status.as_u16() {
                404 => TrackerError::NotFound {
                    url: request.announce_url,
                },
                code @ 500..=599 => TrackerError::ServerError {
                    url: request.announce_url,
                    status: code,
                },
                code => TrackerError::UnexpectedStatus {
                    url: request.announce_url,
                    status: code,
                },
            });
        }

        decode_body(&response_headers, body)
            .and_then(|body| parse_announce_response(&body))
            .inspect_err(|e| {
                tracing::warn!(
                    "Failed to parse response from {}: {}",
                    request.announce_url,
                    e
                );
            })
    }
}

/// Decodes a bencoded announce response.
///
/// `interval` is required; `min interval`, `complete` and `incomplete`
/// are optional and default to absent or zero.
///
/// # Errors
/// - `TrackerError::TrackerFailure` - The dictionary carries a `failure reason`
/// - `TrackerError::MalformedResponse` - Not bencode, not a dictionary, or no valid interval
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let parsed = bencode_rs::Value::parse(body).map_err(|e| TrackerError::MalformedResponse {
        reason: format!("Failed to parse tracker response: {e:?}"),
    })?;

    let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
        return Err(TrackerError::MalformedResponse {
            reason: "Tracker response is not a dictionary".to_string(),
        });
    };

    if let Some(bencode_rs::Value::Bytes(failure_reason)) = dict.get(b"failure reason".as_slice()) {
        return Err(TrackerError::TrackerFailure {
            reason: String::from_utf8_lossy(failure_reason).to_string(),
        });
    }

    let interval = match dict.get(b"interval".as_slice()) {
        Some(bencode_rs::Value::Integer(val)) if *val >= 0 => Duration::from_secs(*val as u64),
        Some(_) => {
            return Err(TrackerError::MalformedResponse {
                reason: "Invalid interval in tracker response".to_string(),
            });
        }
        None => {
            return Err(TrackerError::MalformedResponse {
                reason: "Missing interval in tracker response".to_string(),
            });
        }
    };

    let min_interval = match dict.get(b"min interval".as_slice()) {
        Some(bencode_rs::Value::Integer(val)) if *val >= 0 => {
            Some(Duration::from_secs(*val as u64))
        }
        _ => None,
    };

    let count = |key: &[u8]| match dict.get(key) {
        Some(bencode_rs::Value::Integer(val)) => u32::try_from(*val).unwrap_or(0),
        _ => 0,
    };

    Ok(AnnounceResponse {
        interval,
        min_interval,
        seeders: count(b"complete".as_slice()),
        leechers: count(b"incomplete".as_slice()),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::MirageConfig;

    #[test]
    fn test_parse_announce_response_success() {
        let body =
            b"d8:intervali1800e12:min intervali900e8:completei10e10:incompletei5e5:peers0:e";
        let response = parse_announce_response(body).unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.min_interval, Some(Duration::from_secs(900)));
        assert_eq!(response.seeders, 10);
        assert_eq!(response.leechers, 5);
    }

    #[test]
    fn test_parse_announce_response_optional_counts() {
        let response = parse_announce_response(b"d8:intervali60ee").unwrap();
        assert_eq!(response.interval, Duration::from_secs(60));
        assert_eq!(response.min_interval, None);
        assert_eq!(response.seeders, 0);
        assert_eq!(response.leechers, 0);
    }

    #[test]
    fn test_parse_announce_response_failure_reason() {
        let result = parse_announce_response(b"d14:failure reason5:errore");
        assert_eq!(
            result,
            Err(TrackerError::TrackerFailure {
                reason: "error".to_string()
            })
        );
    }

    #[test]
    fn test_parse_announce_response_malformed() {
        assert!(matches!(
            parse_announce_response(b"not bencode"),
            Err(TrackerError::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse_announce_response(b"li1ee"),
            Err(TrackerError::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse_announce_response(b"d8:completei1ee"),
            Err(TrackerError::MalformedResponse { reason }) if reason.contains("Missing interval")
        ));
        assert!(matches!(
            parse_announce_response(b"d8:intervali-5ee"),
            Err(TrackerError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let request = TrackerRequest {
            announce_url: "http://tracker.example.com/announce".to_string(),
            query: "a=b".to_string(),
            headers: vec![("Bad Header".to_string(), "x".to_string())],
        };
        assert!(HttpTrackerTransport::build_headers(&request, "tracker.example.com").is_err());

        let request = TrackerRequest {
            headers: vec![
                ("User-Agent".to_string(), "qBittorrent/4.2.5".to_string()),
                ("Accept-Encoding".to_string(), "gzip".to_string()),
            ],
            ..request
        };
        let headers =
            HttpTrackerTransport::build_headers(&request, "tracker.example.com").unwrap();
        let names: Vec<&str> = headers.keys().map(|name| name.as_str()).collect();
        assert_eq!(names, ["host", "user-agent", "accept-encoding"]);
        assert_eq!(headers["user-agent"], "qBittorrent/4.2.5");
    }

    #[test]
    fn test_descriptor_host_is_kept() {
        let request = TrackerRequest {
            announce_url: "http://tracker.example.com/announce".to_string(),
            query: "a=b".to_string(),
            headers: vec![("Host".to_string(), "tracker.example.com:80".to_string())],
        };
        let headers =
            HttpTrackerTransport::build_headers(&request, "tracker.example.com").unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["host"], "tracker.example.com:80");
    }

    #[test]
    fn test_target_keeps_rendered_query_verbatim() {
        let request = TrackerRequest {
            announce_url: "https://tracker.example.com:8443/announce.php?passkey=abc#frag"
                .to_string(),
            query: "info_hash=%AB%cd&peer_id=-qB4250-%21x".to_string(),
            headers: Vec::new(),
        };
        let target = AnnounceTarget::parse(&request).unwrap();

        assert!(target.secure);
        assert_eq!(target.host, "tracker.example.com");
        assert_eq!(target.port, 8443);
        assert_eq!(target.authority, "tracker.example.com:8443");
        assert_eq!(
            target.path_and_query,
            "/announce.php?passkey=abc&info_hash=%AB%cd&peer_id=-qB4250-%21x"
        );

        let default_port = TrackerRequest {
            announce_url: "http://tracker.example.com/announce".to_string(),
            ..request
        };
        let target = AnnounceTarget::parse(&default_port).unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.authority, "tracker.example.com");

        let udp = TrackerRequest {
            announce_url: "udp://tracker.example.com:6969/announce".to_string(),
            ..default_port
        };
        assert!(AnnounceTarget::parse(&udp).is_err());
    }

    #[test]
    fn test_decode_body_encodings() {
        let bencoded = b"d8:intervali60ee".to_vec();

        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        gzip.write_all(&bencoded).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let decoded = decode_body(&headers, Bytes::from(gzip.finish().unwrap())).unwrap();
        assert_eq!(decoded, bencoded);

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&bencoded).unwrap();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("deflate"));
        let decoded = decode_body(&headers, Bytes::from(zlib.finish().unwrap())).unwrap();
        assert_eq!(decoded, bencoded);

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert!(matches!(
            decode_body(&headers, Bytes::from(bencoded.clone())),
            Err(TrackerError::MalformedResponse { .. })
        ));

        assert_eq!(
            decode_body(&HeaderMap::new(), Bytes::from(bencoded.clone())).unwrap(),
            bencoded
        );
    }

    /// Accepts one connection, records the raw request head and replies with `response`.
    async fn serve_once(response: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buffer = [0u8; 1024];
            while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                raw.extend_from_slice(&buffer[..read]);
            }
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8(raw).unwrap()
        });
        (format!("http://{address}/announce"), server)
    }

    fn http_response(extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n{extra_headers}\
             Content-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    fn transport() -> HttpTrackerTransport {
        HttpTrackerTransport::new(&MirageConfig::for_testing().network).unwrap()
    }

    #[tokio::test]
    async fn test_wire_request_carries_only_descriptor_headers() {
        let body = b"d8:intervali1800e8:completei3e10:incompletei2ee";
        let (announce_url, server) = serve_once(http_response("", body)).await;
        let authority = announce_url
            .trim_start_matches("http://")
            .trim_end_matches("/announce")
            .to_string();

        let request = TrackerRequest {
            announce_url,
            query: "info_hash=%AB%CD&port=49152&event=started".to_string(),
            headers: vec![
                ("User-Agent".to_string(), "qBittorrent/4.2.5".to_string()),
                ("Accept-Encoding".to_string(), "gzip".to_string()),
                ("Connection".to_string(), "close".to_string()),
            ],
        };
        let response = transport().announce(request).await.unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.seeders, 3);
        assert_eq!(response.leechers, 2);

        let raw = server.await.unwrap();
        assert_eq!(
            raw,
            format!(
                "GET /announce?info_hash=%AB%CD&port=49152&event=started HTTP/1.1\r\n\
                 Host: {authority}\r\n\
                 User-Agent: qBittorrent/4.2.5\r\n\
                 Accept-Encoding: gzip\r\n\
                 Connection: close\r\n\r\n"
            )
        );
    }

    #[tokio::test]
    async fn test_wire_request_adds_no_default_headers() {
        let (announce_url, server) = serve_once(http_response("", b"d8:intervali60ee")).await;
        let request = TrackerRequest {
            announce_url,
            query: "a=b".to_string(),
            headers: Vec::new(),
        };
        transport().announce(request).await.unwrap();

        let raw = server.await.unwrap();
        let lines: Vec<&str> = raw.trim_end().split("\r\n").collect();
        assert_eq!(lines.len(), 2, "unexpected request head: {raw:?}");
        assert_eq!(lines[0], "GET /announce?a=b HTTP/1.1");
        assert!(lines[1].starts_with("Host: 127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_gzip_response_is_decoded() {
        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        gzip.write_all(b"d8:intervali900e8:completei1e10:incompletei4ee")
            .unwrap();
        let compressed = gzip.finish().unwrap();
        let (announce_url, server) =
            serve_once(http_response("Content-Encoding: gzip\r\n", &compressed)).await;

        let request = TrackerRequest {
            announce_url,
            query: "a=b".to_string(),
            headers: vec![("Accept-Encoding".to_string(), "gzip".to_string())],
        };
        let response = transport().announce(request).await.unwrap();
        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(response.leechers, 4);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_tracker_is_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let request = TrackerRequest {
            announce_url: format!("http://{address}/announce"),
            query: "a=b".to_string(),
            headers: Vec::new(),
        };
        assert!(matches!(
            transport().announce(request).await,
            Err(TrackerError::ConnectionFailed { .. })
        ));
    }
}
