use bytes::Bytes;
use cachetime_core::{Error, Result, Sample, SampleSide, TimedRequest};
use h2::client::{self, ResponseFuture};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Per-round knobs for the timing engine.
#[derive(Debug, Clone)]
pub struct H2TimeConfig {
    /// Request pairs attempted in one round.
    pub num_request_pairs: usize,
    /// Gap between pairs, keeping them independent.
    pub inter_request_time: Duration,
    /// Wall-clock budget for the whole round; on expiry the samples
    /// gathered so far are returned.
    pub round_timeout: Duration,
}

impl Default for H2TimeConfig {
    fn default() -> Self {
        H2TimeConfig {
            num_request_pairs: 3,
            inter_request_time: Duration::from_millis(100),
            round_timeout: Duration::from_secs(30),
        }
    }
}

trait IoStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> IoStream for T {}

struct Conn {
    send: client::SendRequest<Bytes>,
    driver: tokio::task::JoinHandle<()>,
}

/// Timeless-timing measurement over a single HTTP/2 connection.
///
/// Both requests of a pair are submitted back-to-back on fresh streams
/// before the connection task gets a chance to flush, so their HEADERS
/// frames leave together; the signed skew between the responses' first
/// HEADERS frames is the measurement. Shared network jitter cancels
/// because both streams ride the same connection.
pub struct H2Time {
    request1: TimedRequest,
    request2: TimedRequest,
    config: H2TimeConfig,
    conn: Option<Conn>,
}

impl H2Time {
    /// Both requests must target the same authority; the connection is
    /// opened against request 1's.
    pub fn new(request1: TimedRequest, request2: TimedRequest, config: H2TimeConfig) -> Self {
        H2Time {
            request1,
            request2,
            config,
            conn: None,
        }
    }

    fn host(&self) -> String {
        match self.request1.authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
            _ => self.request1.authority.clone(),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let host = self.host();
        let port = self.request1.port;

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| Error::Network(format!("connect {host}:{port}: {e}")))?;
        // Both HEADERS frames of a pair should share a segment when possible.
        tcp.set_nodelay(true)
            .map_err(|e| Error::Network(format!("set_nodelay: {e}")))?;

        let io: Box<dyn IoStream> = if self.request1.scheme == "https" {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Network(format!("tls protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
            tls_config.alpn_protocols = vec![b"h2".to_vec()];

            let name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| Error::Network(format!("invalid server name {host}: {e}")))?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let tls = connector
                .connect(name, tcp)
                .await
                .map_err(|e| Error::Network(format!("tls handshake with {host}: {e}")))?;

            let (_, session) = tls.get_ref();
            if session.alpn_protocol() != Some(b"h2") {
                return Err(Error::Protocol(format!("{host} did not negotiate h2")));
            }
            Box::new(tls)
        } else {
            // Prior-knowledge h2 for plaintext authorities.
            Box::new(tcp)
        };

        // Generous windows so body delivery never throttles a measurement.
        let (send, connection) = client::Builder::new()
            .initial_window_size(1 << 22)
            .initial_connection_window_size(1 << 22)
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| Error::Protocol(format!("h2 handshake: {e}")))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("h2 connection terminated: {e}");
            }
        });

        tracing::debug!("connection to {host}:{port} established");
        self.conn = Some(Conn { send, driver });
        Ok(())
    }

    /// Tear the connection down; the next pair reconnects.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.send);
            conn.driver.abort();
        }
    }

    fn build_request(req: &TimedRequest) -> Result<http::Request<()>> {
        let uri = http::Uri::builder()
            .scheme(req.scheme.as_str())
            .authority(req.authority.as_str())
            .path_and_query(req.path_and_query())
            .build()
            .map_err(|e| Error::Protocol(format!("bad uri for {}: {e}", req.url())))?;

        let mut builder = http::Request::builder().method(req.method.as_str()).uri(uri);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(())
            .map_err(|e| Error::Protocol(format!("bad request headers: {e}")))
    }

    /// Duplicate response header names collapse to one value joined with
    /// `", "`.
    fn merge_headers(headers: &http::HeaderMap) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers.iter() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            out.entry(name.as_str().to_string())
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(&value);
                })
                .or_insert(value);
        }
        out
    }

    async fn receive(fut: ResponseFuture) -> Result<(Instant, SampleSide)> {
        let response = fut
            .await
            .map_err(|e| Error::Protocol(format!("response not received: {e}")))?;
        // The future resolves when the stream's first HEADERS frame has
        // been decoded; that instant is the measurement point.
        let arrived = Instant::now();

        let (parts, mut body) = response.into_parts();
        let headers = Self::merge_headers(&parts.headers);

        let mut data = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| Error::Protocol(format!("body read: {e}")))?;
            // Release the window so the server is not throttled.
            let _ = body.flow_control().release_capacity(chunk.len());
            data.extend_from_slice(&chunk);
        }

        let cache_status = crate::headers::cache_status(&headers);
        Ok((
            arrived,
            SampleSide {
                status: parts.status.as_u16(),
                headers,
                body: String::from_utf8_lossy(&data).into_owned(),
                cache_status,
            },
        ))
    }

    /// Submit one pair and wait for both responses.
    async fn send_request_pair(&mut self) -> Result<Sample> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| Error::Protocol("connection not open".to_string()))?;

        let req1 = Self::build_request(&self.request1)?;
        let req2 = Self::build_request(&self.request2)?;

        let send = conn.send.clone();
        let mut send = send
            .ready()
            .await
            .map_err(|e| Error::Protocol(format!("connection not ready: {e}")))?;

        // Two fresh client streams, requested without yielding in between:
        // the connection task flushes both HEADERS frames in one write.
        let (fut1, _stream1) = send
            .send_request(req1, true)
            .map_err(|e| Error::Protocol(format!("send request 1: {e}")))?;
        let (fut2, _stream2) = send
            .send_request(req2, true)
            .map_err(|e| Error::Protocol(format!("send request 2: {e}")))?;
        tracing::debug!(url1 = %self.request1.url(), url2 = %self.request2.url(), "pair submitted");

        let (first, second) = tokio::join!(Self::receive(fut1), Self::receive(fut2));
        let (t1, first) = first?;
        let (t2, second) = second?;

        let time_diff = if t2 >= t1 {
            t2.duration_since(t1).as_secs_f64() * 1_000.0
        } else {
            -(t1.duration_since(t2).as_secs_f64() * 1_000.0)
        };

        Ok(Sample {
            time_diff,
            first,
            second,
        })
    }

    /// Run one measurement round. Pair-level failures close the connection
    /// and the next pair reconnects; a redirect on response 1 ends the
    /// round early so the caller can rewrite and retry.
    pub async fn run_round(&mut self) -> Result<Vec<Sample>> {
        let deadline = Instant::now() + self.config.round_timeout;
        let mut results = Vec::new();

        for _ in 0..self.config.num_request_pairs {
            tokio::time::sleep(self.config.inter_request_time).await;
            if self.conn.is_none() {
                self.connect().await?;
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                tracing::debug!("round budget exhausted");
                self.close().await;
                break;
            };

            let sample = match tokio::time::timeout(remaining, self.send_request_pair()).await {
                Ok(Ok(sample)) => sample,
                Ok(Err(e)) => {
                    tracing::warn!("pair failed: {e}");
                    self.close().await;
                    continue;
                }
                Err(_) => {
                    tracing::debug!("round budget exhausted mid-pair");
                    self.close().await;
                    break;
                }
            };

            let redirected = sample.first.location().is_some();
            results.push(sample);
            if redirected {
                // The caller decides whether to rewrite and retry.
                break;
            }
        }

        Ok(results)
    }
}

impl Drop for H2Time {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.driver.abort();
        }
    }
}
