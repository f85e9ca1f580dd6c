use crate::error::{Result, ScanError};
use crate::ports;
use crate::types::{Candidate, FailureKind, ProbeOutcome};
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::debug;

/// Upper bound on a diagnostic response we are willing to buffer.
const MAX_TRACE_BYTES: usize = 16 * 1024;

/// Transport retry policy applied per candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, at least one.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(100),
        }
    }
}

/// Where the diagnostic trace request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticTarget {
    pub domain: String,
    pub path: String,
}

impl Default for DiagnosticTarget {
    fn default() -> Self {
        Self {
            domain: "nip.lfree.org".to_string(),
            path: "cdn-cgi/trace".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub connect_timeout: Duration,
    /// Budget for the TLS handshake plus request/response once connected.
    pub diagnostic_timeout: Duration,
    pub retry: RetryPolicy,
    /// `None` measures raw TCP connect time only.
    pub diagnostic: Option<DiagnosticTarget>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2500),
            diagnostic_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            diagnostic: Some(DiagnosticTarget::default()),
        }
    }
}

/// Measures one candidate. Implementations must not touch shared quota or store state.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, candidate: Candidate) -> ProbeOutcome;
}

/// Whether an address may be dialed at all: private, loopback, link-local and
/// unspecified addresses are rejected.
pub fn is_probe_eligible(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()),
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified() || is_v6_local(v6)),
    }
}

fn is_v6_local(v6: Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    // fc00::/7 unique local, fe80::/10 link-local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

/// Host name that resolves to `ip` through the nip-style diagnostic domain.
pub fn hex_host(ip: Ipv4Addr, domain: &str) -> String {
    let o = ip.octets();
    format!("{:02x}{:02x}{:02x}{:02x}.{}", o[0], o[1], o[2], o[3], domain)
}

/// The fields of a trace response we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceInfo {
    pub colo: Option<String>,
    pub ip: Option<String>,
}

/// Parse `key=value` lines; unrelated keys and junk lines are ignored.
pub fn parse_trace(body: &str) -> TraceInfo {
    let mut info = TraceInfo::default();
    for line in body.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "colo" => info.colo = Some(value.to_string()),
            "ip" => info.ip = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

/// Send a trace request over an established stream and read the reply.
///
/// `Ok(None)` when the server answered with anything but a 200 carrying a colo.
pub async fn trace_exchange<S>(stream: &mut S, host: &str, path: &str) -> io::Result<Option<TraceInfo>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET /{} HTTP/1.0\r\nHost: {}\r\nUser-Agent: {}/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        path.trim_start_matches('/'),
        host,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() >= MAX_TRACE_BYTES {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return Ok(None);
    };
    let ok = head
        .lines()
        .next()
        .and_then(|status| status.split_whitespace().nth(1))
        .map(|code| code == "200")
        .unwrap_or(false);
    if !ok {
        return Ok(None);
    }
    let info = parse_trace(body);
    Ok(info.colo.is_some().then_some(info))
}

/// TCP connect prober with an optional TLS/HTTP trace on the same connection.
pub struct TcpProber {
    settings: ProbeSettings,
    tls: tokio_native_tls::TlsConnector,
}

impl TcpProber {
    pub fn new(settings: ProbeSettings) -> Result<Self> {
        // The diagnostic host is synthetic, so its certificate cannot be verified.
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ScanError::Config(format!("failed to create TLS connector: {e}")))?;
        Ok(Self {
            settings,
            tls: tokio_native_tls::TlsConnector::from(tls),
        })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    async fn diagnose(&self, stream: TcpStream, candidate: Candidate) -> Option<TraceInfo> {
        let target = self.settings.diagnostic.as_ref()?;
        let IpAddr::V4(v4) = candidate.address else {
            return None;
        };
        let host = hex_host(v4, &target.domain);
        let exchange = async {
            if ports::uses_tls(candidate.port) {
                let mut tls = self
                    .tls
                    .connect(&host, stream)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                trace_exchange(&mut tls, &host, &target.path).await
            } else {
                let mut plain = stream;
                trace_exchange(&mut plain, &host, &target.path).await
            }
        };
        match time::timeout(self.settings.diagnostic_timeout, exchange).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                debug!(%candidate, "diagnostic request failed: {e}");
                None
            }
            Err(_) => {
                debug!(%candidate, "diagnostic request timed out");
                None
            }
        }
    }
}

#[async_trait]
impl Probe for TcpProber {
    async fn probe(&self, candidate: Candidate) -> ProbeOutcome {
        if !is_probe_eligible(candidate.address) {
            return ProbeOutcome::failed(candidate, FailureKind::Invalid, 0);
        }

        let connected = connect_with_retry(
            self.settings.retry,
            self.settings.connect_timeout,
            candidate,
            || TcpStream::connect(candidate.endpoint()),
        )
        .await;
        let (stream, attempt, start) = match connected {
            Ok(c) => c,
            Err((kind, attempts)) => return ProbeOutcome::failed(candidate, kind, attempts),
        };
        let connect_ms = elapsed_ms(start);
        match self.diagnose(stream, candidate).await {
            Some(trace) => ProbeOutcome::measured(
                candidate,
                elapsed_ms(start),
                trace.colo.unwrap_or_default(),
                trace.ip,
                attempt,
            ),
            None => ProbeOutcome::measured(candidate, connect_ms, String::new(), None, attempt),
        }
    }
}

/// Dial with a per-attempt timeout, retrying transport failures under `retry`.
///
/// On success returns the stream, the attempt that succeeded and when it started.
/// On failure returns the last failure kind and the number of attempts made.
pub async fn connect_with_retry<S, F, Fut>(
    retry: RetryPolicy,
    connect_timeout: Duration,
    candidate: Candidate,
    mut connect: F,
) -> std::result::Result<(S, u32, Instant), (FailureKind, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    let attempts = retry.attempts.max(1);
    let mut last_failure = FailureKind::Transport;
    for attempt in 1..=attempts {
        let start = Instant::now();
        match time::timeout(connect_timeout, connect()).await {
            Ok(Ok(stream)) => return Ok((stream, attempt, start)),
            Ok(Err(e)) => {
                last_failure = if e.kind() == io::ErrorKind::ConnectionRefused {
                    FailureKind::Refused
                } else {
                    FailureKind::Transport
                };
                debug!(%candidate, attempt, "connect failed: {e}");
            }
            Err(_) => {
                last_failure = FailureKind::Timeout;
                debug!(%candidate, attempt, "connect timed out");
            }
        }
        if attempt < attempts {
            time::sleep(retry.delay).await;
        }
    }
    Err((last_failure, attempts))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Probe a batch with at most `concurrency` probes in flight.
///
/// Every probe runs to completion; outcomes are returned in input order.
pub async fn probe_batch(
    prober: Arc<dyn Probe>,
    candidates: &[Candidate],
    concurrency: usize,
) -> Vec<ProbeOutcome> {
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, 5_000)));
    let mut set = JoinSet::new();

    for (idx, &candidate) in candidates.iter().enumerate() {
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let prober = prober.clone();
        set.spawn(async move {
            let _permit = permit; // keep permit until task completes
            (idx, prober.probe(candidate).await)
        });
    }

    let mut slots: Vec<Option<ProbeOutcome>> = vec![None; candidates.len()];
    while let Some(res) = set.join_next().await {
        match res {
            Ok((idx, outcome)) => slots[idx] = Some(outcome),
            Err(e) => debug!("probe task aborted: {e}"),
        }
    }

    slots
        .into_iter()
        .zip(candidates)
        .map(|(slot, &c)| slot.unwrap_or_else(|| ProbeOutcome::failed(c, FailureKind::Transport, 0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[test]
    fn eligibility_rejects_local_ranges() {
        for ip in ["10.0.0.1", "172.16.5.4", "192.168.1.1", "127.0.0.1", "169.254.3.3", "0.0.0.0", "::1", "fe80::1", "fd00::1"] {
            assert!(!is_probe_eligible(ip.parse().unwrap()), "{ip} should be rejected");
        }
        for ip in ["104.16.1.1", "1.1.1.1", "2606:4700::1"] {
            assert!(is_probe_eligible(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn hex_host_encodes_octets() {
        assert_eq!(hex_host(Ipv4Addr::new(104, 16, 0, 255), "nip.example"), "681000ff.nip.example");
    }

    #[test]
    fn parse_trace_picks_fields() {
        let body = "fl=123\nh=example\nip=203.0.113.9\nts=1.0\ncolo=HKG\nbroken line\n";
        let info = parse_trace(body);
        assert_eq!(info.colo.as_deref(), Some("HKG"));
        assert_eq!(info.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(parse_trace("colo=\n"), TraceInfo::default());
    }

    #[tokio::test]
    async fn trace_exchange_reads_ok_response() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let srv = tokio::spawn(async move {
            let mut req = vec![0u8; 1024];
            let n = server.read(&mut req).await.unwrap();
            let req = String::from_utf8_lossy(&req[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nip=8.8.8.8\ncolo=SJC\n")
                .await
                .unwrap();
            drop(server);
            req
        });
        let info = trace_exchange(&mut client, "01020304.nip.example", "cdn-cgi/trace")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.colo.as_deref(), Some("SJC"));
        assert_eq!(info.ip.as_deref(), Some("8.8.8.8"));
        let req = srv.await.unwrap();
        assert!(req.starts_with("GET /cdn-cgi/trace HTTP/1.0\r\n"));
        assert!(req.contains("Host: 01020304.nip.example\r\n"));
    }

    #[tokio::test]
    async fn trace_exchange_non_200_is_none() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut req = vec![0u8; 1024];
            let _ = server.read(&mut req).await;
            let _ = server.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\ncolo=SJC\n").await;
        });
        let info = trace_exchange(&mut client, "h", "p").await.unwrap();
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn ineligible_address_is_never_dialed() {
        let prober = TcpProber::new(ProbeSettings::default()).unwrap();
        let c = Candidate::new("192.168.0.10".parse().unwrap(), 443);
        let out = prober.probe(c).await;
        assert!(!out.success);
        assert_eq!(out.failure_kind, Some(FailureKind::Invalid));
        assert_eq!(out.attempts, 0);
        assert!(out.latency_ms.is_infinite());
    }

    fn edge() -> Candidate {
        Candidate::new("104.16.0.1".parse().unwrap(), 443)
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_use_every_attempt() {
        let retry = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(100),
        };
        let calls = AtomicU32::new(0);
        let began = Instant::now();
        let res = connect_with_retry(retry, Duration::from_millis(500), edge(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<io::Result<()>>()
        })
        .await;

        assert_eq!(res.err(), Some((FailureKind::Timeout, 3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // three timeouts plus two pauses between them
        let waited = began.elapsed();
        assert!(waited >= Duration::from_millis(1700), "{waited:?}");
        assert!(waited < Duration::from_millis(1800), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn refused_reports_last_failure() {
        let calls = AtomicU32::new(0);
        let res = connect_with_retry(RetryPolicy::default(), Duration::from_secs(1), edge(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused)))
        })
        .await;
        assert_eq!(res.err(), Some((FailureKind::Refused, 2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_can_succeed() {
        let calls = AtomicU32::new(0);
        let res = connect_with_retry(RetryPolicy::default(), Duration::from_secs(1), edge(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n == 0 {
                Err(io::Error::from(io::ErrorKind::ConnectionReset))
            } else {
                Ok(7u8)
            })
        })
        .await;
        let (stream, attempt, _) = res.unwrap();
        assert_eq!((stream, attempt), (7, 2));
    }

    /// Records the highest number of probes running at once.
    #[derive(Default)]
    struct GaugeProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Probe for GaugeProbe {
        async fn probe(&self, candidate: Candidate) -> ProbeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome::measured(candidate, 20.0, String::new(), None, 1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_respects_concurrency_and_order() {
        let gauge = Arc::new(GaugeProbe::default());
        let candidates: Vec<Candidate> = (1..=10)
            .map(|port| Candidate::new("104.16.0.1".parse().unwrap(), port))
            .collect();

        let outcomes = probe_batch(gauge.clone(), &candidates, 3).await;

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 0);
        let order: Vec<Candidate> = outcomes.iter().map(|o| o.candidate).collect();
        assert_eq!(order, candidates);
        assert!(outcomes.iter().all(|o| o.success));
    }
}
