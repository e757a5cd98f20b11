use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// DNS, connect, TLS or read-timeout failures.
    #[error("network error: {0}")]
    Network(String),
    /// HTTP/2 framing, header compression or unexpected-stream failures.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Unexpected HTTP status (non-2xx other than handled 3xx).
    #[error("http status {0}")]
    Http(u16),
    #[error("crawl error: {0}")]
    Crawl(String),
    #[error("analysis error: {0}")]
    Analysis(String),
    #[error("persist error: {0}")]
    Persist(String),
}

impl Error {
    /// Stable taxonomy name, used in persisted error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Network(_) => "network",
            Error::Protocol(_) => "protocol",
            Error::Http(_) => "http",
            Error::Crawl(_) => "crawl",
            Error::Analysis(_) => "analysis",
            Error::Persist(_) => "persist",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A request bound for the timing engine: parsed URL parts plus an ordered
/// header map. Headers here are regular headers only; the pseudo-header
/// tuple is derived and always precedes them on the wire.
#[derive(Debug, Clone)]
pub struct TimedRequest {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub port: u16,
    pub path: String,
    pub query: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl TimedRequest {
    pub fn get(url: &str) -> Result<Self> {
        let mut req = TimedRequest {
            method: "GET".to_string(),
            scheme: String::new(),
            authority: String::new(),
            port: 0,
            path: String::new(),
            query: String::new(),
            headers: BTreeMap::new(),
            body: None,
        };
        req.set_url(url)?;
        Ok(req)
    }

    /// Re-point the request at a different absolute URL, keeping headers.
    pub fn set_url(&mut self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url).map_err(|e| Error::Crawl(format!("invalid url {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Crawl(format!("url has no host: {url}")))?;
        self.scheme = parsed.scheme().to_string();
        self.port = parsed
            .port()
            .unwrap_or(if self.scheme == "https" { 443 } else { 80 });
        // :authority keeps an explicit non-default port, mirroring the URL netloc.
        self.authority = match parsed.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.to_string(),
        };
        self.path = parsed.path().to_string();
        self.query = parsed.query().unwrap_or("").to_string();
        Ok(())
    }

    pub fn url(&self) -> String {
        let mut out = format!("{}://{}{}", self.scheme, self.authority, self.path);
        if !self.query.is_empty() {
            out.push('?');
            out.push_str(&self.query);
        }
        out
    }

    /// `:path` value: path plus query, never empty.
    pub fn path_and_query(&self) -> String {
        let mut p = self.path.clone();
        if !self.query.is_empty() {
            p.push('?');
            p.push_str(&self.query);
        }
        if p.is_empty() {
            p.push('/');
        }
        p
    }

    /// The pseudo-header tuple, in transmission order.
    pub fn pseudo_headers(&self) -> [(&'static str, String); 4] {
        [
            (":method", self.method.clone()),
            (":authority", self.authority.clone()),
            (":scheme", self.scheme.clone()),
            (":path", self.path_and_query()),
        ]
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }
}

/// Advisory cache outcome read off response headers. Never ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    #[serde(rename = "HIT")]
    Hit,
    #[serde(rename = "MISS")]
    Miss,
    #[serde(rename = "DYNAMIC")]
    Dynamic,
    #[serde(rename = "–")]
    None,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Dynamic => "DYNAMIC",
            CacheStatus::None => "–",
        };
        f.write_str(s)
    }
}

/// One side of a measured pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSide {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    pub cache_status: CacheStatus,
}

impl SampleSide {
    pub fn location(&self) -> Option<&str> {
        self.headers.get("location").map(|s| s.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// One timeless-timing measurement. `time_diff` is t₂ − t₁ in milliseconds;
/// negative means response 2 arrived first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub time_diff: f64,
    pub first: SampleSide,
    pub second: SampleSide,
}

/// The two buckets gathered for one (url, extension, mode) cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundSamples {
    pub randomized: Vec<Sample>,
    pub fixed: Vec<Sample>,
}

/// Full sample bundle, keyed url → extension → mode.
pub type SampleBundle = BTreeMap<String, BTreeMap<String, BTreeMap<String, RoundSamples>>>;

/// Header-derived corroboration for a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Unknown,
    #[serde(rename = "NO cache")]
    NoCache,
    #[serde(rename = "CACHE")]
    Cache,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Label::Unknown => "Unknown",
            Label::NoCache => "NO cache",
            Label::Cache => "CACHE",
        };
        f.write_str(s)
    }
}

/// Timing-side verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prediction {
    #[serde(rename = "NO cache")]
    NoCache,
    #[serde(rename = "CACHE")]
    Cache,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Prediction::NoCache => "NO cache",
            Prediction::Cache => "CACHE",
        };
        f.write_str(s)
    }
}

/// Per-sample row as persisted under `analysis/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub time_diff: f64,
    pub cache_status_1: CacheStatus,
    pub cache_status_2: CacheStatus,
}

impl From<&Sample> for AnalysisRow {
    fn from(s: &Sample) -> Self {
        AnalysisRow {
            time_diff: (s.time_diff * 100.0).round() / 100.0,
            cache_status_1: s.first.cache_status,
            cache_status_2: s.second.cache_status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub label: Label,
    pub statistics_prediction: Prediction,
    pub randomized: Vec<AnalysisRow>,
    pub fixed: Vec<AnalysisRow>,
}

/// URL payload shapes used to probe a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WcdMode {
    /// The URL as-is; baseline "is there a cache?" probing.
    Direct,
    /// `/…/<tok>.ext` appended as an extra path segment.
    PathParameter,
    /// `%3F<tok>.ext` appended (encoded `?`).
    EncodedQuestion,
    /// `%3B<tok>.ext` appended (encoded `;`).
    EncodedSemicolon,
}

impl WcdMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WcdMode::Direct => "direct",
            WcdMode::PathParameter => "path_parameter",
            WcdMode::EncodedQuestion => "encoded_question",
            WcdMode::EncodedSemicolon => "encoded_semicolon",
        }
    }

    /// The payload modes exercised by a vulnerability scan.
    pub fn attack_modes() -> &'static [WcdMode] {
        &[
            WcdMode::PathParameter,
            WcdMode::EncodedQuestion,
            WcdMode::EncodedSemicolon,
        ]
    }
}

impl fmt::Display for WcdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response from a non-timed fetch.
#[derive(Debug, Clone)]
pub struct PlainResponse {
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub text: String,
}

impl PlainResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// Ordinary (non-timed) HTTP client used for warm-up, priming and the
/// identicality pre-check.
#[async_trait::async_trait]
pub trait PlainHttp: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        cookies: &BTreeMap<String, String>,
        timeout: Duration,
        allow_redirects: bool,
    ) -> Result<PlainResponse>;
}

/// Crawl-side collaborator consumed by the experiment controller.
pub trait Crawl {
    /// False once the per-run URL or domain budget is exhausted.
    fn should_continue(&self) -> bool;
    fn get_url_from_queue(&mut self) -> Option<String>;
    fn add_to_queue(&mut self, url: &str);
    fn add_to_visited(&mut self, url: &str);
    fn is_visited(&self, url: &str) -> bool;
    /// Extract same-site candidate links from an HTML document.
    fn get_links(&self, base: &str, html: &str) -> Vec<String>;
    fn queue(&self) -> Vec<String>;
    fn visited(&self) -> Vec<String>;
}

/// One recorded round-level failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub error: String,
}

/// Per-site analysis map as persisted under `stats/`.
pub type AnalysisMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, Verdict>>>;

/// Run statistics persisted to `stats/<site>-stats.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub site: String,
    pub cache_headers: bool,
    pub tested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerable: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisMap>,
}

impl RunStats {
    pub fn new(site: &str) -> Self {
        RunStats {
            site: site.to_string(),
            cache_headers: false,
            tested: false,
            vulnerable: None,
            errors: Vec::new(),
            analysis: None,
        }
    }

    pub fn record_error(&mut self, url: &str, err: &Error) {
        self.errors.push(ErrorRecord {
            url: url.to_string(),
            kind: err.kind().to_string(),
            error: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_parts_with_default_ports() {
        let r = TimedRequest::get("https://example.com/profile?x=1").unwrap();
        assert_eq!(r.scheme, "https");
        assert_eq!(r.authority, "example.com");
        assert_eq!(r.port, 443);
        assert_eq!(r.path, "/profile");
        assert_eq!(r.query, "x=1");

        let r = TimedRequest::get("http://example.com/").unwrap();
        assert_eq!(r.port, 80);
    }

    #[test]
    fn keeps_explicit_port_in_authority() {
        let r = TimedRequest::get("http://127.0.0.1:8443/a").unwrap();
        assert_eq!(r.port, 8443);
        assert_eq!(r.authority, "127.0.0.1:8443");
        assert_eq!(r.url(), "http://127.0.0.1:8443/a");
    }

    #[test]
    fn path_and_query_never_empty() {
        let r = TimedRequest::get("https://example.com").unwrap();
        assert_eq!(r.path_and_query(), "/");
        let r = TimedRequest::get("https://example.com/p?a=b").unwrap();
        assert_eq!(r.path_and_query(), "/p?a=b");
    }

    #[test]
    fn pseudo_headers_in_transmission_order() {
        let r = TimedRequest::get("https://example.com/p").unwrap();
        let names: Vec<&str> = r.pseudo_headers().iter().map(|(k, _)| *k).collect();
        assert_eq!(names, vec![":method", ":authority", ":scheme", ":path"]);
    }

    #[test]
    fn verdict_labels_serialize_to_recorded_strings() {
        assert_eq!(serde_json::to_string(&Label::NoCache).unwrap(), "\"NO cache\"");
        assert_eq!(serde_json::to_string(&Label::Cache).unwrap(), "\"CACHE\"");
        assert_eq!(serde_json::to_string(&Label::Unknown).unwrap(), "\"Unknown\"");
        assert_eq!(serde_json::to_string(&Prediction::Cache).unwrap(), "\"CACHE\"");
        assert_eq!(serde_json::to_string(&CacheStatus::None).unwrap(), "\"–\"");
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(Error::Network("x".into()).kind(), "network");
        assert_eq!(Error::Protocol("x".into()).kind(), "protocol");
        assert_eq!(Error::Http(500).kind(), "http");
    }

    #[test]
    fn error_record_uses_type_field() {
        let mut stats = RunStats::new("example.com");
        stats.record_error("https://example.com/", &Error::Network("timeout".into()));
        let v = serde_json::to_value(&stats).unwrap();
        assert_eq!(v["errors"][0]["type"], "network");
        assert_eq!(v["errors"][0]["url"], "https://example.com/");
    }

    #[test]
    fn redirect_detection() {
        let side = SampleSide {
            status: 302,
            headers: BTreeMap::from([("location".to_string(), "/next".to_string())]),
            body: String::new(),
            cache_status: CacheStatus::None,
        };
        assert!(side.is_redirect());
        assert_eq!(side.location(), Some("/next"));
    }
}
