use cachetime_core::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};

/// Request headers that are always rewritten with a unique token.
pub const TEST_HEADERS: [&str; 7] = [
    "Origin",
    "User-Agent",
    "X-Forwarded-Host",
    "X-Forwarded-For",
    "X-Forwarded-Proto",
    "X-Method-Override",
    "X-Forwarded-Scheme",
];

const ACCEPT_BASELINE: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

const TOKEN_LEN: usize = 5;
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A fully mutated request: no well-behaved shared cache can match it
/// against any previous or concurrent request.
#[derive(Debug, Clone)]
pub struct BustedRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

/// Produces guaranteed-fresh request variants. The token ledger lives for
/// the whole run so every issued token is unique across all mutations.
pub struct CacheBuster {
    rng: StdRng,
    ledger: BTreeSet<String>,
    fixed: Option<BustedRequest>,
}

impl CacheBuster {
    /// `seed` pins the PRNG for reproducible runs; otherwise it is drawn
    /// from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };
        CacheBuster {
            rng,
            ledger: BTreeSet::new(),
            fixed: None,
        }
    }

    fn random_string(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| LETTERS[self.rng.random_range(0..LETTERS.len())] as char)
            .collect()
    }

    /// A fresh alphabetic token, re-rolled until it has never been issued
    /// in this run.
    pub fn unique_token(&mut self) -> String {
        loop {
            let tok = self.random_string(TOKEN_LEN);
            if self.ledger.insert(tok.clone()) {
                return tok;
            }
        }
    }

    /// Number of tokens issued so far.
    pub fn issued(&self) -> usize {
        self.ledger.len()
    }

    /// Rewrite one header value so it can no longer match a cache key.
    /// Concatenation is used where the header grammar allows it; otherwise
    /// the token replaces the value outright.
    fn bust_header_value(&mut self, site: &str, header: &str, value: &str) -> String {
        let name = header.to_ascii_lowercase();

        if name == "user-agent" {
            return format!("{value} {}", self.unique_token());
        }
        if name == "accept-encoding" {
            if value.is_empty() {
                return self.unique_token();
            }
            return format!("{value}, {}", self.unique_token());
        }
        if name == "accept" {
            return format!("{ACCEPT_BASELINE},{}", self.unique_token());
        }
        if name == "accept-language" {
            return format!("it-IT,it;q=0.9,{}", self.unique_token());
        }
        if name == "origin" {
            return format!("https://{site}/{}", self.unique_token());
        }
        if name == "x-forwarded-scheme" || (name.contains("x-") && name.contains("forwarded-proto"))
        {
            return format!("http{}", self.unique_token());
        }
        if name.contains("x-") && name.contains("method") {
            return format!("GET{}", self.unique_token());
        }
        if (name.contains("x-") && (name.contains("forwarded") || name.contains("-url")))
            || name == "forwarded"
        {
            return format!("{}.{site}", self.unique_token());
        }

        self.unique_token()
    }

    /// Append a `<tok>=<tok>` query parameter.
    pub fn bust_query(&mut self, url: &str) -> Result<String> {
        let tok = self.unique_token();
        let mut parsed =
            url::Url::parse(url).map_err(|e| Error::Crawl(format!("invalid url {url}: {e}")))?;
        let query = match parsed.query() {
            Some(q) if !q.is_empty() => format!("{q}&{tok}={tok}"),
            _ => format!("{tok}={tok}"),
        };
        parsed.set_query(Some(&query));
        Ok(parsed.to_string())
    }

    /// Append a `/<tok>` path segment ("strong" busting for deployments
    /// that ignore the query string in their cache key).
    pub fn bust_path(&mut self, url: &str) -> Result<String> {
        let tok = self.unique_token();
        let mut parsed =
            url::Url::parse(url).map_err(|e| Error::Crawl(format!("invalid url {url}: {e}")))?;
        let path = if parsed.path().ends_with('/') {
            format!("{}{tok}", parsed.path())
        } else {
            format!("{}/{tok}", parsed.path())
        };
        parsed.set_path(&path);
        Ok(parsed.to_string())
    }

    /// Add a unique cookie, and when `bust_all` is set suffix the token
    /// onto every existing cookie value as well.
    pub fn bust_cookies(
        &mut self,
        cookies: &BTreeMap<String, String>,
        bust_all: bool,
    ) -> BTreeMap<String, String> {
        let tok = self.unique_token();
        let mut out = BTreeMap::new();
        for (name, value) in cookies {
            let value = if bust_all {
                format!("{value},{tok}")
            } else {
                value.clone()
            };
            out.insert(name.clone(), value);
        }
        out.insert(tok.clone(), tok);
        out
    }

    /// Apply every mutation in one pass: query, optional path segment, the
    /// fixed header set, cookies, and an echo of each header named by the
    /// server's `Vary` value.
    pub fn bust_request(
        &mut self,
        url: &str,
        headers: &BTreeMap<String, String>,
        cookies: &BTreeMap<String, String>,
        vary: &str,
        strong_path: bool,
    ) -> Result<BustedRequest> {
        let parsed =
            url::Url::parse(url).map_err(|e| Error::Crawl(format!("invalid url {url}: {e}")))?;
        let host = parsed.host_str().unwrap_or_default();
        // Site is the authority: an explicit port stays part of it.
        let site = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut url = url.to_string();
        if strong_path {
            url = self.bust_path(&url)?;
        }
        url = self.bust_query(&url)?;

        let mut headers = headers.clone();
        for header in TEST_HEADERS {
            let current = headers.get(header).cloned().unwrap_or_default();
            let busted = self.bust_header_value(&site, header, &current);
            headers.insert(header.to_string(), busted);
        }

        let cookies = self.bust_cookies(cookies, true);

        for name in vary.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() || name == "cookie" {
                continue;
            }
            if TEST_HEADERS.iter().any(|h| h.to_ascii_lowercase().contains(&name)) {
                continue;
            }
            let current = headers.get(&name).cloned().unwrap_or_default();
            let busted = self.bust_header_value(&site, &name, &current);
            headers.insert(name, busted);
        }

        Ok(BustedRequest {
            url,
            headers,
            cookies,
        })
    }

    /// The stable counterpart of [`bust_request`]: the first call records
    /// the mutated form, every later call replays it verbatim so a shared
    /// cache can serve it.
    pub fn fixed_request(
        &mut self,
        url: &str,
        headers: &BTreeMap<String, String>,
        cookies: &BTreeMap<String, String>,
        vary: &str,
        strong_path: bool,
    ) -> Result<BustedRequest> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }
        let busted = self.bust_request(url, headers, cookies, vary, strong_path)?;
        self.fixed = Some(busted.clone());
        Ok(busted)
    }

    /// Forget the recorded fixed variant (a new measurement cell needs a
    /// fresh one).
    pub fn clear_fixed(&mut self) {
        self.fixed = None;
    }
}
