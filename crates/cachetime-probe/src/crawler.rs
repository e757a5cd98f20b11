use cachetime_core::{Crawl, Error, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// File extensions never worth probing: static assets, media, archives.
pub const EXCLUDED_EXTENSIONS: [&str; 28] = [
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".avif", ".css", ".js", ".mjs",
    ".woff", ".woff2", ".ttf", ".otf", ".eot", ".mp4", ".webm", ".mp3", ".wav", ".pdf", ".zip",
    ".gz", ".tar", ".rar", ".7z", ".exe", ".dmg",
];

/// Same-site crawl frontier with per-domain and per-run budgets.
///
/// `max` caps the URLs taken per domain, `max_domains` caps how many
/// distinct (sub)domains the run will touch.
pub struct Crawler {
    site: String,
    queue: VecDeque<String>,
    visited: BTreeSet<String>,
    domain_counts: BTreeMap<String, usize>,
    max: usize,
    max_domains: usize,
    taken: usize,
    excluded: Vec<Regex>,
}

impl Crawler {
    pub fn new(site: &str, max: usize, max_domains: usize) -> Self {
        Crawler {
            site: site.to_string(),
            queue: VecDeque::new(),
            visited: BTreeSet::new(),
            domain_counts: BTreeMap::new(),
            max,
            max_domains,
            taken: 0,
            excluded: Vec::new(),
        }
    }

    /// Compile user-supplied exclusion patterns (comma separated).
    pub fn with_exclusions(mut self, patterns: &str) -> Result<Self> {
        for pat in patterns.split(',') {
            let pat = pat.trim();
            if pat.is_empty() {
                continue;
            }
            let re = Regex::new(pat)
                .map_err(|e| Error::Crawl(format!("bad exclude pattern {pat}: {e}")))?;
            self.excluded.push(re);
        }
        Ok(self)
    }

    /// Restore frontier state from a previous run.
    pub fn restore(&mut self, queue: Vec<String>, visited: Vec<String>) {
        self.queue = queue.into_iter().collect();
        self.visited = visited.into_iter().collect();
    }

    fn normalize(url: &str) -> Option<String> {
        let mut parsed = url::Url::parse(url).ok()?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return None;
        }
        parsed.set_fragment(None);
        Some(parsed.to_string())
    }

    fn host(url: &str) -> Option<String> {
        url::Url::parse(url)
            .ok()?
            .host_str()
            .map(|h| h.to_ascii_lowercase())
    }

    /// Hosts equal to the site or one of its subdomains are in scope.
    fn same_site(&self, host: &str) -> bool {
        let site = self.site.to_ascii_lowercase();
        host == site || host.ends_with(&format!(".{site}"))
    }

    fn has_excluded_extension(url: &str) -> bool {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_default();
        EXCLUDED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    fn is_excluded(&self, url: &str) -> bool {
        Self::has_excluded_extension(url) || self.excluded.iter().any(|re| re.is_match(url))
    }
}

impl Crawl for Crawler {
    fn should_continue(&self) -> bool {
        self.taken < self.max * self.max_domains
    }

    fn get_url_from_queue(&mut self) -> Option<String> {
        while let Some(url) = self.queue.pop_front() {
            let Some(host) = Self::host(&url) else {
                continue;
            };
            let count = self.domain_counts.get(&host).copied().unwrap_or(0);
            if count == 0 && self.domain_counts.len() >= self.max_domains {
                continue;
            }
            if count >= self.max {
                continue;
            }
            self.domain_counts.insert(host, count + 1);
            self.taken += 1;
            return Some(url);
        }
        None
    }

    fn add_to_queue(&mut self, url: &str) {
        let Some(url) = Self::normalize(url) else {
            return;
        };
        let Some(host) = Self::host(&url) else {
            return;
        };
        if !self.same_site(&host)
            || self.is_excluded(&url)
            || self.is_visited(&url)
            || self.queue.contains(&url)
        {
            return;
        }
        self.queue.push_back(url);
    }

    fn add_to_visited(&mut self, url: &str) {
        if let Some(url) = Self::normalize(url) {
            self.visited.insert(url);
        }
    }

    fn is_visited(&self, url: &str) -> bool {
        match Self::normalize(url) {
            Some(url) => self.visited.contains(&url),
            None => false,
        }
    }

    /// Extract same-site candidate links: absolute, fragment-free, deduped.
    fn get_links(&self, base: &str, html: &str) -> Vec<String> {
        let base_url = url::Url::parse(base).ok();
        let doc = html_scraper::Html::parse_document(html);
        let sel = match html_scraper::Selector::parse("a[href]") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };

        let mut out = BTreeSet::new();
        for el in doc.select(&sel) {
            let href = match el.value().attr("href") {
                Some(h) => h.trim(),
                None => continue,
            };
            if href.is_empty() {
                continue;
            }
            let href_lc = href.to_ascii_lowercase();
            if href_lc.starts_with("javascript:") || href_lc.starts_with("mailto:") {
                continue;
            }

            let abs = if let Ok(u) = url::Url::parse(href) {
                u
            } else if let Some(b) = &base_url {
                match b.join(href) {
                    Ok(u) => u,
                    Err(_) => continue,
                }
            } else {
                continue;
            };

            let mut u = abs;
            u.set_fragment(None);
            let url = u.to_string();
            let Some(host) = Self::host(&url) else {
                continue;
            };
            if !self.same_site(&host) || self.is_excluded(&url) {
                continue;
            }
            out.insert(url);
        }

        out.into_iter().collect()
    }

    fn queue(&self) -> Vec<String> {
        self.queue.iter().cloned().collect()
    }

    fn visited(&self) -> Vec<String> {
        self.visited.iter().cloned().collect()
    }
}
