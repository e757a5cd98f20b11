use crate::analysis::Analyser;
use crate::buster::{BustedRequest, CacheBuster};
use crate::h2time::{H2Time, H2TimeConfig};
use crate::headers::cache_status;
use crate::store::Store;
use crate::wcd::{attack_url, responses_identical};
use cachetime_core::{
    CacheStatus, Crawl, Error, PlainHttp, Result, RunStats, Sample, SampleBundle, TimedRequest,
    WcdMode,
};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0";

/// Which experiment drives the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentKind {
    /// Header-confirmed cache discovery: probe cacheability first.
    Preliminary,
    /// Timing-only discovery for deployments that scrub cache headers.
    HiddenCaches,
    /// Web Cache Deception scan over the payload modes.
    Wcd,
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Measurement pairs per round.
    pub request_pairs: usize,
    /// Gap between pairs inside a round.
    pub inter_request_time: Duration,
    /// Wall-clock budget per engine round.
    pub round_timeout: Duration,
    /// Timeout for ordinary (non-timed) fetches.
    pub plain_timeout: Duration,
    /// Pause between phases (the priming pause doubles it).
    pub inter_round_pause: Duration,
    /// Priming attempts before giving up on a HIT.
    pub prime_retries: usize,
    /// Redirect hops tolerated per round before abandoning.
    pub max_redirects: usize,
    /// Minimum usable fixed-round samples for a verdict.
    pub min_usable_fixed: usize,
    /// Identicality tolerance; 0 demands byte-identical bodies.
    pub noise: f64,
    /// Static-file extensions exercised by the WCD scan.
    pub extensions: Vec<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            request_pairs: 10,
            inter_request_time: Duration::from_millis(100),
            round_timeout: Duration::from_secs(30),
            plain_timeout: Duration::from_secs(30),
            inter_round_pause: Duration::from_millis(500),
            prime_retries: 5,
            max_redirects: 5,
            min_usable_fixed: 5,
            noise: 0.0,
            extensions: vec![".css".to_string()],
        }
    }
}

/// Resolve a `Location` header against the URL that produced it,
/// preserving scheme and authority for relative targets.
pub fn resolve_location(request_url: &str, location: &str) -> Result<String> {
    let base = url::Url::parse(request_url)
        .map_err(|e| Error::Crawl(format!("invalid url {request_url}: {e}")))?;
    let resolved = base
        .join(location)
        .map_err(|e| Error::Crawl(format!("unresolvable location {location}: {e}")))?;
    Ok(resolved.to_string())
}

/// Outcome of the cacheability probe.
struct ProbeTarget {
    url: String,
    strong: bool,
}

/// Redirect-following loop state for one measurement round.
enum RoundState {
    Run(String),
    RedirectPair { url: String, hops: usize },
    Abandon,
}

/// Mode-indexed state machine driving measurement for one site.
pub struct Experiment<H: PlainHttp> {
    kind: ExperimentKind,
    config: ExperimentConfig,
    analyser: Analyser,
    client: H,
    buster: CacheBuster,
    site: String,
    stamp: String,
    base_headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    bundle: SampleBundle,
    stats: RunStats,
}

impl<H: PlainHttp> Experiment<H> {
    pub fn new(
        kind: ExperimentKind,
        site: &str,
        client: H,
        config: ExperimentConfig,
        analyser: Analyser,
        buster: CacheBuster,
        cookies: BTreeMap<String, String>,
    ) -> Self {
        let base_headers = BTreeMap::from([
            ("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string()),
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
            ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
        ]);
        let mut stats = RunStats::new(site);
        if kind == ExperimentKind::Wcd {
            stats.vulnerable = Some(false);
        }
        Experiment {
            kind,
            config,
            analyser,
            client,
            buster,
            site: site.to_string(),
            stamp: chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string(),
            base_headers,
            cookies,
            bundle: SampleBundle::new(),
            stats,
        }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn bundle(&self) -> &SampleBundle {
        &self.bundle
    }

    /// Adopt statistics from a previous run (resume / retest handling).
    pub fn restore_stats(&mut self, stats: RunStats) {
        self.stats = stats;
    }

    /// Persist everything gathered so far: crawl frontier, statistics and
    /// the sample bundle.
    pub fn checkpoint(&self, crawler: &impl Crawl, store: &Store) -> Result<()> {
        store.save_logs(&self.site, &crawler.queue(), &crawler.visited())?;
        store.save_stats(&self.stats)?;
        store.save_bundle(&self.site, &self.stamp, &self.bundle)?;
        Ok(())
    }

    fn observe(&mut self, headers: &BTreeMap<String, String>) {
        // Evidence from either side of any response counts.
        if cache_status(headers) != CacheStatus::None {
            self.stats.cache_headers = true;
        }
    }

    fn timed_request(busted: &BustedRequest) -> Result<TimedRequest> {
        let mut req = TimedRequest::get(&busted.url)?;
        req.headers = busted.headers.clone();
        if !busted.cookies.is_empty() {
            let cookie = busted
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            req.set_header("cookie", &cookie);
        }
        Ok(req)
    }

    /// Drain the crawl queue, checkpointing after every URL.
    pub async fn run_site<C: Crawl>(&mut self, crawler: &mut C, store: Option<&Store>) -> Result<()> {
        while crawler.should_continue() {
            let Some(url) = crawler.get_url_from_queue() else {
                break;
            };
            if crawler.is_visited(&url) {
                continue;
            }
            crawler.add_to_visited(&url);
            tracing::info!(%url, "testing");

            if let Err(e) = self.run_url(&url, crawler).await {
                tracing::warn!(%url, error = %e, "url failed");
                self.stats.record_error(&url, &e);
            }

            if let Some(store) = store {
                self.checkpoint(crawler, store)?;
            }
        }

        self.stats.tested = true;
        if let Some(store) = store {
            store.save_stats(&self.stats)?;
        }
        Ok(())
    }

    /// Full state machine for one candidate URL.
    pub async fn run_url(&mut self, url: &str, crawler: &mut dyn Crawl) -> Result<()> {
        // WARM: one ordinary GET records Vary and feeds the frontier.
        let warm = self
            .client
            .get(url, &self.base_headers, &self.cookies, self.config.plain_timeout, true)
            .await?;
        let vary = warm.header("vary").unwrap_or("").to_string();
        self.observe(&warm.headers);
        for link in crawler.get_links(url, &warm.text) {
            crawler.add_to_queue(&link);
        }

        match self.kind {
            ExperimentKind::Preliminary => {
                let Some(probe) = self.probe_cache(url, &vary).await? else {
                    tracing::info!(%url, "no cacheability evidence, abandoning");
                    return Ok(());
                };
                self.measure(&probe.url, "", WcdMode::Direct, &vary, probe.strong)
                    .await?;
            }
            ExperimentKind::HiddenCaches => {
                self.measure(url, "", WcdMode::Direct, &vary, false).await?;
            }
            ExperimentKind::Wcd => {
                let extensions = self.config.extensions.clone();
                for extension in &extensions {
                    for mode in WcdMode::attack_modes() {
                        if self.identical_endpoint(url, *mode, extension).await? {
                            tracing::info!(%url, %mode, "attack responses identical, skipping");
                            continue;
                        }
                        self.measure(url, extension, *mode, &vary, false).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// PROBE_CACHE: confirm the URL is cacheable at all, escalating from
    /// query busting to path busting to a `.css` suffix.
    async fn probe_cache(&mut self, url: &str, vary: &str) -> Result<Option<ProbeTarget>> {
        if self.probe_variant(url, vary, false).await? {
            return Ok(Some(ProbeTarget {
                url: url.to_string(),
                strong: false,
            }));
        }
        if self.probe_variant(url, vary, true).await? {
            return Ok(Some(ProbeTarget {
                url: url.to_string(),
                strong: true,
            }));
        }
        let css = Self::with_extension(url, ".css")?;
        if self.probe_variant(&css, vary, false).await? {
            return Ok(Some(ProbeTarget {
                url: css,
                strong: false,
            }));
        }
        Ok(None)
    }

    fn with_extension(url: &str, extension: &str) -> Result<String> {
        let mut parsed =
            url::Url::parse(url).map_err(|e| Error::Crawl(format!("invalid url {url}: {e}")))?;
        let path = format!("{}{extension}", parsed.path());
        parsed.set_path(&path);
        Ok(parsed.to_string())
    }

    /// Fetch one frozen variant twice; a HIT anywhere (or a MISS→HIT pair)
    /// is cacheability evidence.
    async fn probe_variant(&mut self, url: &str, vary: &str, strong: bool) -> Result<bool> {
        self.buster.clear_fixed();
        let probe = self
            .buster
            .bust_request(url, &self.base_headers, &self.cookies, vary, strong)?;

        let r1 = self
            .client
            .get(&probe.url, &probe.headers, &probe.cookies, self.config.plain_timeout, false)
            .await?;
        let status1 = cache_status(&r1.headers);
        tokio::time::sleep(self.config.inter_round_pause).await;
        let r2 = self
            .client
            .get(&probe.url, &probe.headers, &probe.cookies, self.config.plain_timeout, false)
            .await?;
        let status2 = cache_status(&r2.headers);

        // Evidence from either response marks the site as header-bearing.
        if status1 != CacheStatus::None || status2 != CacheStatus::None {
            self.stats.cache_headers = true;
        }
        Ok(status1 == CacheStatus::Hit || status2 == CacheStatus::Hit)
    }

    /// IDENTICALITY: two independently payloaded fetches with matching
    /// bodies leave nothing for the oracle to distinguish.
    async fn identical_endpoint(
        &mut self,
        url: &str,
        mode: WcdMode,
        extension: &str,
    ) -> Result<bool> {
        let first = attack_url(&mut self.buster, url, mode, extension)?;
        let second = attack_url(&mut self.buster, url, mode, extension)?;
        let r1 = self
            .client
            .get(&first, &self.base_headers, &self.cookies, self.config.plain_timeout, true)
            .await?;
        let r2 = self
            .client
            .get(&second, &self.base_headers, &self.cookies, self.config.plain_timeout, true)
            .await?;
        Ok(responses_identical(&r1.text, &r2.text, self.config.noise))
    }

    /// RANDOMIZED_ROUND → PRIME_FIXED → FIXED_ROUND → ANALYSE for one
    /// (url, extension, mode) cell.
    async fn measure(
        &mut self,
        url: &str,
        extension: &str,
        mode: WcdMode,
        vary: &str,
        strong: bool,
    ) -> Result<()> {
        self.buster.clear_fixed();
        let target = attack_url(&mut self.buster, url, mode, extension)?;

        let randomized = self.run_round(&target, vary, strong, None).await?;
        tokio::time::sleep(self.config.inter_round_pause).await;

        // The fixed slot: for payload modes the attack URL itself, primed
        // into the cache; for direct probing a frozen busted variant.
        let fixed_request = match mode {
            WcdMode::Direct => {
                self.buster
                    .fixed_request(&target, &self.base_headers, &self.cookies, vary, strong)?
            }
            _ => BustedRequest {
                url: target.clone(),
                headers: self.base_headers.clone(),
                cookies: self.cookies.clone(),
            },
        };

        let primed = self.prime_fixed(&fixed_request).await?;
        if !primed && self.kind == ExperimentKind::Preliminary {
            tracing::info!(%target, "never observed a HIT while priming, abandoning");
            return Ok(());
        }
        tokio::time::sleep(self.config.inter_round_pause * 2).await;

        let mut fixed = self.run_round(&target, vary, strong, Some(&fixed_request)).await?;
        // The fixed slot is the suspected hit; a HIT on the randomized
        // slot means the pair measured nothing useful.
        fixed.retain(|s| s.first.cache_status != CacheStatus::Hit);

        let usable = fixed.len() >= self.config.min_usable_fixed;
        if !usable {
            tracing::info!(%target, kept = fixed.len(), "too few usable fixed samples, inconclusive");
        }

        let cell = self
            .bundle
            .entry(url.to_string())
            .or_default()
            .entry(extension.to_string())
            .or_default()
            .entry(mode.as_str().to_string())
            .or_default();
        cell.randomized = randomized;
        cell.fixed = fixed;

        if usable {
            if let Some(verdict) = self.analyser.analyse_rounds(cell) {
                if mode != WcdMode::Direct
                    && verdict.statistics_prediction == cachetime_core::Prediction::Cache
                {
                    self.stats.vulnerable = Some(true);
                }
                self.stats
                    .analysis
                    .get_or_insert_with(Default::default)
                    .entry(url.to_string())
                    .or_default()
                    .entry(extension.to_string())
                    .or_default()
                    .insert(mode.as_str().to_string(), verdict);
            }
        }
        Ok(())
    }

    /// PRIME_FIXED: replay the fixed variant until the cache owns it.
    async fn prime_fixed(&mut self, fixed: &BustedRequest) -> Result<bool> {
        for attempt in 0..self.config.prime_retries {
            let resp = self
                .client
                .get(&fixed.url, &fixed.headers, &fixed.cookies, self.config.plain_timeout, false)
                .await?;
            self.observe(&resp.headers);
            if cache_status(&resp.headers) == CacheStatus::Hit {
                tracing::debug!(url = %fixed.url, attempt, "fixed variant primed");
                return Ok(true);
            }
            tokio::time::sleep(self.config.inter_round_pause).await;
        }
        Ok(false)
    }

    /// One measurement round with redirect following. Pairs whose status
    /// is 3xx never enter the buckets; the round is rewritten and retried
    /// up to `max_redirects` times, and a location pointing back at the
    /// request URL abandons immediately.
    async fn run_round(
        &mut self,
        target: &str,
        vary: &str,
        strong: bool,
        fixed: Option<&BustedRequest>,
    ) -> Result<Vec<Sample>> {
        let mut samples = Vec::new();
        let mut state = RoundState::Run(target.to_string());

        loop {
            let (current, hops) = match state {
                RoundState::Run(ref url) => (url.clone(), 0),
                RoundState::RedirectPair { ref url, hops } => (url.clone(), hops),
                RoundState::Abandon => break,
            };
            if samples.len() >= self.config.request_pairs {
                break;
            }

            let busted1 =
                self.buster
                    .bust_request(&current, &self.base_headers, &self.cookies, vary, strong)?;
            let request1 = Self::timed_request(&busted1)?;
            let request2 = match fixed {
                Some(f) => Self::timed_request(f)?,
                None => {
                    let busted2 = self.buster.bust_request(
                        &current,
                        &self.base_headers,
                        &self.cookies,
                        vary,
                        strong,
                    )?;
                    Self::timed_request(&busted2)?
                }
            };

            let engine_config = H2TimeConfig {
                num_request_pairs: self.config.request_pairs - samples.len(),
                inter_request_time: self.config.inter_request_time,
                round_timeout: self.config.round_timeout,
            };
            let mut engine = H2Time::new(request1, request2, engine_config);
            let round = engine.run_round().await;
            engine.close().await;
            let round = round?;

            if round.is_empty() {
                break;
            }

            let redirect = round
                .last()
                .filter(|s| s.first.is_redirect())
                .and_then(|s| s.first.location().map(|l| l.to_string()));

            for sample in round {
                self.observe(&sample.first.headers);
                self.observe(&sample.second.headers);
                if !sample.first.is_redirect() && !sample.second.is_redirect() {
                    samples.push(sample);
                }
            }

            state = match redirect {
                Some(location) => {
                    let hops = hops + 1;
                    if hops > self.config.max_redirects {
                        tracing::info!(%current, "redirect budget exhausted, abandoning round");
                        RoundState::Abandon
                    } else {
                        let resolved = resolve_location(&current, &location)?;
                        if resolved == current {
                            tracing::info!(%current, "location points back at the request, abandoning");
                            RoundState::Abandon
                        } else {
                            tracing::debug!(from = %current, to = %resolved, hops, "following redirect");
                            RoundState::RedirectPair {
                                url: resolved,
                                hops,
                            }
                        }
                    }
                }
                None => RoundState::Abandon,
            };
        }

        Ok(samples)
    }
}
