use cachetime_core::{Error, Result, RunStats, SampleBundle, Verdict};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Crawl frontier snapshot, persisted under `logs/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlLogs {
    pub queue: Vec<String>,
    pub visited: Vec<String>,
}

/// Artifact layout rooted at one directory:
/// `logs/`, `stats/`, `output/` and `analysis/` subdirectories.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Store { root: root.into() }
    }

    /// Write-then-rename so sibling processes never observe a torn file.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Persist(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent).map_err(|e| Error::Persist(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| Error::Persist(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| Error::Persist(e.to_string()))?;
        Ok(())
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::Persist(e.to_string()))?;
        Self::write_atomic(path, &bytes)
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).map_err(|e| Error::Persist(e.to_string()))?;
        let value = serde_json::from_slice(&bytes).map_err(|e| Error::Persist(e.to_string()))?;
        Ok(Some(value))
    }

    fn logs_path(&self, site: &str) -> PathBuf {
        self.root.join("logs").join(format!("{site}-logs.json"))
    }

    fn stats_path(&self, site: &str) -> PathBuf {
        self.root.join("stats").join(format!("{site}-stats.json"))
    }

    pub fn save_logs(&self, site: &str, queue: &[String], visited: &[String]) -> Result<()> {
        let logs = CrawlLogs {
            queue: queue.to_vec(),
            visited: visited.to_vec(),
        };
        Self::write_json(&self.logs_path(site), &logs)
    }

    pub fn load_logs(&self, site: &str) -> Result<Option<CrawlLogs>> {
        Self::read_json(&self.logs_path(site))
    }

    pub fn save_stats(&self, stats: &RunStats) -> Result<()> {
        Self::write_json(&self.stats_path(&stats.site), stats)
    }

    pub fn load_stats(&self, site: &str) -> Result<Option<RunStats>> {
        Self::read_json(&self.stats_path(site))
    }

    /// One output file per run, stamped at experiment start and rewritten
    /// after every URL.
    pub fn save_bundle(&self, site: &str, stamp: &str, bundle: &SampleBundle) -> Result<PathBuf> {
        let path = self
            .root
            .join("output")
            .join(format!("{site}-{stamp}.json"));
        Self::write_json(&path, bundle)?;
        Ok(path)
    }

    pub fn load_bundle(path: &Path) -> Result<SampleBundle> {
        Self::read_json(path)?
            .ok_or_else(|| Error::Persist(format!("no such bundle: {}", path.display())))
    }

    /// Flat per-cell verdict, named after the request-pair count; multi-cell
    /// bundles qualify the name with extension and mode.
    pub fn save_analysis(
        &self,
        site: &str,
        request_pairs: usize,
        qualifier: Option<&str>,
        verdict: &Verdict,
    ) -> Result<PathBuf> {
        let name = match qualifier {
            Some(q) => format!("{site}-{q}-{request_pairs}.json"),
            None => format!("{site}-{request_pairs}.json"),
        };
        let path = self.root.join("analysis").join(name);
        Self::write_json(&path, verdict)?;
        Ok(path)
    }

    /// Sites already analysed at this request-pair count.
    pub fn analysed_sites(&self, request_pairs: usize) -> Vec<String> {
        let suffix = format!("-{request_pairs}.json");
        let Ok(entries) = fs::read_dir(self.root.join("analysis")) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.strip_suffix(&suffix).map(|s| s.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachetime_core::{AnalysisRow, CacheStatus, Label, Prediction};

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        (dir, store)
    }

    #[test]
    fn logs_round_trip() {
        let (_dir, store) = store();
        store
            .save_logs(
                "example.com",
                &["https://example.com/q".to_string()],
                &["https://example.com/v".to_string()],
            )
            .unwrap();
        let logs = store.load_logs("example.com").unwrap().unwrap();
        assert_eq!(logs.queue, vec!["https://example.com/q"]);
        assert_eq!(logs.visited, vec!["https://example.com/v"]);
        assert!(store.load_logs("other.com").unwrap().is_none());
    }

    #[test]
    fn stats_round_trip_keeps_optional_fields_out() {
        let (dir, store) = store();
        let stats = RunStats::new("example.com");
        store.save_stats(&stats).unwrap();

        let raw = std::fs::read_to_string(
            dir.path().join("stats").join("example.com-stats.json"),
        )
        .unwrap();
        assert!(!raw.contains("vulnerable"));
        assert!(!raw.contains("errors"));

        let loaded = store.load_stats("example.com").unwrap().unwrap();
        assert_eq!(loaded.site, "example.com");
        assert!(!loaded.tested);
    }

    #[test]
    fn bundle_file_is_stamped_and_rewritten_in_place() {
        let (_dir, store) = store();
        let bundle = SampleBundle::new();
        let p1 = store
            .save_bundle("example.com", "2024-01-02-03-04-05", &bundle)
            .unwrap();
        let p2 = store
            .save_bundle("example.com", "2024-01-02-03-04-05", &bundle)
            .unwrap();
        assert_eq!(p1, p2);
        assert!(p1
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("example.com-2024-01-02-03-04-05"));
        assert_eq!(Store::load_bundle(&p1).unwrap().len(), 0);
    }

    #[test]
    fn no_tmp_file_survives_a_write() {
        let (dir, store) = store();
        store.save_logs("example.com", &[], &[]).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str().unwrap().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn analysis_naming_and_listing() {
        let (_dir, store) = store();
        let verdict = Verdict {
            label: Label::Unknown,
            statistics_prediction: Prediction::NoCache,
            randomized: vec![AnalysisRow {
                time_diff: 0.5,
                cache_status_1: CacheStatus::None,
                cache_status_2: CacheStatus::None,
            }],
            fixed: vec![],
        };
        let path = store.save_analysis("example.com", 10, None, &verdict).unwrap();
        assert!(path.ends_with("analysis/example.com-10.json"));
        let qualified = store
            .save_analysis("example.com", 10, Some(".css-path_parameter"), &verdict)
            .unwrap();
        assert!(qualified
            .to_str()
            .unwrap()
            .contains("example.com-.css-path_parameter-10.json"));

        let sites = store.analysed_sites(10);
        assert!(sites.contains(&"example.com".to_string()));
    }
}
