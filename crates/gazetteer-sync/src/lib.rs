//! Pipeline driver: fetch every shard, merge them, and prepare the matcher inputs.

mod matcher;
mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gazetteer_core::{QueryBuilder, ShardSpec, DEFAULT_ENDPOINT, DEFAULT_SQL_TEMPLATE, MERGED_FILE_NAME};
use gazetteer_storage::{merge_shards, BackoffPolicy, HttpClientConfig, HttpFetcher, MergeSummary};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub use matcher::{MatcherError, MatcherOutcome, MatcherStage};
pub use report::{write_run_report, ArtifactDigest, MergeReport, RunReport, ShardReport};

pub const CRATE_NAME: &str = "gazetteer-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatcherConfig {
    pub program: String,
    pub training_file: PathBuf,
    pub input_file: PathBuf,
    pub settings_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub endpoint: String,
    pub sql_template: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub fetch_retries: usize,
    pub matcher: MatcherConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| PathBuf::from(var(key).unwrap_or_else(|| default.to_string()));
        Self {
            data_dir: path("GAZETTEER_DATA_DIR", "./data"),
            reports_dir: path("GAZETTEER_REPORTS_DIR", "./reports"),
            endpoint: var("GAZETTEER_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            sql_template: DEFAULT_SQL_TEMPLATE.to_string(),
            user_agent: var("GAZETTEER_USER_AGENT").unwrap_or_else(|| "gazetteer-bot/0.1".to_string()),
            http_timeout_secs: var("GAZETTEER_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            fetch_concurrency: var("GAZETTEER_FETCH_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(gazetteer_core::SHARD_COUNT),
            fetch_retries: var("GAZETTEER_FETCH_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            matcher: MatcherConfig {
                program: var("GAZETTEER_MATCHER_BIN").unwrap_or_else(|| "unionlookup".to_string()),
                training_file: path("GAZETTEER_TRAINING_FILE", "data_matching_training.json"),
                input_file: path("GAZETTEER_MATCHER_INPUT", "input.csv"),
                settings_file: path("GAZETTEER_SETTINGS_FILE", "link_settings.pickle"),
            },
        }
    }

    /// Overlay values from a YAML file on top of this config.
    pub fn with_file(mut self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.reports_dir {
            self.reports_dir = v;
        }
        if let Some(v) = file.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = file.sql_template {
            self.sql_template = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.fetch_concurrency {
            self.fetch_concurrency = v;
        }
        if let Some(v) = file.fetch_retries {
            self.fetch_retries = v;
        }
        if let Some(matcher) = file.matcher {
            if let Some(v) = matcher.program {
                self.matcher.program = v;
            }
            if let Some(v) = matcher.training_file {
                self.matcher.training_file = v;
            }
            if let Some(v) = matcher.input_file {
                self.matcher.input_file = v;
            }
            if let Some(v) = matcher.settings_file {
                self.matcher.settings_file = v;
            }
        }
        Ok(self)
    }

    pub fn shard_path(&self, shard: &ShardSpec) -> PathBuf {
        self.data_dir.join(shard.file_name())
    }

    pub fn shard_paths(&self) -> Vec<PathBuf> {
        ShardSpec::all().iter().map(|s| self.shard_path(s)).collect()
    }

    pub fn merged_path(&self) -> PathBuf {
        self.data_dir.join(MERGED_FILE_NAME)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
    endpoint: Option<String>,
    sql_template: Option<String>,
    user_agent: Option<String>,
    http_timeout_secs: Option<u64>,
    fetch_concurrency: Option<usize>,
    fetch_retries: Option<usize>,
    matcher: Option<MatcherFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatcherFile {
    program: Option<String>,
    training_file: Option<PathBuf>,
    input_file: Option<PathBuf>,
    settings_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Download shards even when their files exist.
    pub force_refetch: bool,
    /// Merge even when the merged file is newer than every shard.
    pub force_merge: bool,
    pub with_settings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Fetched,
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardOutcome {
    pub shard: ShardSpec,
    pub path: PathBuf,
    pub status: ShardStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(MergeSummary),
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub merged: PathBuf,
    pub training: PathBuf,
    pub missing: Vec<PathBuf>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Run,
    Skip,
    Blocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelinePlan {
    pub shards: Vec<(ShardSpec, PlannedAction)>,
    pub merge: PlannedAction,
    pub settings: PlannedAction,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub shards: Vec<ShardOutcome>,
    pub merge: MergeOutcome,
    pub readiness: Readiness,
    pub settings: Option<MatcherOutcome>,
    pub report_path: PathBuf,
}

impl RunSummary {
    pub fn fetched_count(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| s.status == ShardStatus::Fetched)
            .count()
    }
}

async fn modified(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(
            meta.modified()
                .with_context(|| format!("reading mtime of {}", path.display()))?,
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

/// A target is stale when it is absent, a prerequisite is absent, or a prerequisite is newer.
pub async fn is_stale(target: &Path, prerequisites: &[PathBuf]) -> Result<bool> {
    let Some(target_mtime) = modified(target).await? else {
        return Ok(true);
    };
    for prerequisite in prerequisites {
        match modified(prerequisite).await? {
            Some(mtime) if mtime <= target_mtime => {}
            _ => return Ok(true),
        }
    }
    Ok(false)
}

pub struct Pipeline {
    config: PipelineConfig,
    queries: QueryBuilder,
    http: Arc<HttpFetcher>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let queries = QueryBuilder::new(&config.endpoint, config.sql_template.clone())
            .context("building shard query")?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            concurrency: config.fetch_concurrency,
            backoff: BackoffPolicy {
                max_retries: config.fetch_retries,
                ..Default::default()
            },
        })?;
        Ok(Self {
            config,
            queries,
            http: Arc::new(http),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shard_urls(&self) -> Vec<(ShardSpec, Url)> {
        ShardSpec::all()
            .into_iter()
            .map(|shard| (shard, self.queries.shard_url(&shard)))
            .collect()
    }

    pub fn matcher_stage(&self) -> MatcherStage {
        MatcherStage::new(&self.config.matcher, self.config.merged_path())
    }

    /// Download every shard whose file is missing. Fetches run concurrently up to the configured
    /// limit; a failure stops the pipeline once in-flight fetches settle.
    pub async fn fetch_shards(&self, force_refetch: bool) -> Result<Vec<ShardOutcome>> {
        fs::create_dir_all(&self.config.data_dir)
            .await
            .with_context(|| format!("creating {}", self.config.data_dir.display()))?;

        let mut outcomes = Vec::new();
        let mut tasks = JoinSet::new();

        for (shard, url) in self.shard_urls() {
            let path = self.config.shard_path(&shard);
            if !force_refetch && fs::try_exists(&path).await.unwrap_or(false) {
                info!(shard = shard.index, path = %path.display(), "shard cached");
                outcomes.push(ShardOutcome {
                    shard,
                    path,
                    status: ShardStatus::Cached,
                });
                continue;
            }

            let http = Arc::clone(&self.http);
            tasks.spawn(async move {
                let result = http.fetch_to_file(&url, &path).await;
                (shard, path, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (shard, path, result) = joined.context("shard fetch task panicked")?;
            match result {
                Ok(_) => outcomes.push(ShardOutcome {
                    shard,
                    path,
                    status: ShardStatus::Fetched,
                }),
                Err(err) => {
                    warn!(shard = shard.index, error = %err, "shard fetch failed");
                    if first_error.is_none() {
                        first_error = Some(
                            anyhow::Error::new(err)
                                .context(format!("fetching shard {} (offset {})", shard.index, shard.offset)),
                        );
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        outcomes.sort_by_key(|o| o.shard.index);
        Ok(outcomes)
    }

    pub async fn merge(&self, force: bool) -> Result<MergeOutcome> {
        let shards = self.config.shard_paths();
        let merged = self.config.merged_path();
        if !force && !is_stale(&merged, &shards).await? {
            info!(path = %merged.display(), "merged dataset up to date");
            return Ok(MergeOutcome::UpToDate);
        }
        let summary = merge_shards(&shards, &merged)
            .await
            .with_context(|| format!("merging shards into {}", merged.display()))?;
        Ok(MergeOutcome::Merged(summary))
    }

    pub async fn readiness(&self) -> Result<Readiness> {
        let merged = self.config.merged_path();
        let training = self.config.matcher.training_file.clone();
        let mut missing = Vec::new();
        for path in [&merged, &training] {
            if !fs::try_exists(path)
                .await
                .with_context(|| format!("checking {}", path.display()))?
            {
                missing.push(path.clone());
            }
        }
        Ok(Readiness {
            merged,
            training,
            missing,
        })
    }

    /// Report what `run` would do. Only reads file metadata.
    pub async fn plan(&self, options: RunOptions) -> Result<PipelinePlan> {
        let mut shards = Vec::new();
        for shard in ShardSpec::all() {
            let exists = fs::try_exists(self.config.shard_path(&shard)).await.unwrap_or(false);
            let action = if options.force_refetch || !exists {
                PlannedAction::Run
            } else {
                PlannedAction::Skip
            };
            shards.push((shard, action));
        }

        let any_fetch = shards.iter().any(|(_, a)| *a == PlannedAction::Run);
        let merge = if options.force_merge
            || any_fetch
            || is_stale(&self.config.merged_path(), &self.config.shard_paths()).await?
        {
            PlannedAction::Run
        } else {
            PlannedAction::Skip
        };

        let stage = self.matcher_stage();
        let settings = if !stage.inputs_present_besides_merged().await {
            PlannedAction::Blocked
        } else if merge == PlannedAction::Run || stage.is_stale().await? {
            PlannedAction::Run
        } else {
            PlannedAction::Skip
        };

        Ok(PipelinePlan {
            shards,
            merge,
            settings,
        })
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "pipeline run started");

        let shards = self.fetch_shards(options.force_refetch).await?;
        let fetched_any = shards.iter().any(|s| s.status == ShardStatus::Fetched);
        let merge = self.merge(options.force_merge || fetched_any).await?;

        let readiness = self.readiness().await?;
        if readiness.is_ready() {
            info!(merged = %readiness.merged.display(), training = %readiness.training.display(), "matcher inputs ready");
        } else {
            warn!(missing = ?readiness.missing, "matcher inputs incomplete");
        }

        let settings = if options.with_settings {
            Some(self.matcher_stage().run(false).await?)
        } else {
            None
        };

        let finished_at = Utc::now();
        let report = RunReport::collect(run_id, started_at, finished_at, &shards, &merge, &self.config).await?;
        let report_path = write_run_report(&self.config.reports_dir, &report).await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            shards,
            merge,
            readiness,
            settings,
            report_path,
        })
    }
}

pub async fn run_once_from_env(options: RunOptions) -> Result<RunSummary> {
    Pipeline::new(PipelineConfig::from_env())?.run(options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;
    use tempfile::tempdir;

    fn touch(path: &Path, mtime: SystemTime) {
        std::fs::write(path, "x\n").unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn env_defaults() {
        let config = PipelineConfig::from_lookup(|_| None);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.fetch_concurrency, 7);
        assert_eq!(config.fetch_retries, 0);
        assert_eq!(config.matcher.program, "unionlookup");
        assert_eq!(config.merged_path(), PathBuf::from("./data/opdr_local.csv"));
        assert_eq!(config.shard_paths().len(), 7);
    }

    #[test]
    fn env_overrides_are_applied() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GAZETTEER_DATA_DIR", "/tmp/opdr"),
            ("GAZETTEER_FETCH_CONCURRENCY", "1"),
            ("GAZETTEER_FETCH_RETRIES", "not-a-number"),
            ("GAZETTEER_MATCHER_BIN", "/opt/bin/unionlookup"),
        ]);
        let config = PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/opdr"));
        assert_eq!(config.fetch_concurrency, 1);
        assert_eq!(config.fetch_retries, 0);
        assert_eq!(config.matcher.program, "/opt/bin/unionlookup");
    }

    #[test]
    fn yaml_file_overlays_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gazetteer.yaml");
        std::fs::write(
            &path,
            "endpoint: http://127.0.0.1:8001/opdr.csv\nfetch_retries: 2\nmatcher:\n  settings_file: out/settings.bin\n",
        )
        .unwrap();

        let config = PipelineConfig::from_lookup(|_| None).with_file(&path).unwrap();
        assert_eq!(config.endpoint, "http://127.0.0.1:8001/opdr.csv");
        assert_eq!(config.fetch_retries, 2);
        assert_eq!(config.matcher.settings_file, PathBuf::from("out/settings.bin"));
        assert_eq!(config.matcher.program, "unionlookup");
    }

    #[test]
    fn yaml_file_rejects_unknown_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gazetteer.yaml");
        std::fs::write(&path, "shard_size: 10\n").unwrap();
        assert!(PipelineConfig::from_lookup(|_| None).with_file(&path).is_err());
    }

    #[test]
    fn bad_template_fails_at_construction() {
        let mut config = PipelineConfig::from_lookup(|_| None);
        config.sql_template = "select * from lm_data".into();
        assert!(Pipeline::new(config).is_err());
    }

    #[tokio::test]
    async fn staleness_follows_modification_times() {
        let dir = tempdir().unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let target = dir.path().join("opdr_local.csv");
        let a = dir.path().join("opdr_local_0.csv");
        let b = dir.path().join("opdr_local_1.csv");

        touch(&a, base);
        touch(&b, base);
        assert!(is_stale(&target, &[a.clone(), b.clone()]).await.unwrap());

        touch(&target, base + Duration::from_secs(10));
        assert!(!is_stale(&target, &[a.clone(), b.clone()]).await.unwrap());

        touch(&b, base + Duration::from_secs(10));
        assert!(!is_stale(&target, &[a.clone(), b.clone()]).await.unwrap());

        touch(&b, base + Duration::from_secs(20));
        assert!(is_stale(&target, &[a.clone(), b.clone()]).await.unwrap());

        std::fs::remove_file(&b).unwrap();
        assert!(is_stale(&target, &[a, b]).await.unwrap());
    }
}
