use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gazetteer_core::ShardSpec;
use gazetteer_storage::file_sha256;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::{MergeOutcome, PipelineConfig, ShardOutcome, ShardStatus};

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDigest {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub index: usize,
    pub offset: u64,
    pub status: ShardStatus,
    pub artifact: ArtifactDigest,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub status: &'static str,
    pub total_rows: Option<u64>,
    pub shard_rows: Option<Vec<u64>>,
    pub artifact: ArtifactDigest,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub endpoint: String,
    pub shards: Vec<ShardReport>,
    pub merge: MergeReport,
}

async fn digest(path: &Path) -> Result<ArtifactDigest> {
    let (sha256, bytes) = file_sha256(path).await?;
    Ok(ArtifactDigest {
        path: path.display().to_string(),
        sha256,
        bytes,
    })
}

impl RunReport {
    pub async fn collect(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        shards: &[ShardOutcome],
        merge: &MergeOutcome,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let mut shard_reports = Vec::with_capacity(shards.len());
        for outcome in shards {
            let ShardSpec { index, offset } = outcome.shard;
            shard_reports.push(ShardReport {
                index,
                offset,
                status: outcome.status,
                artifact: digest(&outcome.path).await?,
            });
        }

        let merged = digest(&config.merged_path()).await?;
        let merge = match merge {
            MergeOutcome::Merged(summary) => MergeReport {
                status: "merged",
                total_rows: Some(summary.total_rows),
                shard_rows: Some(summary.shard_rows.clone()),
                artifact: merged,
            },
            MergeOutcome::UpToDate => MergeReport {
                status: "up_to_date",
                total_rows: None,
                shard_rows: None,
                artifact: merged,
            },
        };

        Ok(Self {
            run_id,
            started_at,
            finished_at,
            endpoint: config.endpoint.clone(),
            shards: shard_reports,
            merge,
        })
    }
}

/// Writes `<reports_dir>/<run_id>/run.json` and returns its path.
pub async fn write_run_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join("run.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
