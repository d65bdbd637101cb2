use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use gazetteer_sync::{
    MatcherOutcome, MergeOutcome, Pipeline, PipelineConfig, PipelinePlan, PlannedAction, RunOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gazetteer")]
#[command(about = "Download OPDR local-union shards, merge them, and prepare union matcher inputs")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML file overriding environment configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Commands {
    /// Fetch missing shards, merge when stale, and check matcher inputs.
    Run {
        #[arg(long)]
        force_refetch: bool,
        #[arg(long)]
        force: bool,
        /// Also run the matcher once inputs are ready.
        #[arg(long)]
        with_settings: bool,
    },
    Fetch {
        #[arg(long)]
        force_refetch: bool,
    },
    Merge {
        #[arg(long)]
        force: bool,
    },
    /// Print the shard URLs.
    Urls,
    /// Show which steps a run would execute.
    Plan {
        #[arg(long)]
        force_refetch: bool,
        #[arg(long)]
        force: bool,
    },
    /// Run the external matcher to produce the settings file.
    Settings {
        #[arg(long)]
        force: bool,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Run {
            force_refetch: false,
            force: false,
            with_settings: false,
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env();
    if let Some(path) = &cli.config {
        config = config.with_file(path)?;
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn action_label(action: PlannedAction) -> &'static str {
    match action {
        PlannedAction::Run => "run",
        PlannedAction::Skip => "up-to-date",
        PlannedAction::Blocked => "blocked",
    }
}

fn print_plan(pipeline: &Pipeline, plan: &PipelinePlan) {
    for (shard, action) in &plan.shards {
        println!(
            "fetch {} (offset {}): {}",
            pipeline.config().shard_path(shard).display(),
            shard.offset,
            action_label(*action)
        );
    }
    println!(
        "merge {}: {}",
        pipeline.config().merged_path().display(),
        action_label(plan.merge)
    );
    println!(
        "settings {}: {}",
        pipeline.matcher_stage().settings_path().display(),
        action_label(plan.settings)
    );
}

fn describe_merge(merge: &MergeOutcome) -> String {
    match merge {
        MergeOutcome::Merged(summary) => format!("merged rows={}", summary.total_rows),
        MergeOutcome::UpToDate => "up-to-date".to_string(),
    }
}

fn describe_settings(outcome: &MatcherOutcome) -> String {
    match outcome {
        MatcherOutcome::Ran { settings, .. } => format!("written {}", settings.display()),
        MatcherOutcome::UpToDate => "up-to-date".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let pipeline = Pipeline::new(config)?;

    match cli.command.unwrap_or_default() {
        Commands::Run {
            force_refetch,
            force,
            with_settings,
        } => {
            let summary = pipeline
                .run(RunOptions {
                    force_refetch,
                    force_merge: force,
                    with_settings,
                })
                .await?;
            println!(
                "run complete: run_id={} fetched={} cached={} merge={} ready={} report={}",
                summary.run_id,
                summary.fetched_count(),
                summary.shards.len() - summary.fetched_count(),
                describe_merge(&summary.merge),
                summary.readiness.is_ready(),
                summary.report_path.display()
            );
            if let Some(settings) = &summary.settings {
                println!("settings: {}", describe_settings(settings));
            }
        }
        Commands::Fetch { force_refetch } => {
            let shards = pipeline.fetch_shards(force_refetch).await?;
            for outcome in shards {
                println!(
                    "{} {:?}",
                    outcome.path.display(),
                    outcome.status
                );
            }
        }
        Commands::Merge { force } => {
            let merge = pipeline.merge(force).await?;
            println!(
                "{}: {}",
                pipeline.config().merged_path().display(),
                describe_merge(&merge)
            );
        }
        Commands::Urls => {
            for (shard, url) in pipeline.shard_urls() {
                println!("{}\t{}", shard.index, url);
            }
        }
        Commands::Plan {
            force_refetch,
            force,
        } => {
            let plan = pipeline
                .plan(RunOptions {
                    force_refetch,
                    force_merge: force,
                    with_settings: false,
                })
                .await?;
            print_plan(&pipeline, &plan);
        }
        Commands::Settings { force } => {
            let outcome = pipeline.matcher_stage().run(force).await?;
            println!("settings: {}", describe_settings(&outcome));
        }
    }

    Ok(())
}
