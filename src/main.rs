//! # repo-harvester
//!
//! Harvests source files of one language from public repositories and
//! writes a manifest labeling every file with its author and project.
//!
//! ```bash
//! # Configuration comes from the environment or a .env file
//! REPO_DIR=./repos LABELED_DATA_DIR=./data MANIFEST_FILE=./manifest.json \
//!     repo-harvester harvest
//!
//! # Point an existing manifest at a new location for the labeled files
//! repo-harvester rebase gs://bucket/abap manifest.json manifest_gs.json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use repo_harvester::git::GitCli;
use repo_harvester::github::GitHubSearch;
use repo_harvester::harvest::{HarvestPipeline, Manifest, ManifestWriter};
use repo_harvester::Config;

#[derive(Parser)]
#[command(name = "repo-harvester", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, clone and extract repositories, then write the manifest
    Harvest {
        /// Keep repositories whatever language the search service reports
        #[arg(long)]
        no_language_filter: bool,
    },
    /// Rewrite manifest file references to PREFIX/<file name>
    Rebase {
        /// New location of the labeled files, e.g. gs://bucket/data
        prefix: String,
        /// Manifest to read
        input: PathBuf,
        /// Where to write the rewritten manifest
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repo_harvester=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    match Cli::parse().command {
        Commands::Harvest { no_language_filter } => harvest(no_language_filter).await,
        Commands::Rebase {
            prefix,
            input,
            output,
        } => rebase(&prefix, input, output),
    }
}

async fn harvest(no_language_filter: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let search = GitHubSearch::new(&config.github_api_url, config.github_token.clone());
    let cloner = Arc::new(GitCli::new().shallow(config.shallow_clone));
    let mut pipeline = HarvestPipeline::from_config(&config, cloner);
    if no_language_filter {
        pipeline = pipeline.without_language_filter();
    }

    info!(manifest = %pipeline.manifest_path().display(), "Starting harvest");
    let report = pipeline.run(&search, &config.search_queries()).await?;

    println!(
        "Labeled {} files from {} authors across {} projects",
        report.total_files, report.total_authors, report.total_projects
    );
    println!(
        "Repositories: {} ({} cloned, {} reused, {} failed)",
        report.stats.repositories, report.stats.cloned, report.stats.reused, report.stats.failed
    );
    println!(
        "Files: {} matched, {} copied, {} already present, {} copy failures",
        report.stats.files_matched,
        report.stats.files_copied,
        report.stats.files_skipped_existing,
        report.stats.copy_failures
    );
    for failure in &report.failures {
        eprintln!(
            "  failed {} ({:?}): {}",
            failure.repository, failure.stage, failure.message
        );
    }
    if let Some(error) = &report.output_dir_error {
        eprintln!("  labeled-data directory unavailable: {}", error);
    }
    if !report.rejected.is_empty() {
        eprintln!("  {} label records rejected", report.rejected.len());
    }
    println!("Manifest: {}", report.manifest_path.display());
    Ok(())
}

fn rebase(prefix: &str, input: PathBuf, output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut manifest = Manifest::load(&input)?;
    manifest.rebase(prefix);

    let writer = ManifestWriter::new(output);
    writer.prepare()?;
    let path = writer.write(&manifest)?;
    info!(
        input = %input.display(),
        output = %path.display(),
        files = manifest.total_files,
        "Manifest rebased"
    );
    Ok(())
}
