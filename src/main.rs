use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod batch;
mod config;
mod controls;
mod extract;
mod fetcher;
mod normalize;
mod orchestrate;
mod paginate;
#[cfg(test)]
mod testing;
mod types;
mod utils;

use config::{Config, Overrides, CONFIG_PATH};
use fetcher::{HttpFetcherFactory, HttpSettings};
use normalize::{Competitors, Dataset, MarketSummary, Normalizer};
use orchestrate::{Orchestrator, ProbeOutcome, RunReport};
use paginate::AdvanceStrategy;
use types::ScrapeStatus;
use utils::{format_amount, osc8_file_link, osc8_link};

#[derive(Parser)]
#[command(name = "tender-scrape")]
#[command(about = "Procurement award scraper and market summary for offenevergaben.at")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape award listings of every configured subsidiary to CSV
    Scrape {
        /// Output directory (overrides the config file)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only these target keys, comma separated
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Page cap per target, 0 for none
        #[arg(long)]
        max_pages: Option<u32>,
        /// How to reach the next page: url or click
        #[arg(long)]
        strategy: Option<AdvanceStrategy>,
        /// Targets between summary snapshots
        #[arg(long)]
        group_size: Option<usize>,
        /// Quiet mode - suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },
    /// Check the first page of every target without saving anything
    Probe {
        /// Only these target keys, comma separated
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Validate and summarise scraped CSV files
    Analyze {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
        /// Number of suppliers and categories to list
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List configured targets
    Targets,
    /// Remove the output directory
    Clean,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn http_factory(config: &Config) -> HttpFetcherFactory {
    HttpFetcherFactory::new(HttpSettings {
        user_agent: config.user_agent.clone(),
        timeout: config.page_timeout,
        settle_delay: config.settle_delay,
    })
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;
    println!("\n{}", "=".repeat(78));
    println!("SCRAPING SUMMARY (run {})", report.stamp);
    println!("{}", "=".repeat(78));
    println!(
        "{:<45} {:>6} {:>10} {:>8}  Status",
        "Subsidiary", "Pages", "Contracts", "Dropped"
    );
    for result in &summary.results {
        let name = match &result.output_file {
            Some(path) => osc8_file_link(&path.to_string_lossy(), &result.target_name),
            None => result.target_name.clone(),
        };
        // Pad by visible width; the link escapes do not take up columns
        let padding = 45usize.saturating_sub(result.target_name.chars().count());
        println!(
            "{}{} {:>6} {:>10} {:>8}  {}",
            name,
            " ".repeat(padding),
            result.pages_visited,
            result.rows_extracted,
            result.rows_dropped,
            result.status
        );
        if let Some(detail) = &result.error_detail {
            if result.status == ScrapeStatus::Failed {
                println!("    {}", detail);
            }
        }
    }

    println!("{}", "-".repeat(78));
    let counts = summary.count_by_status();
    let statuses: Vec<String> = counts
        .iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    println!(
        "{} subsidiaries ({}), {} contracts, {} rows dropped",
        summary.total_targets(),
        statuses.join(", "),
        summary.total_rows(),
        summary.total_dropped()
    );
    if !report.snapshots.is_empty() {
        println!("{} group snapshots written", report.snapshots.len());
    }
    println!(
        "Summary: {}",
        osc8_file_link(
            &report.summary_file.to_string_lossy(),
            &report.summary_file.to_string_lossy()
        )
    );
}

fn run_scrape(config: Config, quiet: bool) -> Result<()> {
    let factory = http_factory(&config);
    let report = Orchestrator::new(&config, &factory).quiet(quiet).run()?;
    if !quiet {
        print_report(&report);
    }
    Ok(())
}

fn run_probe(config: Config) -> Result<()> {
    let factory = http_factory(&config);
    println!("Probing {} subsidiaries...\n", config.targets.len());
    let outcomes = orchestrate::probe_targets(&config, &factory, |target, outcome| {
        println!(
            "  {:<45} {}",
            osc8_link(&target.source_url, &target.display_name),
            outcome
        );
    })?;
    let with_data = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, ProbeOutcome::Rows(_)))
        .count();
    println!("\n{} of {} subsidiaries have data", with_data, outcomes.len());
    Ok(())
}

fn run_analyze(config: &Config, files: &[PathBuf], top: usize, json: bool) -> Result<()> {
    let competitors = Competitors::new(config.competitors.iter().cloned());
    if competitors.is_empty() {
        tracing::warn!("No competitors configured, every supplier counts as a non-competitor");
    } else {
        tracing::debug!(competitors = competitors.len(), "Loaded competitor list");
    }
    let normalizer = Normalizer::new(config.columns.clone(), competitors);

    let datasets = Dataset::load_all(files, &config.columns).context("No usable dataset")?;
    let records: Vec<_> = datasets
        .iter()
        .flat_map(|dataset| dataset.normalize(&normalizer))
        .collect();

    let summary = MarketSummary::from_records(&records, top);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Contracts:            {}", summary.records);
    println!(
        "Total value:          {} ({} with a value)",
        format_amount(summary.total_value),
        summary.valued_records
    );
    if let Some(mean) = summary.mean_value {
        println!("Mean value:           {}", format_amount(mean));
    }
    if let (Some(first), Some(last)) = (summary.first_update, summary.last_update) {
        println!("Updated:              {} to {}", first, last);
    }
    println!(
        "Competitor contracts: {} ({:.1}% of contracts, {:.1}% of value)",
        summary.competitor_records, summary.competitor_count_share, summary.competitor_value_share
    );

    if !summary.competitors.is_empty() {
        println!("\nCompetitors:");
        for c in &summary.competitors {
            println!("  {:<40} {:>5}  {:>18}", c.name, c.contracts, format_amount(c.value));
        }
    }

    println!("\nTop suppliers by value:");
    for s in &summary.top_suppliers {
        let marker = if s.is_competitor { "*" } else { " " };
        println!(
            "  {}{:<40} {:>5}  {:>18}",
            marker,
            s.name,
            s.contracts,
            format_amount(s.value)
        );
    }

    println!("\nTop categories:");
    for c in &summary.top_categories {
        println!("  {:<50} {:>5}  {:>18}", c.label, c.contracts, format_amount(c.value));
    }
    Ok(())
}

fn run_targets(config: &Config) {
    for target in &config.targets {
        println!(
            "{:<24} {:>6}  {}",
            target.key,
            target.external_id,
            osc8_link(&target.source_url, &target.display_name)
        );
    }
}

fn run_clean(output_dir: &Path) -> Result<()> {
    println!("Cleaning generated files...");

    if output_dir.exists() {
        fs::remove_dir_all(output_dir)
            .with_context(|| format!("Failed to remove {}", output_dir.display()))?;
        println!("  Removed {}/", output_dir.display());
    }

    println!("Clean complete!");
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Scrape {
            output,
            only,
            max_pages,
            strategy,
            group_size,
            quiet,
        } => {
            let config = config.with_overrides(&Overrides {
                output_dir: output,
                max_pages,
                strategy,
                group_size,
                only,
            })?;
            run_scrape(config, quiet)
        }
        Commands::Probe { only } => {
            let config = config.with_overrides(&Overrides {
                only,
                ..Default::default()
            })?;
            run_probe(config)
        }
        Commands::Analyze { files, top, json } => run_analyze(&config, &files, top, json),
        Commands::Targets => {
            run_targets(&config);
            Ok(())
        }
        Commands::Clean => run_clean(&config.output_dir),
    }
}
