use std::sync::Arc;

use anyhow::{Context, Result};
use bidscout_core::{parse_work_type_filter, Classification, Filter, DEFAULT_PAGE_SIZE};
use bidscout_discovery::{
    detect_state, detect_work_type, render_source_health, should_trigger_discovery,
    start_alert_scheduler, summarize, AlertEvent, AlertPoller, Discovery, DiscoveryConfig,
};
use clap::{Args, Parser, Subcommand};
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bidscout")]
#[command(about = "Find, rank and watch live bid opportunities")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one discovery and print the ranked page.
    Discover {
        #[command(flatten)]
        filter: FilterArgs,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check whether a chat message should trigger discovery.
    Classify {
        text: String,
        #[arg(long)]
        no_discovery_support: bool,
    },
    /// Poll on a cron schedule and print new opportunities until Ctrl-C.
    Watch {
        #[command(flatten)]
        filter: FilterArgs,
        /// Overrides BIDSCOUT_POLL_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
    Serve,
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long, default_value = "all")]
    work_type: String,
    #[arg(long)]
    state: String,
    #[arg(long)]
    city_or_county: Option<String>,
    #[arg(long)]
    classification: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,
}

impl FilterArgs {
    fn into_filter(self) -> Result<Filter> {
        let work_type = parse_work_type_filter(&self.work_type)?;
        let mut filter = Filter::new(work_type, self.state);
        filter.city_or_county = self.city_or_county;
        filter.classification = self
            .classification
            .as_deref()
            .map(str::parse::<Classification>)
            .transpose()?;
        filter.page = self.page;
        filter.page_size = self.page_size;
        Ok(filter)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bidscout_discovery=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = DiscoveryConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Discover { filter, json } => {
            let filter = filter.into_filter()?;
            let discovery = Discovery::from_config(&config).await?;
            let result = discovery.discover(&filter).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).context("encoding result")?
                );
            } else {
                println!("{}", result.summary(&filter));
                if let Some(note) = render_source_health(&result.source_health) {
                    println!("\n{note}");
                }
                for o in &result.opportunities {
                    println!(
                        "[{:>3}] {} ({}) {}",
                        o.priority_score,
                        o.title,
                        o.source_name,
                        o.url.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Classify {
            text,
            no_discovery_support,
        } => {
            println!(
                "trigger={} work_type={} state={}",
                should_trigger_discovery(&text, !no_discovery_support),
                detect_work_type(&text).map(|w| w.as_str()).unwrap_or("-"),
                detect_state(&text).unwrap_or("-")
            );
        }
        Commands::Watch { filter, cron } => {
            let filter = filter.into_filter()?;
            let cron = cron.unwrap_or_else(|| config.poll_cron.clone());
            let discovery = Arc::new(Discovery::from_config(&config).await?);
            let poller = Arc::new(Mutex::new(AlertPoller::new(discovery, filter.clone())));

            let baseline = poller.lock().await.poll_once().await?;
            print_event(&baseline, &filter);

            let (tx, mut rx) = mpsc::channel(16);
            let mut sched = start_alert_scheduler(poller, &cron, tx).await?;
            println!("watching with cron {cron}; Ctrl-C to stop");
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => print_event(&event, &filter),
                    _ = tokio::signal::ctrl_c() => break,
                    else => break,
                }
            }
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            bidscout_web::serve(&config).await?;
        }
    }

    Ok(())
}

fn print_event(event: &AlertEvent, filter: &Filter) {
    match event {
        AlertEvent::NewOpportunities { opportunities, .. } => {
            println!("{} new:", opportunities.len());
            println!("{}", summarize(opportunities, filter));
        }
        AlertEvent::NoChange { checked, .. } => {
            println!("no new opportunities ({checked} checked)");
        }
        AlertEvent::SourcesUnavailable { source_health, .. } => {
            println!("all sources unavailable; baseline kept");
            if let Some(note) = render_source_health(source_health) {
                println!("{note}");
            }
        }
    }
}
