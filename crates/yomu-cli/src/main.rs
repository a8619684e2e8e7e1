use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use yomu_core::downloader::DownloadEvent;
use yomu_runtime::{Runtime, RuntimeError};

#[derive(Parser)]
#[command(name = "yomu", version, about = "Feed reader with scriptable message filters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage subscribed feeds
    Feed(FeedCmd),
    /// Manage message filters
    Filter(FilterCmd),
    /// Download new messages
    Update {
        /// Only update these feeds (repeatable)
        #[arg(long = "feed", value_name = "ID")]
        feeds: Vec<i64>,
    },
}

#[derive(Args)]
struct FeedCmd {
    #[command(subcommand)]
    cmd: FeedSub,
}

#[derive(Subcommand)]
enum FeedSub {
    /// Subscribe to a feed
    Add {
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// List feeds
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Unsubscribe from a feed and delete its messages
    Remove { id: i64 },
}

#[derive(Args)]
struct FilterCmd {
    #[command(subcommand)]
    cmd: FilterSub,
}

#[derive(Subcommand)]
enum FilterSub {
    /// Add a filter script
    Add {
        name: String,
        /// Script source
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        script: Option<String>,
        /// Read the script from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List filters
    List {
        /// Print JSON, scripts included
        #[arg(long)]
        json: bool,
    },
    /// Delete a filter
    Remove { id: i64 },
    /// Append a filter to a feed's chain
    Attach { feed: i64, filter: i64 },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("yomu=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), RuntimeError> {
    let mut runtime = Runtime::new()?;

    match cli.command {
        Command::Feed(FeedCmd { cmd }) => match cmd {
            FeedSub::Add { url, title } => {
                let title = title.unwrap_or_else(|| url.clone());
                let id = runtime.add_feed(&title, &url)?;
                println!("Added feed {id}: {title}");
            }
            FeedSub::List { json } => {
                let feeds = runtime.list_feeds()?;
                if json {
                    return print_json(&feeds);
                }
                for feed in feeds {
                    let checked = feed
                        .last_checked
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".into());
                    let status = if feed.has_error { " [error]" } else { "" };
                    println!(
                        "{:>4}  {}  <{}>  checked {checked}{status}",
                        feed.id, feed.title, feed.url
                    );
                }
            }
            FeedSub::Remove { id } => {
                runtime.remove_feed(id)?;
                println!("Removed feed {id}");
            }
        },
        Command::Filter(FilterCmd { cmd }) => match cmd {
            FilterSub::Add { name, script, file } => {
                let script = match (script, file) {
                    (Some(script), _) => script,
                    (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| {
                        RuntimeError::Config(format!("read {}: {e}", path.display()))
                    })?,
                    (None, None) => {
                        return Err(RuntimeError::Config("no filter script given".into()))
                    }
                };
                let id = runtime.add_filter(&name, &script)?;
                println!("Added filter {id}: {name}");
            }
            FilterSub::List { json } => {
                let filters = runtime.list_filters()?;
                if json {
                    return print_json(&filters);
                }
                for filter in filters {
                    println!("{:>4}  {}", filter.id, filter.name);
                }
            }
            FilterSub::Remove { id } => {
                runtime.remove_filter(id)?;
                println!("Removed filter {id}");
            }
            FilterSub::Attach { feed, filter } => {
                runtime.attach_filter(feed, filter)?;
                println!("Attached filter {filter} to feed {feed}");
            }
        },
        Command::Update { feeds } => update(&mut runtime, &feeds)?,
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), RuntimeError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| RuntimeError::Config(format!("serialize: {e}")))?;
    println!("{out}");
    Ok(())
}

fn update(runtime: &mut Runtime, ids: &[i64]) -> Result<(), RuntimeError> {
    if runtime.start_update(ids)? == 0 {
        println!("No feeds to update.");
        return Ok(());
    }

    let max_entries = runtime.config().results.overview_max_entries;
    while let Some(event) = runtime.events().blocking_recv() {
        match event {
            DownloadEvent::Started => {}
            DownloadEvent::Progress {
                feed_title,
                completed,
                total,
                ..
            } => println!("[{completed}/{total}] {feed_title}"),
            DownloadEvent::Finished(results) => {
                tracing::debug!(updated = results.total_updated(), "Update finished");
                if results.is_empty() {
                    println!("No new messages.");
                } else {
                    println!("\n{}", results.overview(max_entries));
                }
                break;
            }
        }
    }
    Ok(())
}
