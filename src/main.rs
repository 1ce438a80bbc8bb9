//! mapcontent: manage downloadable map packages from the command line

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use mapcontent::{Config, ContentEvent, ContentItem, ContentService, GeoPoint};

#[derive(Parser)]
#[command(name = "mapcontent")]
#[command(about = "Download, activate and reclaim map content packages")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mapcontent.toml")]
    config: String,

    /// Storage root (overrides config file)
    #[arg(long, env = "MAPCONTENT_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Catalog root URL, repeatable (overrides config file)
    #[arg(long = "catalog-url", env = "MAPCONTENT_CATALOG_URL", value_delimiter = ',')]
    catalog_urls: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List stored packages
    Local,
    /// List packages offered by the catalogs
    Remote,
    /// Report whether a stored package has a newer remote version
    CheckUpdates,
    /// Download a package from the catalogs
    Download { name: String },
    /// Unpack and activate a stored package
    Activate { name: String },
    /// Mark a stored package for removal
    Delete { name: String },
    /// Reclaim obsolete packages, datasets and former roots
    Gc,
    /// Move the storage root
    Migrate { path: PathBuf },
    /// Stored packages covering a location
    Find {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Remote packages covering a location
    Suggest {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mapcontent=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load or create default config
    let mut config = if std::path::Path::new(&cli.config).exists() {
        Config::load(&cli.config).with_context(|| format!("reading {}", cli.config))?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(root) = cli.storage_root {
        config.storage_root = root;
    }
    if !cli.catalog_urls.is_empty() {
        config.catalog_urls = cli.catalog_urls;
    }

    let service = ContentService::start(config).await?;
    let manager = service.manager().clone();

    match cli.command {
        Command::Local => print_items(&manager.local_items()),
        Command::Remote => print_items(&service.refresh_remote(None).await?),
        Command::CheckUpdates => {
            service.refresh_remote(None).await?;
            if manager.check_updates() {
                println!("updates available");
            } else {
                println!("up to date");
            }
        }
        Command::Download { name } => {
            let remote = service.refresh_remote(None).await?;
            let item = find_item(&remote, &name)?;

            let mut events = service.subscribe();
            let handle = service.download(item);
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        ContentEvent::DownloadProgress { name, current, max } => {
                            println!("{name}: {current}/{max}");
                        }
                        ContentEvent::DownloadFinished { .. }
                        | ContentEvent::DownloadFailed { .. }
                        | ContentEvent::DownloadInterrupted { .. } => break,
                        _ => {}
                    }
                }
            });

            let local = handle.wait().await?;
            printer.await.ok();
            print_items(&[local]);
        }
        Command::Activate { name } => {
            let item = find_item(&manager.local_items(), &name)?;
            match service.unpack_and_activate(item).await? {
                Some(path) => println!("active: {}", path.display()),
                None => anyhow::bail!("{name} could not be activated"),
            }
        }
        Command::Delete { name } => {
            let item = find_item(&manager.local_items(), &name)?;
            if !service.delete(item).await? {
                anyhow::bail!("failed to delete {name}");
            }
            println!("deleted {name}");
        }
        Command::Gc => {
            let report = service.garbage_collect().await?;
            println!(
                "deactivated {}, roots {}, unpacked {}, packages {}",
                report.deactivated.len(),
                report.removed_roots.len(),
                report.removed_unpacked,
                report.removed_packages
            );
        }
        Command::Migrate { path } => {
            service.migrate(path).await?;
            println!("storage root: {}", manager.storage_root().display());
        }
        Command::Find { lat, lon } => {
            print_items(&manager.find_content_items_by_region(GeoPoint::new(lat, lon)));
        }
        Command::Suggest { lat, lon } => {
            service.refresh_remote(None).await?;
            print_items(&manager.find_suggested_items(GeoPoint::new(lat, lon)));
        }
    }

    Ok(())
}

fn find_item(items: &[ContentItem], name: &str) -> anyhow::Result<ContentItem> {
    items
        .iter()
        .find(|i| i.name == name)
        .cloned()
        .with_context(|| format!("no content item named {name}"))
}

fn print_items(items: &[ContentItem]) {
    for item in items {
        let location = item
            .local_path()
            .map(|p| p.display().to_string())
            .or_else(|| item.url().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{}\t{}\t{}\t{}",
            item.name, item.content_type, item.hash, location
        );
    }
}
