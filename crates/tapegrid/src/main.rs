//! tapegrid — object storage on removable media.
//!
//! Every command opens the catalog and the simulated library named in the
//! configuration. Commands that touch media start a local resource
//! scheduler for their duration and stop it before exiting.
//!
//! # Usage
//!
//! ```text
//! tapegrid device add st0
//! tapegrid medium add L1 --capacity 1073741824
//! tapegrid format L1 --unlock
//! tapegrid put obj1 ./data.bin --attr owner=alice
//! tapegrid get obj1 ./copy.bin
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tapegrid_core::{FsType, LayoutKind, ResourceFamily};

mod commands;

#[derive(Parser)]
#[command(
    name = "tapegrid",
    about = "TapeGrid — object storage on removable media",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file. Defaults to $TAPEGRID_CFG_FILE, then
    /// /etc/tapegrid.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage drives.
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Manage media.
    Medium {
        #[command(subcommand)]
        action: MediumAction,
    },
    /// Format a blank medium.
    Format {
        name: String,
        #[arg(long, default_value = "tape")]
        family: ResourceFamily,
        #[arg(long, default_value = "ltfs")]
        fs: FsType,
        /// Allow writes to the medium once formatted.
        #[arg(long)]
        unlock: bool,
    },
    /// Store a file as a new object.
    Put {
        oid: String,
        file: PathBuf,
        /// Layout: simple or compressed (default from config).
        #[arg(long)]
        layout: Option<LayoutKind>,
        /// Resource family (default from config).
        #[arg(long)]
        family: Option<ResourceFamily>,
        /// Only write to media carrying this tag. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// User attribute as key=value. Repeatable.
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
    },
    /// Retrieve an object into a file.
    Get {
        oid: String,
        file: PathBuf,
        /// Fail instead of reading if another host is better placed.
        #[arg(long)]
        best_host: bool,
    },
    /// Show an object's size and attributes.
    Getmd { oid: String },
    /// Delete an object and its extents.
    Delete { oid: String },
    /// Print the host best placed to read an object.
    Locate {
        oid: String,
        #[arg(long)]
        focus_host: Option<String>,
    },
    /// Print the hardware audit log as JSON lines.
    Logs {
        /// Empty the log after printing it.
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand)]
enum DeviceAction {
    /// Register a drive for this host and add it to the library.
    Add {
        name: String,
        #[arg(long, default_value = "tape")]
        family: ResourceFamily,
        #[arg(long)]
        model: Option<String>,
    },
    /// List registered drives.
    List,
}

#[derive(Subcommand)]
enum MediumAction {
    /// Register a blank medium and put it in a free library slot.
    Add {
        name: String,
        #[arg(long, default_value = "tape")]
        family: ResourceFamily,
        /// Size of the medium in bytes.
        #[arg(long, default_value = "1073741824")]
        capacity: u64,
        #[arg(long, default_value = "ltfs")]
        fs: FsType,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List registered media.
    List,
}

fn parse_attr(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty attribute name in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tapegrid=debug")),
        )
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::open(cli.config.as_deref())?;

    match cli.command {
        Commands::Device { action } => match action {
            DeviceAction::Add {
                name,
                family,
                model,
            } => commands::admin::device_add(&ctx, &name, family, model),
            DeviceAction::List => commands::admin::device_list(&ctx),
        },
        Commands::Medium { action } => match action {
            MediumAction::Add {
                name,
                family,
                capacity,
                fs,
                tags,
            } => commands::admin::medium_add(&ctx, &name, family, capacity, fs, tags),
            MediumAction::List => commands::admin::medium_list(&ctx),
        },
        Commands::Format {
            name,
            family,
            fs,
            unlock,
        } => commands::admin::format(&ctx, &name, family, fs, unlock).await,
        Commands::Put {
            oid,
            file,
            layout,
            family,
            tags,
            attrs,
        } => {
            let options = commands::object::PutOptions {
                layout,
                family,
                tags,
                attrs,
            };
            commands::object::put(&ctx, &oid, &file, options).await
        }
        Commands::Get {
            oid,
            file,
            best_host,
        } => commands::object::get(&ctx, &oid, &file, best_host).await,
        Commands::Getmd { oid } => commands::object::getmd(&ctx, &oid).await,
        Commands::Delete { oid } => commands::object::delete(&ctx, &oid).await,
        Commands::Locate { oid, focus_host } => {
            commands::object::locate(&ctx, &oid, focus_host.as_deref()).await
        }
        Commands::Logs { clear } => commands::admin::logs(&ctx, clear),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn attr_needs_key_and_equals() {
        assert_eq!(parse_attr("a=b=c").unwrap(), ("a".into(), "b=c".into()));
        assert!(parse_attr("novalue").is_err());
        assert!(parse_attr("=x").is_err());
    }

    #[test]
    fn put_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "tapegrid", "put", "o1", "/tmp/f", "--tag", "a", "--tag", "b", "--attr", "k=v",
            "--layout", "compressed",
        ])
        .unwrap();
        match cli.command {
            Commands::Put {
                tags,
                attrs,
                layout,
                ..
            } => {
                assert_eq!(tags, vec!["a", "b"]);
                assert_eq!(attrs, vec![("k".to_string(), "v".to_string())]);
                assert_eq!(layout, Some(LayoutKind::Compressed));
            }
            _ => panic!("expected put"),
        }
    }
}
