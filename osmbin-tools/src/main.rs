//! `osmbin` - maintenance commands for osmbin dataset directories

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Maintenance tool for osmbin dataset directories
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// The operation to run
    #[command(subcommand)]
    op: Operation,
}

#[derive(Debug, Subcommand)]
enum Operation {
    /// Deletes and rebuilds the id and geo index files from the record files.
    ///
    /// The dataset must not be open in another process.
    Reindex {
        /// Dataset directory
        dir: PathBuf,
    },
    /// Prints entity and record counts
    Stats {
        /// Dataset directory
        dir: PathBuf,
    },
}

impl Operation {
    fn run(&self) -> Result<()> {
        match self {
            Self::Reindex { dir } => {
                let report = osmbin_core::rebuild_indices(dir)?;
                println!(
                    "{}: indexed {} nodes, {} ways, {} relations",
                    dir.display(),
                    report.nodes,
                    report.ways,
                    report.relations
                );
            }
            Self::Stats { dir } => {
                println!("{}", osmbin_core::stats(dir)?);
            }
        }
        Ok(())
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = cli.op.run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
