//! Starpack: data pack inspection CLI.
//!
//! # Usage
//!
//! ```text
//! starpack [--packs <dir>] show <pack> [--json]
//! starpack [--packs <dir>] diff <pack-a> <pack-b>
//! starpack [--packs <dir>] verify <pack>
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{diff::DiffArgs, show::ShowArgs, verify::VerifyArgs};
use starpack_core::{DirectoryResolver, PackId, PackRoots, PathResolver};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "starpack",
    version,
    about = "Inspect star data packs: published aggregates and stored content",
    long_about = None,
)]
struct Cli {
    /// Directory holding the data packs. Defaults to ~/.starpack/packs.
    #[arg(long, global = true)]
    packs: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the aggregate documents of a pack.
    Show(ShowArgs),

    /// Compare the aggregates of two packs.
    Diff(DiffArgs),

    /// Re-hash the content referenced by a pack's redirect document.
    Verify(VerifyArgs),
}

/// Resolves pack names given on the command line.
pub struct Packs {
    resolver: DirectoryResolver,
}

impl Packs {
    fn new(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => dirs::home_dir()
                .context("could not determine home directory")?
                .join(".starpack")
                .join("packs"),
        };
        Ok(Self {
            resolver: DirectoryResolver::new(root),
        })
    }

    pub fn roots(&self, name: &str) -> Result<PackRoots> {
        let pack = PackId::from(name);
        self.resolver.resolve(&pack).with_context(|| {
            format!(
                "pack '{}' not found at {}",
                name,
                self.resolver.pack_dir(&pack).display()
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let packs = Packs::new(cli.packs)?;
    match cli.command {
        Commands::Show(args) => args.run(&packs),
        Commands::Diff(args) => args.run(&packs),
        Commands::Verify(args) => args.run(&packs),
    }
}
