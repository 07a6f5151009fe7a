//! `starpack verify <pack>`: re-hash content referenced by the outfit.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use starpack_core::{document, Category, ContentHash};
use starpack_store::{ContentStore, Verification};

use crate::Packs;

/// Arguments for `starpack verify`.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Pack name.
    pub pack: String,
}

impl VerifyArgs {
    pub fn run(self, packs: &Packs) -> Result<()> {
        let roots = packs.roots(&self.pack)?;
        let Some(doc) = document::try_load_at(&roots.data, Category::Redirects)
            .context("failed to load the redirects document")?
        else {
            println!("No redirect document in '{}'.", self.pack);
            return Ok(());
        };
        let Some(set) = doc.payload.as_redirects() else {
            bail!("redirects document of '{}' holds another payload kind", self.pack);
        };

        let store = ContentStore::new(&roots.files);
        let hashes: BTreeSet<&ContentHash> = set.files.iter().map(|f| &f.hash).collect();
        let mut failures = 0usize;
        for hash in &hashes {
            let verification = store
                .verify(hash)
                .with_context(|| format!("failed to read content {hash}"))?;
            match verification {
                Verification::Intact => {}
                Verification::Missing => {
                    failures += 1;
                    println!("{} {}", "MISSING".yellow().bold(), hash);
                }
                Verification::Corrupt { actual } => {
                    failures += 1;
                    println!("{} {} (hashes to {})", "CORRUPT".red().bold(), hash, actual);
                }
            }
        }

        if failures > 0 {
            bail!(
                "{failures} of {} content files failed verification",
                hashes.len()
            );
        }
        println!(
            "{} {} content files intact (v{})",
            "OK".green().bold(),
            hashes.len(),
            doc.version
        );
        Ok(())
    }
}
