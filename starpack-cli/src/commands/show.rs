//! `starpack show <pack>`: list a pack's published aggregates.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use starpack_store::aggregate_key;

use super::{load_documents, summarize};
use crate::Packs;

/// Arguments for `starpack show`.
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Pack name.
    pub pack: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct DocumentJson {
    category: String,
    version: u64,
    published_at: String,
    key: String,
    summary: String,
}

#[derive(Tabled)]
struct DocumentRow {
    #[tabled(rename = "category")]
    category: String,
    #[tabled(rename = "version")]
    version: u64,
    #[tabled(rename = "published")]
    published: String,
    #[tabled(rename = "summary")]
    summary: String,
}

impl ShowArgs {
    pub fn run(self, packs: &Packs) -> Result<()> {
        let roots = packs.roots(&self.pack)?;
        let documents = load_documents(&roots)?;

        if self.json {
            let payload: Vec<DocumentJson> = documents
                .iter()
                .map(|doc| DocumentJson {
                    category: doc.category.to_string(),
                    version: doc.version,
                    published_at: doc.published_at.to_rfc3339(),
                    key: aggregate_key(&doc.payload).0,
                    summary: summarize(&doc.payload),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize JSON")?
            );
            return Ok(());
        }

        println!("{} {}", "pack".bold(), self.pack.bold());
        if documents.is_empty() {
            println!("No aggregates published.");
            return Ok(());
        }
        let rows: Vec<DocumentRow> = documents
            .iter()
            .map(|doc| DocumentRow {
                category: doc.category.to_string(),
                version: doc.version,
                published: doc.published_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                summary: summarize(&doc.payload),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
