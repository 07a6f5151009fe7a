//! `starpack diff <pack-a> <pack-b>`: structural aggregate comparison.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use similar::TextDiff;

use starpack_core::{AggregateDocument, AggregatePayload, Category};
use starpack_store::{redirect_delta, same_aggregate, AggregateDelta};

use super::load_documents;
use crate::Packs;

/// Arguments for `starpack diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Pack compared from.
    pub old: String,
    /// Pack compared to.
    pub new: String,
}

impl DiffArgs {
    pub fn run(self, packs: &Packs) -> Result<()> {
        let old = by_category(load_documents(&packs.roots(&self.old)?)?);
        let new = by_category(load_documents(&packs.roots(&self.new)?)?);
        let categories: BTreeSet<Category> = old.keys().chain(new.keys()).copied().collect();

        let mut differences = 0usize;
        for category in categories {
            match (old.get(&category), new.get(&category)) {
                (Some(_), None) => {
                    differences += 1;
                    println!("{}", format!("- {category} (only in '{}')", self.old).red());
                }
                (None, Some(_)) => {
                    differences += 1;
                    println!("{}", format!("+ {category} (only in '{}')", self.new).green());
                }
                (Some(a), Some(b)) if same_aggregate(&a.payload, &b.payload) => {}
                (Some(a), Some(b)) => {
                    differences += 1;
                    match (&a.payload, &b.payload) {
                        (AggregatePayload::Redirects(x), AggregatePayload::Redirects(y)) => {
                            let delta = redirect_delta(x, y);
                            println!("{} {}", format!("{category}:").bold(), delta);
                            print_delta(&delta);
                            if delta.meta_changed {
                                print!("{}", meta_diff(&self.old, &x.meta, &self.new, &y.meta));
                            }
                        }
                        _ => println!(
                            "{} changed (v{} -> v{})",
                            format!("{category}:").bold(),
                            a.version,
                            b.version
                        ),
                    }
                }
                (None, None) => {}
            }
        }

        if differences == 0 {
            println!("No differences between '{}' and '{}'.", self.old, self.new);
        }
        Ok(())
    }
}

fn by_category(documents: Vec<AggregateDocument>) -> BTreeMap<Category, AggregateDocument> {
    documents.into_iter().map(|doc| (doc.category, doc)).collect()
}

fn print_delta(delta: &AggregateDelta) {
    for entry in &delta.removed {
        let line = format!(
            "- {} {} {}",
            short(&entry.hash),
            entry.extension,
            entry.game_paths.join(", ")
        );
        println!("{}", line.red());
    }
    for entry in &delta.added {
        let line = format!(
            "+ {} {} {}",
            short(&entry.hash),
            entry.extension,
            entry.game_paths.join(", ")
        );
        println!("{}", line.green());
    }
    for swap in &delta.swaps_removed {
        println!("{}", format!("- swap {swap}").red());
    }
    for swap in &delta.swaps_added {
        println!("{}", format!("+ swap {swap}").green());
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Unified diff of two meta payloads, one line per `;`-separated item.
fn meta_diff(old_name: &str, old: &str, new_name: &str, new: &str) -> String {
    let old = split_meta(old);
    let new = split_meta(new);
    let old_header = format!("a/{old_name}/meta");
    let new_header = format!("b/{new_name}/meta");
    TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string()
}

fn split_meta(meta: &str) -> String {
    let mut lines: String = meta.split(';').collect::<Vec<_>>().join("\n");
    lines.push('\n');
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_diff_marks_changed_items() {
        let diff = meta_diff("a", "hat=1;gloves=2", "b", "hat=1;gloves=3");
        assert!(diff.contains("-gloves=2"));
        assert!(diff.contains("+gloves=3"));
        assert!(diff.contains("a/a/meta"));
    }

    #[test]
    fn short_hash_tolerates_short_input() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
    }
}
