pub mod diff;
pub mod show;
pub mod verify;

use anyhow::{Context, Result};

use starpack_core::{document, AggregateDocument, AggregatePayload, PackRoots};

/// Every aggregate document of a pack, in category order.
pub(crate) fn load_documents(roots: &PackRoots) -> Result<Vec<AggregateDocument>> {
    let categories = document::list_categories_at(&roots.data)
        .with_context(|| format!("failed to list {}", roots.data.display()))?;
    categories
        .into_iter()
        .map(|category| {
            document::load_at(&roots.data, category)
                .with_context(|| format!("failed to load the {category} document"))
        })
        .collect()
}

/// One-line description of a payload.
pub(crate) fn summarize(payload: &AggregatePayload) -> String {
    match payload {
        AggregatePayload::Basic(basic) => {
            let mut summary = basic.display_name.clone();
            if let Some(title) = &basic.title {
                summary.push_str(&format!(" «{title}»"));
            }
            if !basic.status_effects.is_empty() {
                summary.push_str(&format!(", {} status effects", basic.status_effects.len()));
            }
            summary
        }
        AggregatePayload::Appearance(blob) | AggregatePayload::Pose(blob) => {
            format!("{} bytes of state", blob.data.len())
        }
        AggregatePayload::Redirects(set) => format!(
            "{} files, {} game paths, {} swaps",
            set.files.len(),
            set.game_path_count(),
            set.swaps.len()
        ),
    }
}
