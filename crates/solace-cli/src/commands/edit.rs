use solace_core::{EntryDraft, JournalEntry};

use crate::cli::RatingOverrides;
use crate::commands::common::{resolve_entry, resolve_entry_content, App};
use crate::error::CliError;

/// Draft for `entry` with the given text and rating overrides applied.
pub fn edited_draft(
    entry: &JournalEntry,
    content: Option<String>,
    ratings: RatingOverrides,
) -> EntryDraft {
    EntryDraft::new(
        content.unwrap_or_else(|| entry.content.clone()),
        ratings.mood.unwrap_or(entry.mood),
        ratings.energy.unwrap_or(entry.energy),
        ratings.stress.unwrap_or(entry.stress),
    )
    .with_tags(entry.tags.clone())
    .with_challenges(entry.challenges.clone())
    .with_gratitude(entry.gratitude.clone())
}

pub async fn run_edit(
    app: &App,
    id: &str,
    content: &[String],
    ratings: RatingOverrides,
) -> Result<(), CliError> {
    let entries = app.engine.get_entries(false).await?.entries;
    let entry = resolve_entry(id, &entries)?;
    let content = resolve_entry_content(content)?;
    if content.is_none() && ratings == RatingOverrides::default() {
        return Err(CliError::EmptyContent);
    }

    let draft = edited_draft(entry, content, ratings);
    let outcome = app.engine.update_entry(&entry.id, draft).await?;
    if outcome.is_offline {
        println!("{} (saved offline, will sync later)", outcome.entry.id);
    } else {
        println!("{}", outcome.entry.id);
    }
    Ok(())
}
