use solace_core::EntryDraft;

use crate::cli::{EntryLists, Ratings};
use crate::commands::common::{resolve_entry_content, App};
use crate::error::CliError;

pub fn build_draft(content: String, ratings: Ratings, lists: EntryLists) -> EntryDraft {
    EntryDraft::new(content, ratings.mood, ratings.energy, ratings.stress)
        .with_tags(lists.tags)
        .with_challenges(lists.challenges)
        .with_gratitude(lists.gratitude)
}

pub async fn run_add(
    app: &App,
    content: &[String],
    ratings: Ratings,
    lists: EntryLists,
) -> Result<(), CliError> {
    let content = resolve_entry_content(content)?.ok_or(CliError::EmptyContent)?;
    let outcome = app
        .engine
        .create_entry(build_draft(content, ratings, lists))
        .await?;

    if outcome.is_offline {
        println!("{} (saved offline, will sync later)", outcome.entry.id);
    } else {
        println!("{}", outcome.entry.id);
    }
    Ok(())
}
