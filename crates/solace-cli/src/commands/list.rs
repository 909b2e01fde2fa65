use crate::commands::common::{
    empty_list_message, entry_to_list_item, format_entry_lines, now_ms, unsynced_ids, App,
    EntryListItem,
};
use crate::error::CliError;

#[derive(serde::Serialize)]
struct ListOutput {
    is_from_cache: bool,
    entries: Vec<EntryListItem>,
}

pub async fn run_list(
    app: &App,
    refresh: bool,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let result = app.engine.get_entries(refresh).await?;
    let now_ms = now_ms();
    let entries = result.entries.into_iter().take(limit).collect::<Vec<_>>();
    let unsynced = unsynced_ids(&app.engine.pending_writes().await?);

    if as_json {
        let output = ListOutput {
            is_from_cache: result.is_from_cache,
            entries: entries
                .iter()
                .map(|entry| entry_to_list_item(entry, &unsynced, now_ms))
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if result.is_from_cache {
        eprintln!("Showing cached entries ({}).", app.engine.sync_state());
    }
    if entries.is_empty() {
        println!("{}", empty_list_message(result.is_from_cache));
        return Ok(());
    }
    for line in format_entry_lines(&entries, &unsynced, now_ms) {
        println!("{line}");
    }
    Ok(())
}
