use std::collections::HashSet;
use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use solace_core::db::LibSqlStore;
use solace_core::models::{DeadLetter, QueuedWrite, WriteKind};
use solace_core::remote::SupabaseJournalApi;
use solace_core::{ClientConfig, EntryId, JournalEntry, SessionStore, SyncEngine};

use crate::auth::auth_client;
use crate::error::CliError;

/// Everything a command needs: the signed-in session and the sync engine.
pub struct App {
    pub session: Arc<SessionStore>,
    pub engine: SyncEngine,
}

impl App {
    pub async fn open(
        config_path: Option<PathBuf>,
        db_path: Option<PathBuf>,
    ) -> Result<Self, CliError> {
        let config_path = resolve_config_path(config_path)?;
        let config = ClientConfig::load_from_path(&config_path)
            .map_err(CliError::Config)?
            .with_process_env();
        let Some((url, anon_key)) = config.supabase().map_err(CliError::Config)? else {
            return Err(CliError::NotConfigured(config_path.display().to_string()));
        };

        let provider = auth_client(&url, &anon_key, config.sync.request_timeout())
            .map_err(|error| CliError::Auth(error.to_string()))?;
        let session = Arc::new(SessionStore::new(Arc::new(provider)));
        let snapshot = session.initialize().await;
        tracing::debug!("Session restored: {:?}", snapshot.phase);

        let db_path = resolve_db_path(db_path)?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = LibSqlStore::open_path(db_path).await?;
        let api = SupabaseJournalApi::new(&url, anon_key, config.sync.request_timeout())?;
        let engine = SyncEngine::new(
            session.clone(),
            Arc::new(store),
            Arc::new(api),
            config.sync.clone(),
        )
        .await?;

        Ok(Self { session, engine })
    }
}

pub fn resolve_config_path(cli_config_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_config_path.or_else(|| env::var_os("SOLACE_CONFIG").map(PathBuf::from))
    {
        return Ok(path);
    }
    dirs::config_dir()
        .map(|dir| dir.join("solace").join("config.json"))
        .ok_or_else(|| CliError::Config("Failed to resolve config directory".to_string()))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("SOLACE_DB_PATH").map(PathBuf::from)) {
        return Ok(path);
    }
    dirs::data_dir()
        .map(|dir| dir.join("solace").join("solace.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve data directory".to_string()))
}

#[derive(Debug, Serialize)]
pub struct EntryListItem {
    pub id: String,
    pub preview: String,
    pub content: String,
    pub mood: u8,
    pub energy: u8,
    pub stress: u8,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub synced: bool,
}

#[derive(Debug, Serialize)]
pub struct QueueItem {
    pub seq: u64,
    pub kind: WriteKind,
    pub entry_id: String,
    pub status: &'static str,
    pub attempts: u32,
    pub error: Option<String>,
    pub next_attempt_at: Option<String>,
}

/// Entries with local changes the server has not acknowledged yet.
pub fn unsynced_ids(pending: &[QueuedWrite]) -> HashSet<EntryId> {
    pending.iter().map(|write| write.target().clone()).collect()
}

fn is_synced(entry: &JournalEntry, unsynced: &HashSet<EntryId>) -> bool {
    !entry.id.is_temporary() && !unsynced.contains(&entry.id)
}

pub fn empty_list_message(is_from_cache: bool) -> &'static str {
    if is_from_cache {
        "No entries available offline."
    } else {
        "No entries yet."
    }
}

pub fn entry_to_list_item(
    entry: &JournalEntry,
    unsynced: &HashSet<EntryId>,
    now_ms: i64,
) -> EntryListItem {
    EntryListItem {
        id: entry.id.to_string(),
        preview: entry_preview(entry, 80),
        content: entry.content.clone(),
        mood: entry.mood,
        energy: entry.energy,
        stress: entry.stress,
        tags: entry.tags.clone(),
        created_at: entry.created_at,
        updated_at: entry.updated_at,
        relative_time: format_relative_time(entry.created_at, now_ms),
        synced: is_synced(entry, unsynced),
    }
}

pub fn format_entry_lines(
    entries: &[JournalEntry],
    unsynced: &HashSet<EntryId>,
    now_ms: i64,
) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let id = entry.id.to_string();
            let short_id = short_id(&id);
            let preview = entry_preview(entry, 40);
            let relative_time = format_relative_time(entry.created_at, now_ms);
            let ratings = format!("m{} e{} s{}", entry.mood, entry.energy, entry.stress);
            let marker = if is_synced(entry, unsynced) { " " } else { "*" };

            if entry.tags.is_empty() {
                format!("{short_id:<13}{marker} {preview:<40}  {ratings:<11}  {relative_time}")
            } else {
                let tags = render_tags(&entry.tags);
                format!(
                    "{short_id:<13}{marker} {preview:<40}  {ratings:<11}  {relative_time:<10}  {tags}"
                )
            }
        })
        .collect()
}

pub fn pending_to_item(write: &QueuedWrite) -> QueueItem {
    QueueItem {
        seq: write.seq,
        kind: write.kind,
        entry_id: write.target().to_string(),
        status: "pending",
        attempts: write.attempts,
        error: write.last_error.clone(),
        next_attempt_at: (write.next_attempt_at > 0)
            .then(|| format_timestamp(write.next_attempt_at)),
    }
}

pub fn dead_letter_to_item(letter: &DeadLetter) -> QueueItem {
    QueueItem {
        seq: letter.write.seq,
        kind: letter.write.kind,
        entry_id: letter.write.target().to_string(),
        status: if letter.rejected { "rejected" } else { "failed" },
        attempts: letter.write.attempts,
        error: Some(letter.reason.clone()),
        next_attempt_at: None,
    }
}

pub fn format_queue_lines(items: &[QueueItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let kind = match item.kind {
                WriteKind::Create => "create",
                WriteKind::Update => "update",
            };
            let mut line = format!(
                "{:>4}  {:<8}  {kind:<6}  {:<13}  attempts={}",
                item.seq,
                item.status,
                short_id(&item.entry_id),
                item.attempts
            );
            if let Some(error) = &item.error {
                line.push_str("  ");
                line.push_str(error);
            }
            line
        })
        .collect()
}

/// Find an entry by exact id or unique id prefix.
pub fn resolve_entry<'a>(
    query: &str,
    entries: &'a [JournalEntry],
) -> Result<&'a JournalEntry, CliError> {
    let query = normalize_entry_identifier(query)?;
    if let Some(entry) = entries.iter().find(|entry| entry.id.to_string() == query) {
        return Ok(entry);
    }

    let matching = entries
        .iter()
        .filter(|entry| entry.id.to_string().starts_with(&query))
        .collect::<Vec<_>>();

    match matching.as_slice() {
        [] => Err(CliError::EntryNotFound(query)),
        [entry] => Ok(*entry),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(|entry| short_id(&entry.id.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousEntryId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn entry_preview(entry: &JournalEntry, max_chars: usize) -> String {
    let first_line = entry.content.lines().next().unwrap_or("").trim();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn render_tags(tags: &[String]) -> String {
    let mut tags = tags.to_vec();
    tags.sort();
    tags.into_iter()
        .map(|tag| format!("#{tag}"))
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Entry text from the arguments, falling back to piped stdin.
pub fn resolve_entry_content(content_parts: &[String]) -> Result<Option<String>, CliError> {
    if let Some(content) = normalize_content(&content_parts.join(" ")) {
        return Ok(Some(content));
    }
    read_piped_stdin()
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_entry_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyEntryId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}
