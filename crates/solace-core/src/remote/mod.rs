//! Remote journal store.
//!
//! [`JournalApi`] is the seam the sync engine talks through. The Supabase
//! implementation speaks PostgREST against the `journal_entries` table; row
//! level security scopes every request to the credential's user.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{EntryId, JournalEntry};
use crate::session::Credential;
use crate::util::{compact_text, is_http_url};

const JOURNAL_TABLE: &str = "journal_entries";

/// Hosted CRUD endpoint for journal entries.
///
/// Implementations classify failures as [`Error::Connectivity`],
/// [`Error::AuthUnavailable`] or [`Error::RemoteRejected`].
#[async_trait]
pub trait JournalApi: Send + Sync {
    /// All entries owned by `user_id`, newest first.
    async fn fetch_entries(
        &self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<Vec<JournalEntry>>;

    /// Create an entry. Repeating a call with the same idempotency key must
    /// not create a second row.
    async fn create_entry(
        &self,
        entry: &JournalEntry,
        idempotency_key: &str,
        credential: &Credential,
    ) -> Result<JournalEntry>;

    async fn update_entry(
        &self,
        entry: &JournalEntry,
        idempotency_key: &str,
        credential: &Credential,
    ) -> Result<JournalEntry>;

    async fn delete_entry(&self, entry_id: &str, credential: &Credential) -> Result<()>;
}

#[derive(Clone)]
pub struct SupabaseJournalApi {
    rest_url: String,
    anon_key: String,
    client: Client,
}

impl SupabaseJournalApi {
    pub fn new(url: &str, anon_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let rest_url = normalize_rest_url(url)?;
        let anon_key = anon_key.into().trim().to_string();
        if anon_key.is_empty() {
            return Err(Error::ValidationFailed(
                "Supabase anon key must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::ValidationFailed(format!("invalid HTTP client: {error}")))?;

        Ok(Self {
            rest_url,
            anon_key,
            client,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/{JOURNAL_TABLE}", self.rest_url)
    }

    fn authorized(&self, request: RequestBuilder, credential: &Credential) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(&credential.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send_rows(&self, request: RequestBuilder) -> Result<Vec<JournalRow>> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        Ok(response.json::<Vec<JournalRow>>().await?)
    }

    async fn single_row(&self, request: RequestBuilder, action: &str) -> Result<JournalEntry> {
        self.send_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::RemoteRejected(format!("{action} returned no row")))?
            .try_into()
    }
}

#[async_trait]
impl JournalApi for SupabaseJournalApi {
    async fn fetch_entries(
        &self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<Vec<JournalEntry>> {
        let request = self.authorized(
            self.client.get(self.table_url()).query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("order", "created_at.desc".to_string()),
            ]),
            credential,
        );
        self.send_rows(request)
            .await?
            .into_iter()
            .map(JournalEntry::try_from)
            .collect()
    }

    async fn create_entry(
        &self,
        entry: &JournalEntry,
        idempotency_key: &str,
        credential: &Credential,
    ) -> Result<JournalEntry> {
        let row = JournalRow::for_write(entry, idempotency_key, true);
        let request = self.authorized(
            self.client
                .post(self.table_url())
                .query(&[("on_conflict", "idempotency_key")])
                .header("Prefer", "return=representation,resolution=merge-duplicates")
                .json(&[row]),
            credential,
        );
        self.single_row(request, "create").await
    }

    async fn update_entry(
        &self,
        entry: &JournalEntry,
        idempotency_key: &str,
        credential: &Credential,
    ) -> Result<JournalEntry> {
        let Some(server_id) = entry.id.server_id() else {
            return Err(Error::ValidationFailed(
                "cannot update an entry the server has not acknowledged".to_string(),
            ));
        };
        let row = JournalRow::for_write(entry, idempotency_key, false);
        let request = self.authorized(
            self.client
                .patch(self.table_url())
                .query(&[("id", format!("eq.{server_id}"))])
                .header("Prefer", "return=representation")
                .json(&row),
            credential,
        );
        self.single_row(request, "update").await
    }

    async fn delete_entry(&self, entry_id: &str, credential: &Credential) -> Result<()> {
        let request = self.authorized(
            self.client
                .delete(self.table_url())
                .query(&[("id", format!("eq.{entry_id}"))]),
            credential,
        );
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

/// Map an HTTP failure onto the sync engine's error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED => Error::AuthUnavailable(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Error::Connectivity(message),
        status if status.is_server_error() => Error::Connectivity(message),
        _ => Error::RemoteRejected(message),
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<PostgrestError>(body) {
        if let Some(message) = payload.message.or(payload.details).or(payload.hint) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_rest_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if !is_http_url(trimmed) {
        return Err(Error::ValidationFailed(
            "Supabase URL must include http:// or https://".to_string(),
        ));
    }
    if trimmed.ends_with("/rest/v1") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/rest/v1"))
    }
}

/// `journal_entries` row as PostgREST sends and accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    user_id: String,
    content: String,
    mood_rating: u8,
    energy_level: u8,
    stress_level: u8,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    challenges: Option<Vec<String>>,
    #[serde(default)]
    gratitude: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    ai_response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
}

impl JournalRow {
    fn for_write(entry: &JournalEntry, idempotency_key: &str, include_created_at: bool) -> Self {
        Self {
            id: None,
            user_id: entry.user_id.clone(),
            content: entry.content.clone(),
            mood_rating: entry.mood,
            energy_level: entry.energy,
            stress_level: entry.stress,
            tags: Some(entry.tags.clone()),
            challenges: Some(entry.challenges.clone()),
            gratitude: Some(entry.gratitude.clone()),
            created_at: include_created_at
                .then(|| DateTime::from_timestamp_millis(entry.created_at))
                .flatten(),
            updated_at: DateTime::from_timestamp_millis(entry.updated_at),
            ai_response: None,
            idempotency_key: Some(idempotency_key.to_string()),
        }
    }
}

impl TryFrom<JournalRow> for JournalEntry {
    type Error = Error;

    fn try_from(row: JournalRow) -> Result<Self> {
        let id = row
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::RemoteRejected("row did not include an id".to_string()))?;
        let created_at = row.created_at.map_or(0, |at| at.timestamp_millis());
        let updated_at = row
            .updated_at
            .map_or(created_at, |at| at.timestamp_millis());

        Ok(Self {
            id: EntryId::confirmed(id),
            user_id: row.user_id,
            content: row.content,
            mood: row.mood_rating,
            energy: row.energy_level,
            stress: row.stress_level,
            tags: row.tags.unwrap_or_default(),
            challenges: row.challenges.unwrap_or_default(),
            gratitude: row.gratitude.unwrap_or_default(),
            created_at,
            updated_at,
            ai_insight: row.ai_response,
        })
    }
}
