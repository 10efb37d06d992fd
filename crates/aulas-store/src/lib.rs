//! Record-store collaborator contracts, an in-memory implementation for
//! tests/local dev, and a PostgREST-backed HTTP implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aulas_core::{normalize, Assignment, AssignmentPatch, NewAssignment};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "aulas-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("registro con ID {0} no encontrado")]
    NotFound(i64),
    #[error("error del almacén de datos: {0}")]
    Backend(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Predicates supported by the store: equality on the canonical shift,
/// accent/case-folded substring on the remaining fields, and a free-text
/// `search` that ORs the four substring fields. Needles are normalized by
/// the store; callers pass display-form input.
#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub turno: Option<String>,
    pub docente: Option<String>,
    pub materia: Option<String>,
    pub aula: Option<String>,
    pub horario: Option<String>,
    pub search: Option<String>,
}

impl AssignmentFilter {
    pub fn matches(&self, record: &Assignment) -> bool {
        if let Some(turno) = &self.turno {
            if &record.turno != turno {
                return false;
            }
        }
        for (needle, haystack) in [
            (&self.docente, &record.docente_norm),
            (&self.materia, &record.materia_norm),
            (&self.aula, &record.aula_norm),
            (&self.horario, &record.horario_norm),
        ] {
            if let Some(needle) = needle {
                if !haystack.contains(&normalize(needle)) {
                    return false;
                }
            }
        }
        if let Some(search) = &self.search {
            let needle = normalize(search);
            let hit = record.docente_norm.contains(&needle)
                || record.materia_norm.contains(&needle)
                || record.aula_norm.contains(&needle)
                || record.horario_norm.contains(&needle);
            if !hit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
}

/// The record-store collaborator. `list` returns the page rows together with
/// the total match count before pagination.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn list(
        &self,
        filter: &AssignmentFilter,
        page: Option<PageRequest>,
    ) -> Result<(Vec<Assignment>, u64), StoreError>;
    async fn get(&self, id: i64) -> Result<Assignment, StoreError>;
    async fn insert_many(&self, records: Vec<NewAssignment>) -> Result<Vec<Assignment>, StoreError>;
    async fn update(&self, id: i64, patch: &AssignmentPatch) -> Result<Assignment, StoreError>;
    async fn delete(&self, id: i64) -> Result<Assignment, StoreError>;
    async fn delete_all(&self) -> Result<(), StoreError>;
}

/// Advisory admin-session tracking; purely a visual concurrency counter.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn heartbeat(&self, client_id: &str, user_agent: Option<&str>) -> Result<(), StoreError>;
    async fn active_count(&self, window: Duration) -> Result<u64, StoreError>;
}

/// Append-only record of one mutation. Owned entirely by the audit sink;
/// the core never reads it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub record_id: Option<i64>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub extra: Option<serde_json::Value>,
    pub user_agent: Option<String>,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            record_id: None,
            old_value: None,
            new_value: None,
            extra: None,
            user_agent: None,
            client_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Fire-and-forget audit sink: implementations log failures, never surface
/// them to the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SessionEntry {
    user_agent: Option<String>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    records: Vec<Assignment>,
    sessions: HashMap<String, SessionEntry>,
}

/// Store backed by process memory. Single source of truth for tests and
/// local development.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn list(
        &self,
        filter: &AssignmentFilter,
        page: Option<PageRequest>,
    ) -> Result<(Vec<Assignment>, u64), StoreError> {
        let inner = self.inner.lock().await;
        let matched: Vec<Assignment> = inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        let total = matched.len() as u64;
        let rows = match page {
            Some(page) => matched
                .into_iter()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .collect(),
            None => matched,
        };
        Ok((rows, total))
    }

    async fn get(&self, id: i64) -> Result<Assignment, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn insert_many(&self, records: Vec<NewAssignment>) -> Result<Vec<Assignment>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            inner.next_id += 1;
            let assignment = record.into_assignment(inner.next_id);
            inner.records.push(assignment.clone());
            inserted.push(assignment);
        }
        Ok(inserted)
    }

    async fn update(&self, id: i64, patch: &AssignmentPatch) -> Result<Assignment, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        patch.apply_to(record);
        Ok(record.clone())
    }

    async fn delete(&self, id: i64) -> Result<Assignment, StoreError> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        Ok(inner.records.remove(index))
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.records.clear();
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn heartbeat(&self, client_id: &str, user_agent: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(
            client_id.to_string(),
            SessionEntry {
                user_agent: user_agent.map(str::to_string),
                last_seen: Utc::now(),
            },
        );
        Ok(())
    }

    async fn active_count(&self, window: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.last_seen >= cutoff)
            .count() as u64)
    }
}

/// Audit sink that keeps entries in memory; tests read them back.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) {
        self.entries.lock().await.push(entry);
    }
}

// ---------------------------------------------------------------------------
// PostgREST-backed implementation
// ---------------------------------------------------------------------------

const ASSIGNMENTS_TABLE: &str = "asignaciones";
const SESSIONS_TABLE: &str = "admin_sessions";
const AUDIT_TABLE: &str = "auditlog";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl StoreConfig {
    /// Reads `AULAS_STORE_URL` / `AULAS_STORE_KEY`; `None` when the REST
    /// store is not configured (callers fall back to [`MemoryStore`]).
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("AULAS_STORE_URL").ok()?;
        let api_key = std::env::var("AULAS_STORE_KEY").ok()?;
        let timeout = std::env::var("AULAS_STORE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);
        Some(Self {
            base_url,
            api_key,
            timeout: Duration::from_secs(timeout),
        })
    }
}

/// PostgREST-style store client. Network timeouts live in the reqwest
/// client; no retry layer is added on top.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| StoreError::Backend(format!("clave de API inválida: {e}")))?;
        headers.insert("apikey", key);
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| StoreError::Backend(format!("clave de API inválida: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn filter_params(filter: &AssignmentFilter) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(turno) = &filter.turno {
            params.push(("turno".to_string(), format!("eq.{turno}")));
        }
        for (column, needle) in [
            ("docente_norm", &filter.docente),
            ("materia_norm", &filter.materia),
            ("aula_norm", &filter.aula),
            ("horario_norm", &filter.horario),
        ] {
            if let Some(needle) = needle {
                params.push((column.to_string(), format!("ilike.*{}*", normalize(needle))));
            }
        }
        if let Some(search) = &filter.search {
            let s = normalize(search);
            params.push((
                "or".to_string(),
                format!(
                    "(docente_norm.ilike.*{s}*,materia_norm.ilike.*{s}*,aula_norm.ilike.*{s}*,horario_norm.ilike.*{s}*)"
                ),
            ));
        }
        params
    }

    async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Backend(format!("HTTP {status}: {body}")))
    }
}

/// Parses a PostgREST `Content-Range` header (`0-19/45`, `*/45`) into the
/// total match count.
fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl AssignmentStore for RestStore {
    async fn list(
        &self,
        filter: &AssignmentFilter,
        page: Option<PageRequest>,
    ) -> Result<(Vec<Assignment>, u64), StoreError> {
        let mut params = vec![
            ("select".to_string(), "*".to_string()),
            ("order".to_string(), "id.asc".to_string()),
        ];
        params.extend(Self::filter_params(filter));

        let mut request = self
            .client
            .get(self.table_url(ASSIGNMENTS_TABLE))
            .query(&params)
            .header("Prefer", "count=exact");
        if let Some(page) = page {
            let end = page.offset + page.limit.saturating_sub(1);
            request = request.header("Range-Unit", "items").header(
                reqwest::header::RANGE,
                format!("{}-{}", page.offset, end),
            );
        }

        let response = Self::error_for_status(request.send().await?).await?;
        let total = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let rows: Vec<Assignment> = response.json().await?;
        let total = total.unwrap_or(rows.len() as u64);
        Ok((rows, total))
    }

    async fn get(&self, id: i64) -> Result<Assignment, StoreError> {
        let response = self
            .client
            .get(self.table_url(ASSIGNMENTS_TABLE))
            .query(&[
                ("select", "*".to_string()),
                ("id", format!("eq.{id}")),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<Assignment> = Self::error_for_status(response).await?.json().await?;
        rows.into_iter().next().ok_or(StoreError::NotFound(id))
    }

    async fn insert_many(&self, records: Vec<NewAssignment>) -> Result<Vec<Assignment>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(self.table_url(ASSIGNMENTS_TABLE))
            .header("Prefer", "return=representation")
            .json(&records)
            .send()
            .await?;
        Ok(Self::error_for_status(response).await?.json().await?)
    }

    async fn update(&self, id: i64, patch: &AssignmentPatch) -> Result<Assignment, StoreError> {
        // Shadow fields are recomputed client-side, like every other writer.
        let mut probe = self.get(id).await?;
        if !patch.apply_to(&mut probe) {
            return Ok(probe);
        }
        let response = self
            .client
            .patch(self.table_url(ASSIGNMENTS_TABLE))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&UpdateRow::from(&probe))
            .send()
            .await?;
        let rows: Vec<Assignment> = Self::error_for_status(response).await?.json().await?;
        rows.into_iter().next().ok_or(StoreError::NotFound(id))
    }

    async fn delete(&self, id: i64) -> Result<Assignment, StoreError> {
        let prior = self.get(id).await?;
        let response = self
            .client
            .delete(self.table_url(ASSIGNMENTS_TABLE))
            .query(&[("id", format!("eq.{id}"))])
            .send()
            .await?;
        Self::error_for_status(response).await?;
        Ok(prior)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.table_url(ASSIGNMENTS_TABLE))
            .query(&[("id", "neq.0")])
            .send()
            .await?;
        Self::error_for_status(response).await?;
        Ok(())
    }
}

/// Column set sent on PATCH: everything except the identifier.
#[derive(Debug, Serialize)]
struct UpdateRow<'a> {
    turno: &'a str,
    materia: &'a str,
    docente: &'a str,
    aula: &'a str,
    horario: &'a str,
    docente_norm: &'a str,
    materia_norm: &'a str,
    aula_norm: &'a str,
    horario_norm: &'a str,
    updated_at: DateTime<Utc>,
}

impl<'a> From<&'a Assignment> for UpdateRow<'a> {
    fn from(record: &'a Assignment) -> Self {
        Self {
            turno: &record.turno,
            materia: &record.materia,
            docente: &record.docente,
            aula: &record.aula,
            horario: &record.horario,
            docente_norm: &record.docente_norm,
            materia_norm: &record.materia_norm,
            aula_norm: &record.aula_norm,
            horario_norm: &record.horario_norm,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionRow<'a> {
    client_id: &'a str,
    user_agent: Option<&'a str>,
    last_seen: DateTime<Utc>,
}

#[async_trait]
impl SessionStore for RestStore {
    async fn heartbeat(&self, client_id: &str, user_agent: Option<&str>) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.table_url(SESSIONS_TABLE))
            .query(&[("on_conflict", "client_id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(&SessionRow {
                client_id,
                user_agent,
                last_seen: Utc::now(),
            })
            .send()
            .await?;
        Self::error_for_status(response).await?;
        Ok(())
    }

    async fn active_count(&self, window: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let response = self
            .client
            .get(self.table_url(SESSIONS_TABLE))
            .query(&[
                ("select", "client_id".to_string()),
                ("last_seen", format!("gte.{}", cutoff.to_rfc3339())),
            ])
            .header("Prefer", "count=exact")
            .header(reqwest::header::RANGE, "0-0")
            .send()
            .await?;
        let response = Self::error_for_status(response).await?;
        let total = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .unwrap_or(0);
        Ok(total)
    }
}

#[async_trait]
impl AuditSink for RestStore {
    async fn record(&self, entry: AuditEntry) {
        let result = self
            .client
            .post(self.table_url(AUDIT_TABLE))
            .json(&entry)
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), action = %entry.action, "auditlog insert rejected");
            }
            Err(err) => {
                warn!(error = %err, action = %entry.action, "auditlog insert failed");
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(turno: &str, materia: &str, docente: &str, aula: &str) -> NewAssignment {
        NewAssignment::new(turno, materia, docente, aula, "08:00-09:30")
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_many(vec![
                seed("MAÑANA", "Cálculo I", "Ana Paz", "A-101"),
                seed("TARDE", "Física II", "José Miranda", "B-202"),
                seed("TARDE", "Cálculo II", "Ana Paz", "A-102"),
                seed("NOCHE", "Redes I", "NO DEFINIDO", "LAB-1"),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn insert_assigns_sequential_unique_ids() {
        let store = seeded_store().await;
        let (rows, total) = store.list(&AssignmentFilter::default(), None).await.unwrap();
        assert_eq!(total, 4);
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn list_filters_by_shift_equality_and_accentless_substring() {
        let store = seeded_store().await;
        let filter = AssignmentFilter {
            turno: Some("TARDE".to_string()),
            materia: Some("CALCULO".to_string()),
            ..Default::default()
        };
        let (rows, total) = store.list(&filter, None).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].materia, "Cálculo II");
    }

    #[tokio::test]
    async fn search_ors_across_the_four_substring_fields() {
        let store = seeded_store().await;
        let filter = AssignmentFilter {
            search: Some("lab".to_string()),
            ..Default::default()
        };
        let (rows, _) = store.list(&filter, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].aula, "LAB-1");
    }

    #[tokio::test]
    async fn pagination_slices_rows_but_reports_full_total() {
        let store = seeded_store().await;
        let page = PageRequest { offset: 2, limit: 2 };
        let (rows, total) = store
            .list(&AssignmentFilter::default(), Some(page))
            .await
            .unwrap();
        assert_eq!(total, 4);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 3);
    }

    #[tokio::test]
    async fn update_recomputes_shadow_fields_and_missing_id_is_not_found() {
        let store = seeded_store().await;
        let patch = AssignmentPatch {
            docente: Some("María Núñez".to_string()),
            ..Default::default()
        };
        let updated = store.update(1, &patch).await.unwrap();
        assert_eq!(updated.docente, "María Núñez");
        assert_eq!(updated.docente_norm, "maria nunez");

        assert!(matches!(
            store.update(99, &patch).await,
            Err(StoreError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn delete_returns_prior_value_and_delete_all_clears() {
        let store = seeded_store().await;
        let gone = store.delete(2).await.unwrap();
        assert_eq!(gone.materia, "Física II");
        assert!(matches!(store.get(2).await, Err(StoreError::NotFound(2))));

        store.delete_all().await.unwrap();
        let (_, total) = store.list(&AssignmentFilter::default(), None).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn heartbeat_upserts_and_active_count_respects_window() {
        let store = MemoryStore::new();
        store.heartbeat("client-a", Some("ua")).await.unwrap();
        store.heartbeat("client-a", Some("ua")).await.unwrap();
        store.heartbeat("client-b", None).await.unwrap();
        let active = store.active_count(Duration::from_secs(300)).await.unwrap();
        assert_eq!(active, 2);
        let stale = store.active_count(Duration::from_secs(0)).await.unwrap();
        assert!(stale <= 2);
    }

    #[tokio::test]
    async fn memory_audit_sink_collects_entries() {
        let sink = MemoryAuditSink::new();
        let mut entry = AuditEntry::new("CREATE");
        entry.record_id = Some(7);
        sink.record(entry).await;
        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "CREATE");
        assert_eq!(entries[0].record_id, Some(7));
    }

    #[test]
    fn content_range_header_parses_totals() {
        assert_eq!(parse_content_range("0-19/45"), Some(45));
        assert_eq!(parse_content_range("*/45"), Some(45));
        assert_eq!(parse_content_range("0-19/*"), None);
    }

    #[test]
    fn rest_filter_params_fold_needles() {
        let filter = AssignmentFilter {
            turno: Some("TARDE".to_string()),
            docente: Some("Páz".to_string()),
            search: Some("CÁLCULO".to_string()),
            ..Default::default()
        };
        let params = RestStore::filter_params(&filter);
        assert!(params.contains(&("turno".to_string(), "eq.TARDE".to_string())));
        assert!(params.contains(&("docente_norm".to_string(), "ilike.*paz*".to_string())));
        let or = params.iter().find(|(k, _)| k == "or").unwrap();
        assert!(or.1.contains("materia_norm.ilike.*calculo*"));
    }
}
