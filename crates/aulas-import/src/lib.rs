//! Replace-all importer: parses an uploaded workbook and destructively
//! swaps the persisted assignment set for the freshly parsed one.

use std::sync::Arc;

use aulas_core::distinct_docentes;
use aulas_ingest::{parse_sheet, parse_workbook, IngestError, ParsedWorkbook};
use aulas_store::{
    AssignmentFilter, AssignmentStore, AuditEntry, AuditSink, PageRequest, StoreError,
};
use calamine::{Data, Range};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "aulas-import";

/// Inserts are sent in blocks of this size to respect store-side payload
/// limits.
pub const BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

// Every ingest failure (unreadable workbook, missing anchor) is a
// validation failure from the caller's point of view.
impl From<IngestError> for ImportError {
    fn from(err: IngestError) -> Self {
        ImportError::Validation(err.to_string())
    }
}

/// Request-scoped identity of whoever triggered the import; carried on the
/// UPLOAD audit entry like every other mutation's fingerprint.
#[derive(Debug, Clone, Default)]
pub struct ImportActor {
    pub client_id: Option<String>,
    pub user_agent: Option<String>,
}

/// Ephemeral result of one ingestion run; persisted only as an audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub run_id: Uuid,
    pub filename: String,
    pub previous_count: u64,
    pub new_count: u64,
    pub distinct_docentes: u64,
    pub errors: Vec<String>,
}

pub struct Importer {
    store: Arc<dyn AssignmentStore>,
    audit: Arc<dyn AuditSink>,
}

impl Importer {
    pub fn new(store: Arc<dyn AssignmentStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Parses workbook bytes and replaces the persisted set. Fails with
    /// `Validation` before touching the store when the workbook is
    /// unreadable, lacks the anchor marker, or yields zero records.
    pub async fn import(
        &self,
        filename: &str,
        bytes: &[u8],
        actor: &ImportActor,
    ) -> Result<ImportOutcome, ImportError> {
        let parsed = parse_workbook(bytes)?;
        self.replace_all(filename, parsed, actor).await
    }

    /// Same contract as [`Importer::import`], for an already-opened sheet.
    pub async fn import_sheet(
        &self,
        filename: &str,
        sheet: &Range<Data>,
        actor: &ImportActor,
    ) -> Result<ImportOutcome, ImportError> {
        let parsed = parse_sheet(sheet)?;
        self.replace_all(filename, parsed, actor).await
    }

    /// Non-transactional destructive replace: once `delete_all` has run, a
    /// failed insert batch leaves the store with a partial new set and no
    /// way back. Callers who need a safety net export before uploading.
    async fn replace_all(
        &self,
        filename: &str,
        parsed: ParsedWorkbook,
        actor: &ImportActor,
    ) -> Result<ImportOutcome, ImportError> {
        if parsed.records.is_empty() {
            return Err(ImportError::Validation(
                "No se encontraron registros válidos en el archivo".to_string(),
            ));
        }

        let run_id = Uuid::new_v4();
        let (_, previous_count) = self
            .store
            .list(
                &AssignmentFilter::default(),
                Some(PageRequest { offset: 0, limit: 1 }),
            )
            .await?;

        self.store.delete_all().await?;
        for batch in parsed.records.chunks(BATCH_SIZE) {
            self.store.insert_many(batch.to_vec()).await?;
        }

        let (all, new_count) = self.store.list(&AssignmentFilter::default(), None).await?;
        let distinct = distinct_docentes(&all).len() as u64;

        let mut entry = AuditEntry::new("UPLOAD");
        entry.client_id = actor.client_id.clone();
        entry.user_agent = actor.user_agent.clone();
        entry.extra = Some(serde_json::json!({
            "run_id": run_id,
            "filename": filename,
            "registros_nuevos": new_count,
            "errores": parsed.errors,
        }));
        self.audit.record(entry).await;

        info!(
            %run_id,
            filename,
            previous_count,
            new_count,
            row_errors = parsed.errors.len(),
            "replace-all import completed"
        );

        Ok(ImportOutcome {
            run_id,
            filename: filename.to_string(),
            previous_count,
            new_count,
            distinct_docentes: distinct,
            errors: parsed.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aulas_core::{Assignment, AssignmentPatch, NewAssignment};
    use aulas_ingest::{
        ANCHOR_COL, ANCHOR_MARKER, ANCHOR_ROW, COL_AULA, COL_DOCENTE, COL_HORARIO, COL_MARKER,
        COL_MATERIA, COL_SHIFT_LABEL,
    };
    use aulas_store::{MemoryAuditSink, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn str_cell(v: &str) -> Data {
        Data::String(v.to_string())
    }

    fn report_sheet(rows: u32) -> Range<Data> {
        let mut sheet = Range::new((0, 0), (rows.max(40), 20));
        sheet.set_value((ANCHOR_ROW, ANCHOR_COL), str_cell(ANCHOR_MARKER));
        sheet
    }

    fn set_shift_header(sheet: &mut Range<Data>, row: u32, label: &str) {
        sheet.set_value((row, COL_MARKER), str_cell("Turno:"));
        sheet.set_value((row, COL_SHIFT_LABEL), str_cell(label));
    }

    fn set_data_row(sheet: &mut Range<Data>, row: u32, nro: f64, materia: &str, docente: &str) {
        sheet.set_value((row, COL_MARKER), Data::Float(nro));
        sheet.set_value((row, COL_MATERIA), str_cell(materia));
        if !docente.is_empty() {
            sheet.set_value((row, COL_DOCENTE), str_cell(docente));
        }
        sheet.set_value((row, COL_AULA), str_cell("A-101"));
        sheet.set_value((row, COL_HORARIO), str_cell("08:00-09:30"));
    }

    async fn seeded_store(n: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let old: Vec<NewAssignment> = (0..n)
            .map(|i| {
                NewAssignment::new("NOCHE", &format!("Vieja {i}"), "Docente Viejo", "Z-9", "19:00")
            })
            .collect();
        store.insert_many(old).await.unwrap();
        store
    }

    async fn store_total(store: &MemoryStore) -> u64 {
        let (_, total) = store.list(&AssignmentFilter::default(), None).await.unwrap();
        total
    }

    #[tokio::test]
    async fn replaces_previous_records_and_reports_statistics() {
        let store = seeded_store(2).await;
        let audit = Arc::new(MemoryAuditSink::new());
        let importer = Importer::new(store.clone(), audit.clone());

        let mut sheet = report_sheet(40);
        set_shift_header(&mut sheet, 8, "MAÑANA");
        set_data_row(&mut sheet, 9, 1.0, "Cálculo I", "Ana Paz");
        set_data_row(&mut sheet, 10, 2.0, "Física II", "José Miranda");
        set_data_row(&mut sheet, 11, 3.0, "Redes I", "");

        let actor = ImportActor {
            client_id: Some("cliente-7".to_string()),
            user_agent: Some("pruebas".to_string()),
        };
        let outcome = importer
            .import_sheet("reporte.xlsx", &sheet, &actor)
            .await
            .unwrap();
        assert_eq!(outcome.previous_count, 2);
        assert_eq!(outcome.new_count, 3);
        assert_eq!(outcome.distinct_docentes, 2); // sentinel row excluded
        assert!(outcome.errors.is_empty());

        let (rows, total) = store.list(&AssignmentFilter::default(), None).await.unwrap();
        assert_eq!(total, 3);
        assert!(rows.iter().all(|r| !r.materia.starts_with("Vieja")));

        let entries = audit.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "UPLOAD");
        assert_eq!(entries[0].client_id.as_deref(), Some("cliente-7"));
        assert_eq!(entries[0].user_agent.as_deref(), Some("pruebas"));
        let extra = entries[0].extra.as_ref().unwrap();
        assert_eq!(extra["filename"], "reporte.xlsx");
        assert_eq!(extra["registros_nuevos"], 3);
    }

    #[tokio::test]
    async fn missing_anchor_fails_validation_and_leaves_store_untouched() {
        let store = seeded_store(2).await;
        let importer = Importer::new(store.clone(), Arc::new(MemoryAuditSink::new()));

        let mut sheet = Range::new((0, 0), (40, 20));
        sheet.set_value((ANCHOR_ROW, ANCHOR_COL), str_cell("OTRO REPORTE"));
        set_shift_header(&mut sheet, 8, "TARDE");
        set_data_row(&mut sheet, 9, 1.0, "Cálculo I", "Ana Paz");

        let err = importer
            .import_sheet("reporte.xlsx", &sheet, &ImportActor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Validation(_)));
        assert_eq!(store_total(&store).await, 2);
    }

    #[tokio::test]
    async fn empty_parse_result_fails_validation_and_leaves_store_untouched() {
        let store = seeded_store(3).await;
        let importer = Importer::new(store.clone(), Arc::new(MemoryAuditSink::new()));

        // Valid anchor, but only skip rows below it.
        let sheet = report_sheet(40);
        let err = importer
            .import_sheet("vacio.xlsx", &sheet, &ImportActor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Validation(_)));
        assert_eq!(store_total(&store).await, 3);
    }

    #[tokio::test]
    async fn unreadable_bytes_fail_validation() {
        let importer = Importer::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuditSink::new()),
        );
        let err = importer
            .import("reporte.xlsx", b"no es un zip", &ImportActor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Validation(_)));
    }

    /// Delegating store that records insert batch sizes.
    struct BatchProbe {
        inner: Arc<MemoryStore>,
        batches: std::sync::Mutex<Vec<usize>>,
        fail_from_batch: Option<usize>,
        calls: AtomicUsize,
    }

    impl BatchProbe {
        fn new(inner: Arc<MemoryStore>, fail_from_batch: Option<usize>) -> Self {
            Self {
                inner,
                batches: std::sync::Mutex::new(Vec::new()),
                fail_from_batch,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AssignmentStore for BatchProbe {
        async fn list(
            &self,
            filter: &AssignmentFilter,
            page: Option<PageRequest>,
        ) -> Result<(Vec<Assignment>, u64), StoreError> {
            self.inner.list(filter, page).await
        }
        async fn get(&self, id: i64) -> Result<Assignment, StoreError> {
            self.inner.get(id).await
        }
        async fn insert_many(
            &self,
            records: Vec<NewAssignment>,
        ) -> Result<Vec<Assignment>, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_from_batch == Some(call) {
                return Err(StoreError::Backend("payload too large".to_string()));
            }
            self.batches.lock().unwrap().push(records.len());
            self.inner.insert_many(records).await
        }
        async fn update(
            &self,
            id: i64,
            patch: &AssignmentPatch,
        ) -> Result<Assignment, StoreError> {
            self.inner.update(id, patch).await
        }
        async fn delete(&self, id: i64) -> Result<Assignment, StoreError> {
            self.inner.delete(id).await
        }
        async fn delete_all(&self) -> Result<(), StoreError> {
            self.inner.delete_all().await
        }
    }

    fn large_sheet(rows: usize) -> Range<Data> {
        let mut sheet = report_sheet(rows as u32 + 20);
        set_shift_header(&mut sheet, 8, "TARDE");
        for i in 0..rows {
            set_data_row(&mut sheet, 9 + i as u32, i as f64 + 1.0, &format!("Materia {i}"), "Ana Paz");
        }
        sheet
    }

    #[tokio::test]
    async fn inserts_are_chunked_at_the_batch_limit() {
        let memory = Arc::new(MemoryStore::new());
        let probe = Arc::new(BatchProbe::new(memory.clone(), None));
        let importer = Importer::new(probe.clone(), Arc::new(MemoryAuditSink::new()));

        let outcome = importer
            .import_sheet("grande.xlsx", &large_sheet(BATCH_SIZE + 500), &ImportActor::default())
            .await
            .unwrap();
        assert_eq!(outcome.new_count, (BATCH_SIZE + 500) as u64);
        assert_eq!(*probe.batches.lock().unwrap(), vec![BATCH_SIZE, 500]);
    }

    /// The destructive swap has no compensating transaction: when a batch
    /// fails mid-way the previous set is already gone and only the batches
    /// inserted so far remain. This pins the accepted failure mode rather
    /// than asserting a rollback that does not exist.
    #[tokio::test]
    async fn failed_batch_leaves_partial_set_without_rollback() {
        let memory = Arc::new(MemoryStore::new());
        memory
            .insert_many(vec![NewAssignment::new("NOCHE", "Vieja", "X", "Z", "19:00")])
            .await
            .unwrap();
        let probe = Arc::new(BatchProbe::new(memory.clone(), Some(1)));
        let importer = Importer::new(probe, Arc::new(MemoryAuditSink::new()));

        let err = importer
            .import_sheet("grande.xlsx", &large_sheet(BATCH_SIZE + 500), &ImportActor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Storage(_)));

        let (rows, total) = memory.list(&AssignmentFilter::default(), None).await.unwrap();
        assert_eq!(total, BATCH_SIZE as u64);
        assert!(rows.iter().all(|r| r.materia.starts_with("Materia")));
    }
}
