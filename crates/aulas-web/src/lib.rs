//! Axum JSON API: public assignment lookups plus the admin surface
//! (CRUD, replace-all upload, export, session heartbeat).

use std::sync::Arc;
use std::time::Duration;

use aulas_core::{distinct_docentes, normalize, normalize_shift, AssignmentPatch, NewAssignment, Shift};
use aulas_import::{ImportActor, ImportError, Importer};
use aulas_store::{
    AssignmentFilter, AssignmentStore, AuditEntry, AuditSink, MemoryAuditSink, MemoryStore,
    PageRequest, RestStore, SessionStore, StoreConfig, StoreError,
};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "aulas-web";

/// Upload cap enforced before multipart parsing.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

const SERVICE_NAME: &str = "Consulta de Aulas";
const DEFAULT_PER_PAGE: u64 = 20;
const MAX_PER_PAGE: u64 = 100;
const SUGGESTION_LIMIT: usize = 5;
const DEFAULT_ACTIVE_WINDOW_MINUTES: u64 = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AssignmentStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditSink>,
    pub importer: Arc<Importer>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let importer = Arc::new(Importer::new(store.clone(), audit.clone()));
        Self {
            store,
            sessions,
            audit,
            importer,
        }
    }

    /// REST store when `AULAS_STORE_URL`/`AULAS_STORE_KEY` are set, volatile
    /// in-memory store otherwise.
    pub fn from_env() -> anyhow::Result<Self> {
        match StoreConfig::from_env() {
            Some(config) => {
                let rest = Arc::new(RestStore::new(&config)?);
                Ok(Self::new(rest.clone(), rest.clone(), rest))
            }
            None => {
                warn!("AULAS_STORE_URL no configurada; usando almacén en memoria (volátil)");
                Ok(Self::in_memory())
            }
        }
    }

    pub fn in_memory() -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self::new(memory.clone(), memory, Arc::new(MemoryAuditSink::new()))
    }
}

enum ApiError {
    Validation(String),
    NotFound(String),
    Storage(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::Backend(_) => ApiError::Storage(err.to_string()),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Validation(msg) => ApiError::Validation(msg),
            ImportError::Storage(inner) => inner.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/health", get(health_handler))
        .route("/api/docentes", get(docentes_handler))
        .route("/api/sugerencias", get(sugerencias_handler))
        .route("/api/consulta", get(consulta_handler))
        .route("/api/aulas", get(aulas_handler))
        .route(
            "/api/admin/registros",
            get(registros_list_handler).post(registro_create_handler),
        )
        .route(
            "/api/admin/registros/{id}",
            get(registro_get_handler)
                .put(registro_update_handler)
                .delete(registro_delete_handler),
        )
        .route(
            "/api/admin/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/admin/export", get(export_handler))
        .route("/api/admin/session/heartbeat", post(heartbeat_handler))
        .route("/api/admin/session/active", get(session_active_handler))
        .layer(cors_layer())
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("AULAS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::from_env()?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "servidor escuchando");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-client-id"),
            HeaderName::from_static("x-user-agent"),
        ])
}

// ---------------------------------------------------------------------------
// Public endpoints
// ---------------------------------------------------------------------------

async fn index_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "servicio": SERVICE_NAME,
        "endpoints": {
            "health": "/api/health",
            "docentes": "/api/docentes?q=",
            "sugerencias": "/api/sugerencias?q=",
            "consulta": "/api/consulta?q=&turno=",
            "aulas": "/api/aulas?turno=&materia=&aula=",
            "admin_registros": "/api/admin/registros",
            "admin_upload": "/api/admin/upload",
            "admin_export": "/api/admin/export",
        }
    }))
}

async fn health_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (all, total) = state.store.list(&AssignmentFilter::default(), None).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "total_asignaciones": total,
        "total_docentes": distinct_docentes(&all).len(),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize, Default)]
struct TextQuery {
    q: Option<String>,
}

async fn docentes_handler(
    State(state): State<AppState>,
    Query(query): Query<TextQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (all, _) = state.store.list(&AssignmentFilter::default(), None).await?;
    let mut docentes = distinct_docentes(&all);
    if let Some(q) = query.q.as_deref().map(normalize).filter(|q| !q.is_empty()) {
        docentes.retain(|d| normalize(d).contains(&q));
    }
    Ok(Json(serde_json::json!({
        "total": docentes.len(),
        "docentes": docentes,
    })))
}

#[derive(Debug, Serialize)]
struct Suggestion {
    texto: String,
    tipo: &'static str,
}

async fn sugerencias_handler(
    State(state): State<AppState>,
    Query(query): Query<TextQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let needle = query.q.as_deref().map(normalize).unwrap_or_default();
    if needle.chars().count() < 2 {
        return Ok(Json(serde_json::json!({ "sugerencias": [], "total": 0 })));
    }

    let (all, _) = state.store.list(&AssignmentFilter::default(), None).await?;
    let mut suggestions: Vec<Suggestion> = Vec::new();

    for docente in distinct_docentes(&all) {
        if suggestions.len() == SUGGESTION_LIMIT {
            break;
        }
        if normalize(&docente).contains(&needle) {
            suggestions.push(Suggestion {
                texto: docente,
                tipo: "docente",
            });
        }
    }

    let mut materias: Vec<&str> = all
        .iter()
        .filter(|r| r.materia_norm.contains(&needle))
        .map(|r| r.materia.as_str())
        .collect();
    materias.sort_by_key(|m| normalize(m));
    materias.dedup();
    for materia in materias.into_iter().take(SUGGESTION_LIMIT) {
        suggestions.push(Suggestion {
            texto: materia.to_string(),
            tipo: "materia",
        });
    }

    Ok(Json(serde_json::json!({
        "total": suggestions.len(),
        "sugerencias": suggestions,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ConsultaQuery {
    q: Option<String>,
    // Accepted as an alias for `q`; older clients query by teacher name only.
    docente: Option<String>,
    turno: Option<String>,
}

/// Teacher-name search first; subject search only when no teacher matches.
/// The optional shift filter is applied after the match set is chosen, so it
/// never flips the search type.
async fn consulta_handler(
    State(state): State<AppState>,
    Query(query): Query<ConsultaQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let q = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .or_else(|| {
            query
                .docente
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
        })
        .ok_or_else(|| {
            ApiError::Validation("Parámetro 'q' o 'docente' es requerido".to_string())
        })?;

    let docente_filter = AssignmentFilter {
        docente: Some(q.to_string()),
        ..Default::default()
    };
    let (docente_hits, _) = state.store.list(&docente_filter, None).await?;

    let (mut registros, tipo_busqueda) = if docente_hits.is_empty() {
        let materia_filter = AssignmentFilter {
            materia: Some(q.to_string()),
            ..Default::default()
        };
        let (materia_hits, _) = state.store.list(&materia_filter, None).await?;
        (materia_hits, "materia")
    } else {
        (docente_hits, "docente")
    };

    let turno_filtro = query
        .turno
        .as_deref()
        .map(normalize_shift)
        .filter(|t| !t.is_empty());
    if let Some(turno) = &turno_filtro {
        registros.retain(|r| &r.turno == turno);
    }

    let encontrado = registros.first().map(|r| {
        if tipo_busqueda == "docente" {
            r.docente.clone()
        } else {
            r.materia.clone()
        }
    });

    Ok(Json(serde_json::json!({
        "tipo_busqueda": tipo_busqueda,
        "encontrado": encontrado,
        "consulta": q,
        "turno_filtro": turno_filtro,
        "total_asignaciones": registros.len(),
        "asignaciones": registros,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct AulasQuery {
    turno: Option<String>,
    materia: Option<String>,
    aula: Option<String>,
}

async fn aulas_handler(
    State(state): State<AppState>,
    Query(query): Query<AulasQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = AssignmentFilter {
        turno: query
            .turno
            .as_deref()
            .map(normalize_shift)
            .filter(|t| !t.is_empty()),
        materia: query.materia.clone().filter(|m| !m.trim().is_empty()),
        aula: query.aula.clone().filter(|a| !a.trim().is_empty()),
        ..Default::default()
    };
    let (registros, total) = state.store.list(&filter, None).await?;
    Ok(Json(serde_json::json!({
        "total": total,
        "filtros": {
            "turno": filter.turno,
            "materia": filter.materia,
            "aula": filter.aula,
        },
        "asignaciones": registros,
    })))
}

// ---------------------------------------------------------------------------
// Admin: CRUD + pagination
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct RegistrosQuery {
    page: Option<u64>,
    per_page: Option<u64>,
    search: Option<String>,
    turno: Option<String>,
}

async fn registros_list_handler(
    State(state): State<AppState>,
    Query(query): Query<RegistrosQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = AssignmentFilter {
        turno: query
            .turno
            .as_deref()
            .map(normalize_shift)
            .filter(|t| !t.is_empty()),
        search: query.search.clone().filter(|s| !s.trim().is_empty()),
        ..Default::default()
    };
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);

    // Total first, so the page number is clamped before the page is fetched.
    let (_, total) = state
        .store
        .list(&filter, Some(PageRequest { offset: 0, limit: 1 }))
        .await?;
    let total_pages = (total.div_ceil(per_page)).max(1);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);

    let (registros, _) = state
        .store
        .list(
            &filter,
            Some(PageRequest {
                offset: (page - 1) * per_page,
                limit: per_page,
            }),
        )
        .await?;

    Ok(Json(serde_json::json!({
        "registros": registros,
        "paginacion": {
            "page": page,
            "per_page": per_page,
            "total": total,
            "total_pages": total_pages,
            "has_next": page < total_pages,
            "has_prev": page > 1,
        },
        "filtros": {
            "search": filter.search,
            "turno": filter.turno,
        }
    })))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    turno: Option<String>,
    materia: Option<String>,
    docente: Option<String>,
    aula: Option<String>,
    horario: Option<String>,
}

async fn registro_create_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Result<Response, ApiError> {
    let required = |field: &Option<String>| {
        field
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let (turno, materia, docente, aula, horario) = match (
        required(&body.turno),
        required(&body.materia),
        required(&body.docente),
        required(&body.aula),
        required(&body.horario),
    ) {
        (Some(t), Some(m), Some(d), Some(a), Some(h)) => (t, m, d, a, h),
        _ => {
            return Err(ApiError::Validation(
                "Todos los campos son obligatorios".to_string(),
            ))
        }
    };

    let turno = canonical_shift(&turno)?;
    let record = NewAssignment::new(&turno, &materia, &docente, &aula, &horario);
    let mut inserted = state.store.insert_many(vec![record]).await?;
    let created = inserted
        .pop()
        .ok_or_else(|| ApiError::Storage("el almacén no devolvió el registro creado".to_string()))?;

    let mut entry = audit_entry("CREATE", &headers);
    entry.record_id = Some(created.id);
    entry.new_value = serde_json::to_value(&created).ok();
    state.audit.record(entry).await;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "mensaje": "Registro creado exitosamente",
            "registro": created,
        })),
    )
        .into_response())
}

async fn registro_get_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.store.get(id).await?;
    Ok(Json(serde_json::json!({ "registro": record })))
}

async fn registro_update_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
    Json(mut patch): Json<AssignmentPatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::Validation(
            "No se proporcionaron campos para actualizar".to_string(),
        ));
    }
    if let Some(turno) = patch.turno.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        patch.turno = Some(canonical_shift(turno)?);
    }

    let old = state.store.get(id).await?;
    let updated = state.store.update(id, &patch).await?;

    let mut entry = audit_entry("UPDATE", &headers);
    entry.record_id = Some(id);
    entry.old_value = serde_json::to_value(&old).ok();
    entry.new_value = serde_json::to_value(&updated).ok();
    state.audit.record(entry).await;

    Ok(Json(serde_json::json!({
        "mensaje": "Registro actualizado exitosamente",
        "registro": updated,
    })))
}

async fn registro_delete_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.store.delete(id).await?;

    let mut entry = audit_entry("DELETE", &headers);
    entry.record_id = Some(id);
    entry.old_value = serde_json::to_value(&deleted).ok();
    state.audit.record(entry).await;

    Ok(Json(serde_json::json!({
        "mensaje": "Registro eliminado exitosamente",
        "registro_eliminado": deleted,
    })))
}

fn canonical_shift(raw: &str) -> Result<String, ApiError> {
    let canonical = normalize_shift(raw);
    match Shift::parse(&canonical) {
        Some(shift) => Ok(shift.as_str().to_string()),
        None => Err(ApiError::Validation(format!(
            "Turno inválido: '{raw}'. Debe ser uno de: MAÑANA, MEDIO DIA, TARDE, NOCHE"
        ))),
    }
}

fn audit_entry(action: &str, headers: &HeaderMap) -> AuditEntry {
    let mut entry = AuditEntry::new(action);
    entry.client_id = header_text(headers, "x-client-id");
    entry.user_agent =
        header_text(headers, "x-user-agent").or_else(|| header_text(headers, "user-agent"));
    entry
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Admin: upload / export / sessions
// ---------------------------------------------------------------------------

async fn upload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("cuerpo multipart inválido: {e}")))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or_default().to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::Validation(format!("no se pudo leer el archivo: {e}")))?;
            file = Some((filename, data.to_vec()));
            break;
        }
    }

    let (filename, bytes) = file.ok_or_else(|| {
        ApiError::Validation("No se envió ningún archivo en el campo 'file'".to_string())
    })?;
    let lower = filename.to_lowercase();
    if !(lower.ends_with(".xlsx") || lower.ends_with(".xls") || lower.ends_with(".xlsm")) {
        return Err(ApiError::Validation(
            "Formato de archivo no válido. Solo se permiten archivos Excel (.xlsx, .xls, .xlsm)"
                .to_string(),
        ));
    }

    let actor = ImportActor {
        client_id: header_text(&headers, "x-client-id"),
        user_agent: header_text(&headers, "x-user-agent")
            .or_else(|| header_text(&headers, "user-agent")),
    };
    let outcome = state.importer.import(&filename, &bytes, &actor).await?;
    Ok(Json(serde_json::json!({
        "mensaje": "Archivo procesado exitosamente",
        "estadisticas": {
            "registros_anteriores": outcome.previous_count,
            "registros_nuevos": outcome.new_count,
            "docentes_unicos": outcome.distinct_docentes,
            "errores_encontrados": outcome.errors.len(),
        },
        "errores": outcome.errors,
    })))
}

// The backup body is the bare record array; restore tooling and the
// export-before-upload safety net both expect a top-level JSON array.
async fn export_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let (all, _) = state.store.list(&AssignmentFilter::default(), None).await?;
    let body =
        serde_json::to_string_pretty(&all).map_err(|e| ApiError::Storage(e.to_string()))?;

    let filename = format!("consultas_backup_{}.json", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok((
        [
            (header::CONTENT_TYPE, "application/json; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

async fn heartbeat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let client_id = header_text(&headers, "x-client-id").ok_or_else(|| {
        ApiError::Validation("Falta el encabezado X-Client-Id".to_string())
    })?;
    let user_agent =
        header_text(&headers, "x-user-agent").or_else(|| header_text(&headers, "user-agent"));
    state
        .sessions
        .heartbeat(&client_id, user_agent.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize, Default)]
struct ActiveQuery {
    minutes: Option<u64>,
}

async fn session_active_handler(
    State(state): State<AppState>,
    Query(query): Query<ActiveQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let minutes = query.minutes.unwrap_or(DEFAULT_ACTIVE_WINDOW_MINUTES).max(1);
    let activos = state
        .sessions
        .active_count(Duration::from_secs(minutes * 60))
        .await?;
    Ok(Json(serde_json::json!({
        "active": activos,
        "window_minutes": minutes,
    })))
}
