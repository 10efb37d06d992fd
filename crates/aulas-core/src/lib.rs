//! Core domain model and text normalization for the classroom-assignment service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "aulas-core";

/// Placeholder docente for rows that carry no assigned teacher. Valid as a
/// stored value, excluded from distinct-teacher statistics.
pub const UNASSIGNED_TEACHER: &str = "NO DEFINIDO";

/// Canonicalizes free text for case/accent/whitespace-insensitive matching:
/// NFKD decomposition, combining marks stripped, lower-cased, trimmed.
/// Idempotent; empty input maps to the empty string.
pub fn normalize(text: &str) -> String {
    text.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

/// Folds known spelling/diacritic variants of a shift label into its
/// canonical token. Unknown labels pass through upper-cased and trimmed;
/// membership in the canonical vocabulary is enforced at the CRUD boundary,
/// not here.
pub fn normalize_shift(raw: &str) -> String {
    let folded = raw
        .trim()
        .to_uppercase()
        .replace("DÍA", "DIA")
        .replace("MEDIODIA", "MEDIO DIA");
    match folded.as_str() {
        "MANANA" | "MAÑANA" => Shift::Manana.as_str().to_string(),
        "MEDIO DIA" => Shift::MedioDia.as_str().to_string(),
        _ => folded,
    }
}

/// The four canonical teaching time-blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shift {
    Manana,
    MedioDia,
    Tarde,
    Noche,
}

impl Shift {
    pub const ALL: [Shift; 4] = [Shift::Manana, Shift::MedioDia, Shift::Tarde, Shift::Noche];

    pub fn as_str(self) -> &'static str {
        match self {
            Shift::Manana => "MAÑANA",
            Shift::MedioDia => "MEDIO DIA",
            Shift::Tarde => "TARDE",
            Shift::Noche => "NOCHE",
        }
    }

    /// Accepts only a canonical token; run [`normalize_shift`] on raw input first.
    pub fn parse(token: &str) -> Option<Shift> {
        Shift::ALL.into_iter().find(|s| s.as_str() == token)
    }
}

/// One persisted teaching-slot assignment. The `*_norm` shadow fields are
/// recomputed on every write to their display counterpart and exist solely
/// to support substring search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub turno: String,
    pub materia: String,
    pub docente: String,
    pub aula: String,
    pub horario: String,
    pub docente_norm: String,
    pub materia_norm: String,
    pub aula_norm: String,
    pub horario_norm: String,
    pub updated_at: DateTime<Utc>,
}

/// An assignment candidate before the store assigns an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAssignment {
    pub turno: String,
    pub materia: String,
    pub docente: String,
    pub aula: String,
    pub horario: String,
    pub docente_norm: String,
    pub materia_norm: String,
    pub aula_norm: String,
    pub horario_norm: String,
    pub updated_at: DateTime<Utc>,
}

impl NewAssignment {
    /// Trims all fields and computes the shadow copies. `turno` is stored
    /// as given; callers normalize and (where required) validate it first.
    pub fn new(turno: &str, materia: &str, docente: &str, aula: &str, horario: &str) -> Self {
        let materia = materia.trim().to_string();
        let docente = docente.trim().to_string();
        let aula = aula.trim().to_string();
        let horario = horario.trim().to_string();
        Self {
            turno: turno.trim().to_string(),
            docente_norm: normalize(&docente),
            materia_norm: normalize(&materia),
            aula_norm: normalize(&aula),
            horario_norm: normalize(&horario),
            materia,
            docente,
            aula,
            horario,
            updated_at: Utc::now(),
        }
    }

    pub fn into_assignment(self, id: i64) -> Assignment {
        Assignment {
            id,
            turno: self.turno,
            materia: self.materia,
            docente: self.docente,
            aula: self.aula,
            horario: self.horario,
            docente_norm: self.docente_norm,
            materia_norm: self.materia_norm,
            aula_norm: self.aula_norm,
            horario_norm: self.horario_norm,
            updated_at: self.updated_at,
        }
    }
}

/// Distinct docentes across a record set, sentinel excluded, sorted by
/// normalized form.
pub fn distinct_docentes(records: &[Assignment]) -> Vec<String> {
    let unique: std::collections::HashSet<&str> = records
        .iter()
        .map(|r| r.docente.trim())
        .filter(|name| !name.is_empty() && name.to_uppercase() != UNASSIGNED_TEACHER)
        .collect();
    let mut names: Vec<String> = unique.into_iter().map(str::to_string).collect();
    names.sort_by_key(|name| normalize(name));
    names
}

/// Partial-update payload: only fields that are present and non-empty are
/// applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turno: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materia: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docente: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horario: Option<String>,
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl AssignmentPatch {
    /// True when no field would survive the present-and-non-empty rule.
    pub fn is_empty(&self) -> bool {
        present(&self.turno).is_none()
            && present(&self.materia).is_none()
            && present(&self.docente).is_none()
            && present(&self.aula).is_none()
            && present(&self.horario).is_none()
    }

    /// Applies the surviving fields to `record`, keeping every shadow field
    /// in sync with its display counterpart and bumping `updated_at`.
    /// Returns false when nothing applied.
    pub fn apply_to(&self, record: &mut Assignment) -> bool {
        let mut applied = false;
        if let Some(turno) = present(&self.turno) {
            record.turno = turno.to_string();
            applied = true;
        }
        if let Some(materia) = present(&self.materia) {
            record.materia = materia.to_string();
            record.materia_norm = normalize(materia);
            applied = true;
        }
        if let Some(docente) = present(&self.docente) {
            record.docente = docente.to_string();
            record.docente_norm = normalize(docente);
            applied = true;
        }
        if let Some(aula) = present(&self.aula) {
            record.aula = aula.to_string();
            record.aula_norm = normalize(aula);
            applied = true;
        }
        if let Some(horario) = present(&self.horario) {
            record.horario = horario.to_string();
            record.horario_norm = normalize(horario);
            applied = true;
        }
        if applied {
            record.updated_at = Utc::now();
        }
        applied
    }
}
