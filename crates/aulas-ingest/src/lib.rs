//! Workbook ingestion: parses the grouped-report worksheet into normalized
//! assignment candidates plus a list of row-level errors.

use std::io::Cursor;

use aulas_core::{normalize_shift, NewAssignment, UNASSIGNED_TEACHER};
use calamine::{Data, Range, Reader, Xlsx};
use thiserror::Error;

pub const CRATE_NAME: &str = "aulas-ingest";

/// Literal the anchor cell B2 must contain for the workbook to be accepted.
pub const ANCHOR_MARKER: &str = "LISTADO GENERAL POR GRUPOS";

/// Label recorded when a shift-header row carries a blank shift cell.
const UNKNOWN_SHIFT_LABEL: &str = "DESCONOCIDO";

// Fixed worksheet geometry, 0-based. The report carries its row marker in
// column B, the shift label two cells to the right of the `Turno:` marker,
// and the data fields at fixed offsets.
pub const ANCHOR_ROW: u32 = 1;
pub const ANCHOR_COL: u32 = 1;
pub const DATA_START_ROW: u32 = 7;
pub const COL_MARKER: u32 = 1;
pub const COL_SHIFT_LABEL: u32 = 3;
pub const COL_MATERIA: u32 = 6;
pub const COL_DOCENTE: u32 = 10;
pub const COL_SUBTOTAL: u32 = 11;
pub const COL_AULA: u32 = 15;
pub const COL_HORARIO: u32 = 17;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("el archivo no es un libro de Excel legible: {0}")]
    Workbook(#[from] calamine::XlsxError),
    #[error("el libro no contiene hojas de cálculo")]
    NoWorksheet,
    #[error("no es un reporte válido: la celda B2 no contiene '{ANCHOR_MARKER}' (encontrado: '{found}')")]
    InvalidFormat { found: String },
}

/// Result of one worksheet scan. Row-level anomalies land in `errors` and
/// never abort the scan.
#[derive(Debug, Default)]
pub struct ParsedWorkbook {
    pub records: Vec<NewAssignment>,
    pub errors: Vec<String>,
}

/// Structural classification of a single worksheet row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKind {
    /// A `Turno:` header row carrying the raw shift label.
    ShiftHeader(String),
    Data,
    Skip,
}

/// Classifies one row against the report's structural markers. The rules are
/// ordered: header detection precedes the numeric check because header rows
/// are non-numeric, and subtotal detection precedes it because subtotal rows
/// may coincidentally carry a numeric marker.
pub fn classify_row(sheet: &Range<Data>, row: u32) -> RowKind {
    let marker = cell_text(sheet, row, COL_MARKER);

    if marker == "Turno:" {
        return RowKind::ShiftHeader(cell_text(sheet, row, COL_SHIFT_LABEL));
    }
    if marker.is_empty()
        || marker == "0"
        || marker.to_uppercase().contains("TOTALES")
        || marker == "Nro"
    {
        return RowKind::Skip;
    }
    if cell_text(sheet, row, COL_SUBTOTAL)
        .to_uppercase()
        .contains("SUB TOTAL")
    {
        return RowKind::Skip;
    }
    // Stray annotation rows: a data row's marker is either a numeric cell or
    // a text value starting with ".".
    if !is_numeric_cell(sheet.get_value((row, COL_MARKER))) && !marker.starts_with('.') {
        return RowKind::Skip;
    }
    RowKind::Data
}

/// Current-shift context carried across the top-down scan. Data rows seen
/// before the first shift header have no recoverable context and are dropped.
#[derive(Debug, Default)]
struct ScanState {
    current_shift: Option<String>,
}

/// Walks the worksheet top to bottom and emits normalized assignment
/// candidates. Fails only on the structural anchor check; individual
/// malformed rows are dropped or recorded in the error list.
pub fn parse_sheet(sheet: &Range<Data>) -> Result<ParsedWorkbook, IngestError> {
    let anchor = cell_text(sheet, ANCHOR_ROW, ANCHOR_COL);
    if !anchor.to_uppercase().contains(ANCHOR_MARKER) {
        return Err(IngestError::InvalidFormat { found: anchor });
    }

    let mut parsed = ParsedWorkbook::default();
    let mut state = ScanState::default();
    for row in DATA_START_ROW..=last_marker_row(sheet) {
        process_row(sheet, row, &mut state, &mut parsed);
    }
    Ok(parsed)
}

/// Opens the first worksheet of an `.xlsx`/`.xlsm` byte buffer and scans it.
pub fn parse_workbook(bytes: &[u8]) -> Result<ParsedWorkbook, IngestError> {
    let mut workbook = Xlsx::new(Cursor::new(bytes.to_vec()))?;
    let sheet = workbook
        .worksheet_range_at(0)
        .ok_or(IngestError::NoWorksheet)??;
    parse_sheet(&sheet)
}

fn process_row(sheet: &Range<Data>, row: u32, state: &mut ScanState, parsed: &mut ParsedWorkbook) {
    match classify_row(sheet, row) {
        RowKind::ShiftHeader(label) => {
            let label = if label.is_empty() {
                UNKNOWN_SHIFT_LABEL.to_string()
            } else {
                label
            };
            state.current_shift = Some(normalize_shift(&label));
        }
        RowKind::Skip => {}
        RowKind::Data => {
            let Some(turno) = state.current_shift.as_deref() else {
                // Data row precedes any shift header: dropped, not erred.
                return;
            };
            if let Some(message) = first_error_cell(sheet, row) {
                parsed.errors.push(message);
                return;
            }
            let materia = cell_text(sheet, row, COL_MATERIA);
            if materia.is_empty() || materia == "0" {
                return;
            }
            let docente = match cell_text(sheet, row, COL_DOCENTE) {
                d if d.is_empty() => UNASSIGNED_TEACHER.to_string(),
                d => d,
            };
            let aula = cell_text(sheet, row, COL_AULA);
            let horario = cell_text(sheet, row, COL_HORARIO);
            parsed
                .records
                .push(NewAssignment::new(turno, &materia, &docente, &aula, &horario));
        }
    }
}

/// Last row with non-empty content in the marker column; falls back to the
/// sheet's last row when the column is entirely empty.
fn last_marker_row(sheet: &Range<Data>) -> u32 {
    let last = sheet.end().map(|(row, _)| row).unwrap_or(0);
    let mut row = last;
    while row > 0 {
        if !cell_text(sheet, row, COL_MARKER).is_empty() {
            return row;
        }
        row -= 1;
    }
    last
}

fn is_numeric_cell(cell: Option<&Data>) -> bool {
    matches!(cell, Some(Data::Int(_)) | Some(Data::Float(_)))
}

/// Spreadsheet error value (#REF!, #DIV/0!, ...) in any extracted field of a
/// data row: the row is reported and skipped, never fatal.
fn first_error_cell(sheet: &Range<Data>, row: u32) -> Option<String> {
    for col in [COL_MATERIA, COL_DOCENTE, COL_AULA, COL_HORARIO] {
        if let Some(Data::Error(e)) = sheet.get_value((row, col)) {
            return Some(format!(
                "fila {}: la celda contiene el error '{}'; fila omitida",
                row + 1,
                e
            ));
        }
    }
    None
}

/// Display text of a cell, trimmed; empty cells map to the empty string and
/// whole numbers print without a decimal part.
fn cell_text(sheet: &Range<Data>, row: u32, col: u32) -> String {
    match sheet.get_value((row, col)) {
        None | Some(Data::Empty) | Some(Data::Error(_)) => String::new(),
        Some(Data::String(s)) => s.trim().to_string(),
        Some(Data::Int(i)) => i.to_string(),
        Some(Data::Float(f)) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Some(other) => other.to_string().trim().to_string(),
    }
}
