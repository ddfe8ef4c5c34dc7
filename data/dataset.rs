//! The per-view input CSV and assembly of its rows into four-view exams.
//!
//! Required columns: `patient_id, exam_id, laterality, view, file_path,
//! years_to_cancer, years_to_last_followup, split_group`. Optional columns:
//! `device`, `marked`, `acquisition_time`, `exam_index`, and one column per
//! configured risk-factor field.
//!
//! A risk-factor cell that is empty or holds one of [`MISSING_TOKENS`] (any case) means
//! the value is missing. Any other unparsable cell invalidates its row, and an invalid
//! row rejects the exam it belongs to; the rest of the file still loads. Only I/O,
//! CSV framing and missing required columns fail the whole file.

use crate::data::DataError;
use crate::risk_factors::{ResolvedRiskFactors, RiskFactorError, RiskFactorSchema, RiskFactorValue, RiskFactorVector};
use crate::types::{DeviceLabel, ExamError, ExamKey, Laterality, OutcomeLabel, Split, ViewKind, ViewSlot};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const REQUIRED_COLUMNS: [&str; 8] = [
    "patient_id",
    "exam_id",
    "laterality",
    "view",
    "file_path",
    "years_to_cancer",
    "years_to_last_followup",
    "split_group",
];

/// Risk-factor cell contents read as a missing value.
pub const MISSING_TOKENS: [&str; 5] = ["na", "n/a", "nan", "null", "none"];

/// One CSV row: a single image of a single exam.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRecord {
    /// One-based data row number, for error messages.
    pub row: usize,
    pub key: ExamKey,
    pub slot: ViewSlot,
    pub file_path: PathBuf,
    pub label: OutcomeLabel,
    pub split: Split,
    pub device: Option<DeviceLabel>,
    pub marked: bool,
    pub acquisition_time: Option<String>,
    pub exam_index: Option<i64>,
    pub risk_factors: RiskFactorVector,
}

/// Why a single row could not be read.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RowError {
    #[error("row {row}: column '{column}' has invalid value '{value}'")]
    InvalidField { row: usize, column: String, value: String },
    #[error(
        "row {row}: years_to_cancer {years_to_cancer} is later than years_to_last_followup {years_to_last_followup}"
    )]
    CancerAfterFollowup {
        row: usize,
        years_to_cancer: u32,
        years_to_last_followup: u32,
    },
}

/// A row that failed to parse, kept with the exam it names.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRow {
    pub key: ExamKey,
    pub error: RowError,
}

/// Every row of the file, split into parsed records and invalid rows.
#[derive(Debug, Default)]
pub struct ViewRows {
    pub records: Vec<ViewRecord>,
    pub invalid: Vec<InvalidRow>,
}

struct Columns {
    required: [usize; 8],
    device: Option<usize>,
    marked: Option<usize>,
    acquisition_time: Option<usize>,
    exam_index: Option<usize>,
    risk_factors: Vec<(String, usize)>,
}

impl Columns {
    fn locate(headers: &StringRecord, schema: &RiskFactorSchema) -> Result<Self, DataError> {
        let find = |name: &str| headers.iter().position(|h| h == name);
        let mut required = [0usize; 8];
        for (slot, name) in required.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = find(name).ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        }
        let risk_factors = schema
            .names()
            .filter_map(|name| find(name).map(|index| (name.to_string(), index)))
            .collect::<Vec<_>>();
        if risk_factors.len() < schema.len() {
            let absent: Vec<&str> = schema
                .names()
                .filter(|name| !risk_factors.iter().any(|(found, _)| found == name))
                .collect();
            log::info!(
                "Risk-factor columns {:?} are absent; those fields will be treated as missing.",
                absent
            );
        }
        Ok(Self {
            required,
            device: find("device"),
            marked: find("marked"),
            acquisition_time: find("acquisition_time"),
            exam_index: find("exam_index"),
            risk_factors,
        })
    }
}

fn cell<'r>(record: &'r StringRecord, index: usize) -> &'r str {
    record.get(index).unwrap_or("")
}

fn optional_cell(record: &StringRecord, index: Option<usize>) -> Option<&str> {
    index.map(|i| cell(record, i)).filter(|value| !value.is_empty())
}

fn invalid(row: usize, column: &str, value: &str) -> RowError {
    RowError::InvalidField {
        row,
        column: column.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: FromStr>(row: usize, column: &str, value: &str) -> Result<T, RowError> {
    value.parse().map_err(|_| invalid(row, column, value))
}

fn parse_flag(row: usize, value: &str) -> Result<bool, RowError> {
    match value.to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        _ => Err(invalid(row, "marked", value)),
    }
}

fn parse_risk_factor(row: usize, column: &str, value: &str) -> Result<RiskFactorValue, RowError> {
    if value.is_empty() || MISSING_TOKENS.iter().any(|token| value.eq_ignore_ascii_case(token)) {
        return Ok(RiskFactorValue::Missing);
    }
    let number: f64 = parse_number(row, column, value)?;
    if !number.is_finite() {
        return Err(invalid(row, column, value));
    }
    Ok(RiskFactorValue::Observed(number))
}

fn parse_label(row: usize, years_to_cancer: &str, years_to_last_followup: &str) -> Result<OutcomeLabel, RowError> {
    let label = OutcomeLabel::new(
        parse_number(row, "years_to_cancer", years_to_cancer)?,
        parse_number(row, "years_to_last_followup", years_to_last_followup)?,
    );
    if !label.is_consistent() {
        return Err(RowError::CancerAfterFollowup {
            row,
            years_to_cancer: label.years_to_cancer,
            years_to_last_followup: label.years_to_last_followup,
        });
    }
    Ok(label)
}

fn parse_row(
    record: &StringRecord,
    row: usize,
    key: ExamKey,
    columns: &Columns,
    base: &Path,
) -> Result<ViewRecord, RowError> {
    let [_, _, laterality_col, view_col, file_col, ytc_col, ytlf_col, split_col] = columns.required;

    let laterality_value = cell(record, laterality_col);
    let laterality = Laterality::parse(laterality_value).ok_or_else(|| invalid(row, "laterality", laterality_value))?;
    let view_value = cell(record, view_col);
    let kind = ViewKind::parse(view_value).ok_or_else(|| invalid(row, "view", view_value))?;
    let split_value = cell(record, split_col);
    let split = Split::parse(split_value).ok_or_else(|| invalid(row, "split_group", split_value))?;

    let file_value = cell(record, file_col);
    if file_value.is_empty() {
        return Err(invalid(row, "file_path", file_value));
    }
    let label = parse_label(row, cell(record, ytc_col), cell(record, ytlf_col))?;

    let mut risk_factors = RiskFactorVector::new();
    for (name, column) in &columns.risk_factors {
        risk_factors.set(name.clone(), parse_risk_factor(row, name, cell(record, *column))?);
    }

    Ok(ViewRecord {
        row,
        key,
        slot: ViewSlot::new(laterality, kind),
        file_path: base.join(file_value),
        label,
        split,
        device: optional_cell(record, columns.device).map(|d| DeviceLabel(d.to_string())),
        marked: parse_flag(row, optional_cell(record, columns.marked).unwrap_or(""))?,
        acquisition_time: optional_cell(record, columns.acquisition_time).map(str::to_string),
        exam_index: optional_cell(record, columns.exam_index)
            .map(|v| parse_number(row, "exam_index", v))
            .transpose()?,
        risk_factors,
    })
}

/// Reads every row of the dataset CSV. Relative image paths are resolved against the
/// directory containing the CSV. Rows that fail to parse are returned separately so the
/// assembler can reject their exams.
pub fn read_view_records(path: &Path, schema: &RiskFactorSchema) -> Result<ViewRows, DataError> {
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut reader = ReaderBuilder::new().has_headers(true).trim(Trim::All).from_path(path)?;
    let headers = reader.headers()?.clone();
    let columns = Columns::locate(&headers, schema)?;
    let [patient_col, exam_col, ..] = columns.required;

    let mut rows = ViewRows::default();
    for (index, result) in reader.records().enumerate() {
        let record = result?;
        let row = index + 1;
        let key = ExamKey::new(cell(&record, patient_col), cell(&record, exam_col));
        match parse_row(&record, row, key.clone(), &columns, &base) {
            Ok(view) => rows.records.push(view),
            Err(error) => {
                log::warn!("Skipping row {} of exam {}: {}", row, key, error);
                rows.invalid.push(InvalidRow { key, error });
            }
        }
    }
    log::info!(
        "Read {} view rows from '{}' ({} invalid).",
        rows.records.len(),
        path.display(),
        rows.invalid.len()
    );
    Ok(rows)
}

/// A validated exam: one image path per slot in canonical order plus exam-level fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ExamRecord {
    pub key: ExamKey,
    pub paths: [PathBuf; 4],
    pub label: OutcomeLabel,
    pub split: Split,
    pub device: Option<DeviceLabel>,
    pub exam_index: Option<i64>,
    pub risk_factors: RiskFactorVector,
    pub resolved: ResolvedRiskFactors,
}

#[derive(Debug, Error, PartialEq)]
pub enum RejectionReason {
    #[error(transparent)]
    Exam(#[from] ExamError),
    #[error("rows of the exam disagree on {0}")]
    Conflict(&'static str),
    #[error(transparent)]
    RiskFactors(#[from] RiskFactorError),
    #[error(transparent)]
    InvalidRow(#[from] RowError),
}

/// An exam left out of the cohort, kept for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub key: ExamKey,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Assembly {
    pub exams: Vec<ExamRecord>,
    pub rejected: Vec<Rejection>,
}

#[derive(Default)]
struct ExamRows {
    records: Vec<ViewRecord>,
    /// First invalid row of the exam, if any.
    invalid: Option<RowError>,
}

/// Groups view rows into exams. An exam with any invalid row is rejected.
///
/// When a slot has several rows, the one with the latest `acquisition_time` is kept
/// (timestamps compare as strings, so they must share one sortable format; a row
/// without a time loses to any row with one). Two candidates that cannot be ordered
/// make the exam ambiguous and it is rejected.
pub struct ExamAssembler<'a> {
    schema: &'a RiskFactorSchema,
}

impl<'a> ExamAssembler<'a> {
    pub fn new(schema: &'a RiskFactorSchema) -> Self {
        Self { schema }
    }

    pub fn assemble(&self, rows: ViewRows) -> Assembly {
        let mut groups: BTreeMap<ExamKey, ExamRows> = BTreeMap::new();
        for record in rows.records {
            groups.entry(record.key.clone()).or_default().records.push(record);
        }
        for row in rows.invalid {
            let group = groups.entry(row.key).or_default();
            if group.invalid.is_none() {
                group.invalid = Some(row.error);
            }
        }

        let mut assembly = Assembly::default();
        for (key, group) in groups {
            let outcome = match group.invalid {
                Some(error) => Err(RejectionReason::InvalidRow(error)),
                None => self.assemble_exam(&key, group.records),
            };
            match outcome {
                Ok(exam) => assembly.exams.push(exam),
                Err(reason) => {
                    log::warn!("Excluding exam {}: {}", key, reason);
                    assembly.rejected.push(Rejection {
                        key,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        log::info!(
            "Assembled {} exams ({} rejected).",
            assembly.exams.len(),
            assembly.rejected.len()
        );
        assembly
    }

    fn assemble_exam(&self, key: &ExamKey, rows: Vec<ViewRecord>) -> Result<ExamRecord, RejectionReason> {
        if let Some(marked) = rows.iter().find(|r| r.marked) {
            return Err(ExamError::MarkedView {
                key: key.to_string(),
                slot: marked.slot,
            }
            .into());
        }
        let first = &rows[0];
        if rows.iter().any(|r| r.label != first.label) {
            return Err(RejectionReason::Conflict("the outcome label"));
        }
        if rows.iter().any(|r| r.split != first.split) {
            return Err(RejectionReason::Conflict("the split group"));
        }
        if rows.iter().any(|r| r.device != first.device) {
            return Err(RejectionReason::Conflict("the acquisition device"));
        }
        if rows.iter().any(|r| r.exam_index != first.exam_index) {
            return Err(RejectionReason::Conflict("the exam index"));
        }
        if rows.iter().any(|r| r.risk_factors != first.risk_factors) {
            return Err(RejectionReason::Conflict("the risk factors"));
        }
        let resolved = self.schema.resolve(&first.risk_factors)?;

        let mut chosen: [Option<&ViewRecord>; 4] = [None, None, None, None];
        let mut ambiguous: [bool; 4] = [false; 4];
        for row in &rows {
            let position = row.slot.position();
            match chosen[position] {
                None => chosen[position] = Some(row),
                Some(current) => match row.acquisition_time.cmp(&current.acquisition_time) {
                    std::cmp::Ordering::Greater => {
                        chosen[position] = Some(row);
                        ambiguous[position] = false;
                    }
                    std::cmp::Ordering::Equal => ambiguous[position] = true,
                    std::cmp::Ordering::Less => {}
                },
            }
        }

        let mut paths: Vec<PathBuf> = Vec::with_capacity(4);
        for (position, slot) in ViewSlot::ALL.iter().enumerate() {
            if ambiguous[position] {
                return Err(ExamError::DuplicateView {
                    key: key.to_string(),
                    slot: *slot,
                }
                .into());
            }
            match chosen[position] {
                Some(row) => paths.push(row.file_path.clone()),
                None => {
                    return Err(ExamError::MissingView {
                        key: key.to_string(),
                        slot: *slot,
                    }
                    .into());
                }
            }
        }
        let paths: [PathBuf; 4] = paths
            .try_into()
            .map_err(|found: Vec<PathBuf>| ExamError::WrongViewCount {
                key: key.to_string(),
                found: found.len(),
            })?;

        Ok(ExamRecord {
            key: key.clone(),
            paths,
            label: first.label,
            split: first.split,
            device: first.device.clone(),
            exam_index: first.exam_index,
            risk_factors: first.risk_factors.clone(),
            resolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::data::cohort::Cohort;
    use std::fs;
    use tempfile::tempdir;

    const HEADER: &str = "patient_id,exam_id,laterality,view,file_path,years_to_cancer,years_to_last_followup,split_group,device,acquisition_time,age,density,family_history";

    fn exam_rows(patient: &str, exam: &str, extra: &str) -> Vec<String> {
        [("L", "CC"), ("L", "MLO"), ("R", "CC"), ("R", "MLO")]
            .iter()
            .map(|(side, view)| {
                format!("{patient},{exam},{side},{view},img/{exam}_{side}{view}.png,100,4,train,hologic,2020-01-01{extra}")
            })
            .collect()
    }

    fn write_csv(dir: &Path, rows: &[String]) -> PathBuf {
        let path = dir.join("views.csv");
        let mut text = String::from(HEADER);
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn rows_parse_with_optional_columns_and_missing_factors() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), &exam_rows("p1", "e1", ",61,,1"));
        let schema = ExperimentConfig::default().risk_factors;
        let rows = read_view_records(&path, &schema).unwrap();
        assert!(rows.invalid.is_empty());
        assert_eq!(rows.records.len(), 4);
        let first = &rows.records[0];
        assert_eq!(first.slot, ViewSlot::ALL[0]);
        assert_eq!(first.file_path, dir.path().join("img/e1_LCC.png"));
        assert_eq!(first.device, Some(DeviceLabel("hologic".into())));
        assert!(first.label.is_censored());
        assert_eq!(first.risk_factors.get("age"), Some(RiskFactorValue::Observed(61.0)));
        assert_eq!(first.risk_factors.get("density"), Some(RiskFactorValue::Missing));
        // Columns absent from the file are simply not supplied.
        assert_eq!(first.risk_factors.get("prior_biopsy"), None);
    }

    #[test]
    fn missing_required_column_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("views.csv");
        fs::write(&path, "patient_id,exam_id,laterality,view\np,e,L,CC\n").unwrap();
        let schema = ExperimentConfig::default().risk_factors;
        match read_view_records(&path, &schema) {
            Err(DataError::ColumnNotFound(column)) => assert_eq!(column, "file_path"),
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn bad_laterality_names_the_row() {
        let dir = tempdir().unwrap();
        let mut rows = exam_rows("p1", "e1", ",61,2,0");
        rows[2] = rows[2].replace(",R,CC,", ",X,CC,");
        let path = write_csv(dir.path(), &rows);
        let schema = ExperimentConfig::default().risk_factors;
        let parsed = read_view_records(&path, &schema).unwrap();
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(
            parsed.invalid,
            vec![InvalidRow {
                key: ExamKey::new("p1", "e1"),
                error: RowError::InvalidField {
                    row: 3,
                    column: "laterality".to_string(),
                    value: "X".to_string(),
                },
            }]
        );
    }

    #[test]
    fn one_unparsable_cell_rejects_only_its_exam() {
        let dir = tempdir().unwrap();
        let mut rows = exam_rows("p1", "e1", ",61,2,0");
        rows.extend(exam_rows("p2", "e2", ",55,1,1"));
        rows.extend(exam_rows("p3", "e3", ",47,3,0"));
        rows[4] = rows[4].replace(",55,1,1", ",sixty,1,1");
        let path = write_csv(dir.path(), &rows);
        let schema = ExperimentConfig::default().risk_factors;

        let cohort = Cohort::load(&path, &schema).unwrap();
        assert_eq!(cohort.len(), 2);
        assert_eq!(cohort.rejected().len(), 1);
        assert_eq!(cohort.rejected()[0].key, ExamKey::new("p2", "e2"));
        assert!(cohort.rejected()[0].reason.contains("'age'"));
    }

    #[test]
    fn missing_value_tokens_read_as_missing_factors() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), &exam_rows("p1", "e1", ",NA,n/a,NULL"));
        let schema = ExperimentConfig::default().risk_factors;
        let rows = read_view_records(&path, &schema).unwrap();
        assert!(rows.invalid.is_empty());
        for name in ["age", "density", "family_history"] {
            assert_eq!(rows.records[0].risk_factors.get(name), Some(RiskFactorValue::Missing));
        }
    }

    #[test]
    fn cancer_after_last_followup_rejects_the_exam() {
        let dir = tempdir().unwrap();
        let mut rows = exam_rows("p1", "e1", ",61,2,0");
        rows.extend(exam_rows("p2", "e2", ",50,1,1").into_iter().map(|row| row.replace(",100,4,", ",3,2,")));
        let path = write_csv(dir.path(), &rows);
        let schema = ExperimentConfig::default().risk_factors;
        let assembly = ExamAssembler::new(&schema).assemble(read_view_records(&path, &schema).unwrap());
        assert_eq!(assembly.exams.len(), 1);
        assert_eq!(assembly.rejected.len(), 1);
        assert_eq!(assembly.rejected[0].key, ExamKey::new("p2", "e2"));
        assert!(assembly.rejected[0].reason.contains("later than years_to_last_followup"));
    }

    #[test]
    fn assembler_rejects_incomplete_exams_and_keeps_complete_ones() {
        let dir = tempdir().unwrap();
        let mut rows = exam_rows("p1", "e1", ",61,2,0");
        let mut incomplete = exam_rows("p2", "e2", ",50,1,1");
        incomplete.pop();
        rows.extend(incomplete);
        let path = write_csv(dir.path(), &rows);
        let schema = ExperimentConfig::default().risk_factors;
        let assembly = ExamAssembler::new(&schema).assemble(read_view_records(&path, &schema).unwrap());
        assert_eq!(assembly.exams.len(), 1);
        assert_eq!(assembly.exams[0].key, ExamKey::new("p1", "e1"));
        assert_eq!(assembly.rejected.len(), 1);
        assert!(assembly.rejected[0].reason.contains("R-MLO"));
    }

    #[test]
    fn latest_acquisition_wins_per_slot() {
        let dir = tempdir().unwrap();
        let mut rows = exam_rows("p1", "e1", ",61,2,0");
        rows.push("p1,e1,L,CC,img/retake.png,100,4,train,hologic,2020-03-05,61,2,0".to_string());
        rows.push("p1,e1,L,MLO,img/older.png,100,4,train,hologic,2019-12-31,61,2,0".to_string());
        let path = write_csv(dir.path(), &rows);
        let schema = ExperimentConfig::default().risk_factors;
        let assembly = ExamAssembler::new(&schema).assemble(read_view_records(&path, &schema).unwrap());
        assert!(assembly.rejected.is_empty());
        let exam = &assembly.exams[0];
        assert_eq!(exam.paths[0], dir.path().join("img/retake.png"));
        assert_eq!(exam.paths[1], dir.path().join("img/e1_LMLO.png"));
    }

    #[test]
    fn marked_and_conflicting_exams_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("views.csv");
        let mut text = String::from(
            "patient_id,exam_id,laterality,view,file_path,years_to_cancer,years_to_last_followup,split_group,marked",
        );
        for (side, view) in [("L", "CC"), ("L", "MLO"), ("R", "CC"), ("R", "MLO")] {
            let marked = if side == "R" && view == "CC" { 1 } else { 0 };
            text.push_str(&format!("\np1,e1,{side},{view},a.png,100,3,train,{marked}"));
            let split = if view == "MLO" { "dev" } else { "train" };
            text.push_str(&format!("\np2,e2,{side},{view},b.png,100,3,{split},0"));
        }
        fs::write(&path, text).unwrap();
        let schema = ExperimentConfig::default().risk_factors;
        let assembly = ExamAssembler::new(&schema).assemble(read_view_records(&path, &schema).unwrap());
        assert!(assembly.exams.is_empty());
        assert_eq!(assembly.rejected.len(), 2);
        assert!(assembly.rejected[0].reason.contains("annotation"));
        assert!(assembly.rejected[1].reason.contains("split group"));
    }

    #[test]
    fn out_of_domain_risk_factor_rejects_the_exam() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), &exam_rows("p1", "e1", ",61,9,0"));
        let schema = ExperimentConfig::default().risk_factors;
        let assembly = ExamAssembler::new(&schema).assemble(read_view_records(&path, &schema).unwrap());
        assert!(assembly.exams.is_empty());
        assert!(assembly.rejected[0].reason.contains("density"));
    }
}
