//! CSV exports of the collections and of the winners analysis.
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};

use crate::analysis::{guess_rows, result_rows, winners, CourseNames};
use crate::collection::Collection;
use crate::engine::write_atomic;
use crate::error::Result;

const GUESSES_HEADER: &str = "Username,Course,Course Name,Midsem Guess,Compre Guess,Timestamp";
const RESULTS_HEADER: &str = "Course,Course Name,Exam Type,Average";
const ANALYSIS_HEADER: &str =
    "Course,Course Name,Exam Type,Username,User Guess,Actual Average,Difference,Is Winner";

/// Where the three tables of one export were written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    /// one row per (client, course) submission
    pub guesses: PathBuf,
    /// one row per posted average
    pub results: PathBuf,
    /// one row per joined guess, with the winner flag
    pub analysis: PathBuf,
}

/// Writes the flat CSV projections of `guesses` and `results` into an export directory.
#[derive(Debug, Clone)]
pub struct Exporter {
    dir: PathBuf,
    courses: CourseNames,
}

impl Exporter {
    /// creates an exporter writing into `dir`, which is created if needed
    pub fn new(dir: impl Into<PathBuf>, courses: CourseNames) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Exporter { dir, courses })
    }

    /// the directory exports are written into
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes all three tables, each file replaced atomically.
    /// The file names carry the export time so earlier exports are kept.
    #[instrument(skip(self, guesses, results))]
    pub fn export(&self, guesses: &Collection, results: &Collection) -> Result<ExportPaths> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let paths = ExportPaths {
            guesses: self.dir.join(format!("guesses_export_{}.csv", stamp)),
            results: self.dir.join(format!("results_export_{}.csv", stamp)),
            analysis: self.dir.join(format!("detailed_analysis_{}.csv", stamp)),
        };

        write_atomic(&paths.guesses, self.guesses_csv(guesses).as_bytes())?;
        info!("guesses exported to {:?}", &paths.guesses);
        write_atomic(&paths.results, self.results_csv(results).as_bytes())?;
        info!("results exported to {:?}", &paths.results);
        write_atomic(&paths.analysis, self.analysis_csv(guesses, results).as_bytes())?;
        info!("detailed analysis exported to {:?}", &paths.analysis);

        Ok(paths)
    }

    /// renders the guesses table
    pub fn guesses_csv(&self, guesses: &Collection) -> String {
        let rows = guess_rows(guesses).map(|row| {
            csv_line(&[
                row.client.clone(),
                row.course.clone(),
                self.courses.lookup(&row.course).to_string(),
                cell(row.midsem.as_ref()),
                cell(row.compre.as_ref()),
                cell(row.timestamp.as_ref()),
            ])
        });
        table(GUESSES_HEADER, rows)
    }

    /// renders the results table
    pub fn results_csv(&self, results: &Collection) -> String {
        let rows = result_rows(results).map(|row| {
            csv_line(&[
                row.course.clone(),
                self.courses.lookup(&row.course).to_string(),
                row.exam_type.clone(),
                cell(Some(&row.average)),
            ])
        });
        table(RESULTS_HEADER, rows)
    }

    /// renders the joined analysis table
    pub fn analysis_csv(&self, guesses: &Collection, results: &Collection) -> String {
        let rows = winners(guesses, results).map(|row| {
            csv_line(&[
                row.course.clone(),
                self.courses.lookup(&row.course).to_string(),
                row.exam_type.clone(),
                row.client.clone(),
                row.guess.to_string(),
                row.actual.to_string(),
                row.rounded_difference().to_string(),
                (if row.winner { "Yes" } else { "No" }).to_string(),
            ])
        });
        table(ANALYSIS_HEADER, rows)
    }
}

fn table(header: &str, rows: impl Iterator<Item = String>) -> String {
    let mut out = String::from(header);
    out.push('\n');
    for row in rows {
        out.push_str(&row);
        out.push('\n');
    }
    out
}

/// quotes every field, doubling embedded quotes
fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| format!("\"{}\"", field.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",")
}

/// renders a JSON value as a bare CSV field, absent and `null` become empty
fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
