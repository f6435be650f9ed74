//! Read-only reports derived from the `guesses` and `results` collections.
//!
//! `guesses` is shaped `{ client: { course: { "midsem": n, "compre": n, "timestamp": s } } }`
//! and `results` is shaped `{ course: { exam_type: average } }`. Entries that don't follow
//! that shape are skipped rather than reported as errors.
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collection::Collection;

/// A guess within this distance of the actual average is a winner
pub const WINNER_MARGIN: f64 = 1.0;

/// the exam types counted as predictions
const EXAM_TYPES: [&str; 2] = ["midsem", "compre"];

/// Maps course keys to human readable course names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseNames(HashMap<String, String>);

impl CourseNames {
    /// creates a lookup table from `names`
    pub fn new(names: HashMap<String, String>) -> Self {
        CourseNames(names)
    }

    /// the name of `course`, or the course key itself if it isn't known
    pub fn lookup<'a>(&'a self, course: &'a str) -> &'a str {
        self.0.get(course).map(String::as_str).unwrap_or(course)
    }

    /// number of known courses
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// returns `true` if no course is known
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One client's guess for one exam, joined with the actual average
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRow {
    /// the course key (collection sub-key)
    pub course: String,
    /// the exam type, e.g. `midsem`
    pub exam_type: String,
    /// the client that made the guess
    pub client: String,
    /// the guessed average
    pub guess: f64,
    /// the posted average
    pub actual: f64,
    /// `|actual - guess|`
    pub difference: f64,
    /// `difference <= WINNER_MARGIN`
    pub winner: bool,
}

impl AnalysisRow {
    fn new(course: &str, exam_type: &str, client: &str, guess: f64, actual: f64) -> Self {
        let difference = (actual - guess).abs();
        AnalysisRow {
            course: course.to_string(),
            exam_type: exam_type.to_string(),
            client: client.to_string(),
            guess,
            actual,
            difference,
            winner: difference <= WINNER_MARGIN,
        }
    }

    /// the difference rounded to 2 decimals, as reported in exports
    pub fn rounded_difference(&self) -> f64 {
        (self.difference * 100.0).round() / 100.0
    }
}

/// One client's submission for one course
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuessRow {
    /// the client that made the submission
    pub client: String,
    /// the course key
    pub course: String,
    /// the midsem guess, if any
    pub midsem: Option<Value>,
    /// the compre guess, if any
    pub compre: Option<Value>,
    /// when the submission was made, if recorded
    pub timestamp: Option<Value>,
}

/// One posted average
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// the course key
    pub course: String,
    /// the exam type
    pub exam_type: String,
    /// the posted average
    pub average: Value,
}

/// Aggregate counters over the three collections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// registered clients
    pub total_users: usize,
    /// non-null midsem and compre guesses
    pub total_predictions: usize,
    /// posted (course, exam type) averages
    pub results_set: usize,
    /// distinct courses with at least one submission
    pub unique_courses_predicted: usize,
    /// courses in the lookup table
    pub total_courses_available: usize,
}

/// Joins `guesses` against `results`.
///
/// Yields one row for every `(course, exam_type)` posted in `results` and every client whose
/// guess for that same pair is a number. The iterator borrows both collections and does all
/// the work lazily, so calling this again on fresh collections recomputes from scratch.
pub fn winners<'a>(
    guesses: &'a Collection,
    results: &'a Collection,
) -> impl Iterator<Item = AnalysisRow> + 'a {
    results
        .iter()
        .filter_map(|(course, exams)| exams.as_object().map(|exams| (course, exams)))
        .flat_map(move |(course, exams)| {
            exams
                .iter()
                .filter_map(|(exam_type, actual)| actual.as_f64().map(|actual| (exam_type, actual)))
                .flat_map(move |(exam_type, actual)| {
                    guesses.iter().filter_map(move |(client, by_course)| {
                        let guess = by_course.get(course)?.get(exam_type)?.as_f64()?;
                        Some(AnalysisRow::new(course, exam_type, client, guess, actual))
                    })
                })
        })
}

/// Owned copies of `guesses` and `results` taken at one instant, whose winners can be iterated
/// any number of times
#[derive(Debug, Clone, Default)]
pub struct Winners {
    guesses: Collection,
    results: Collection,
}

impl Winners {
    /// captures `guesses` and `results`
    pub fn new(guesses: Collection, results: Collection) -> Self {
        Winners { guesses, results }
    }

    /// a fresh pass over the joined rows, see [`winners`]
    pub fn iter(&self) -> impl Iterator<Item = AnalysisRow> + '_ {
        winners(&self.guesses, &self.results)
    }
}

/// Flattens `guesses` into one row per (client, course)
pub fn guess_rows(guesses: &Collection) -> impl Iterator<Item = GuessRow> + '_ {
    guesses
        .iter()
        .filter_map(|(client, by_course)| by_course.as_object().map(|c| (client, c)))
        .flat_map(|(client, by_course)| {
            by_course.iter().filter_map(move |(course, guess)| {
                let guess = guess.as_object()?;
                Some(GuessRow {
                    client: client.clone(),
                    course: course.clone(),
                    midsem: present(guess, "midsem"),
                    compre: present(guess, "compre"),
                    timestamp: present(guess, "timestamp"),
                })
            })
        })
}

/// Flattens `results` into one row per (course, exam type)
pub fn result_rows(results: &Collection) -> impl Iterator<Item = ResultRow> + '_ {
    results
        .iter()
        .filter_map(|(course, exams)| exams.as_object().map(|e| (course, e)))
        .flat_map(|(course, exams)| {
            exams.iter().map(move |(exam_type, average)| ResultRow {
                course: course.clone(),
                exam_type: exam_type.clone(),
                average: average.clone(),
            })
        })
}

/// Computes the aggregate counters
pub fn stats(
    users: &Collection,
    guesses: &Collection,
    results: &Collection,
    courses: &CourseNames,
) -> Stats {
    let submissions = guesses
        .values()
        .filter_map(Value::as_object)
        .flat_map(|by_course| by_course.iter());

    let mut total_predictions = 0;
    let mut unique_courses = BTreeSet::new();
    for (course, guess) in submissions {
        unique_courses.insert(course.as_str());
        total_predictions += EXAM_TYPES
            .iter()
            .filter(|exam| guess.get(**exam).map_or(false, |v| !v.is_null()))
            .count();
    }

    Stats {
        total_users: users.len(),
        total_predictions,
        results_set: results
            .values()
            .filter_map(Value::as_object)
            .map(Map::len)
            .sum(),
        unique_courses_predicted: unique_courses.len(),
        total_courses_available: courses.len(),
    }
}

/// `object[key]`, treating JSON `null` as absent
fn present(object: &Map<String, Value>, key: &str) -> Option<Value> {
    object.get(key).filter(|v| !v.is_null()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::into_collection;
    use serde_json::json;

    fn obj(v: Value) -> Collection {
        into_collection(v).unwrap()
    }

    fn row_for<'a>(rows: &'a [AnalysisRow], client: &str, exam: &str) -> &'a AnalysisRow {
        rows.iter()
            .find(|r| r.client == client && r.exam_type == exam)
            .unwrap()
    }

    #[test]
    fn winners_use_a_fixed_margin_of_one() {
        let guesses = obj(json!({
            "alice": {"cs-f111": {"midsem": 75.4, "compre": 80}},
            "bob": {"cs-f111": {"midsem": 70, "compre": 70}},
        }));
        let results = obj(json!({"cs-f111": {"midsem": 74.5, "compre": 70}}));

        let rows: Vec<_> = winners(&guesses, &results).collect();
        assert_eq!(rows.len(), 4);

        let alice_mid = row_for(&rows, "alice", "midsem");
        assert_eq!(alice_mid.rounded_difference(), 0.9);
        assert!(alice_mid.winner);

        let alice_compre = row_for(&rows, "alice", "compre");
        assert_eq!(alice_compre.difference, 10.0);
        assert!(!alice_compre.winner);

        let bob_compre = row_for(&rows, "bob", "compre");
        assert_eq!(bob_compre.difference, 0.0);
        assert!(bob_compre.winner);
    }

    #[test]
    fn winners_skip_missing_null_and_non_numeric_guesses() {
        let guesses = obj(json!({
            "alice": {"cs-f111": {"midsem": null, "compre": "sixty"}},
            "bob": {"math-f111": {"midsem": 50}},
            "carol": "not an object",
        }));
        let results = obj(json!({
            "cs-f111": {"midsem": 60, "compre": 61},
            "math-f111": {"midsem": 49.5, "compre": 40},
            "broken": 12,
        }));

        let rows: Vec<_> = winners(&guesses, &results).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client, "bob");
        assert_eq!(rows[0].course, "math-f111");
        assert!(rows[0].winner);
    }

    #[test]
    fn winners_are_restartable() {
        let guesses = obj(json!({"alice": {"cs-f111": {"midsem": 1}}}));
        let results = obj(json!({"cs-f111": {"midsem": 1}}));

        assert_eq!(winners(&guesses, &results).count(), 1);
        assert_eq!(winners(&guesses, &results).count(), 1);
    }

    #[test]
    fn projections_flatten_nested_entries() {
        let guesses = obj(json!({
            "alice": {
                "cs-f111": {"midsem": 75, "compre": null, "timestamp": "2024-03-01T10:00:00Z"},
                "bogus": 3,
            },
        }));
        let results = obj(json!({"cs-f111": {"midsem": 74.5, "compre": 70}, "x": []}));

        let g: Vec<_> = guess_rows(&guesses).collect();
        assert_eq!(g.len(), 1);
        assert_eq!(g[0].midsem, Some(json!(75)));
        assert_eq!(g[0].compre, None);

        let r: Vec<_> = result_rows(&results).collect();
        assert_eq!(r.len(), 2);
        assert!(r.iter().all(|row| row.course == "cs-f111"));
    }

    #[test]
    fn stats_count_non_null_predictions() {
        let users = obj(json!({"alice": {}, "bob": {}}));
        let guesses = obj(json!({
            "alice": {"cs-f111": {"midsem": 75, "compre": null}, "math-f111": {"compre": 60}},
            "bob": {"cs-f111": {"midsem": 70, "compre": 71}},
        }));
        let results = obj(json!({"cs-f111": {"midsem": 74.5, "compre": 70}}));
        let mut names = HashMap::new();
        names.insert("cs-f111".to_string(), "CS F111 - Computer Programming".to_string());
        let courses = CourseNames::new(names);

        let s = stats(&users, &guesses, &results, &courses);
        assert_eq!(s.total_users, 2);
        assert_eq!(s.total_predictions, 4);
        assert_eq!(s.results_set, 2);
        assert_eq!(s.unique_courses_predicted, 2);
        assert_eq!(s.total_courses_available, 1);
        assert_eq!(courses.lookup("cs-f111"), "CS F111 - Computer Programming");
        assert_eq!(courses.lookup("phy-f111"), "phy-f111");
    }
}
