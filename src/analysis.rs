use crate::calc::{round_off_1_decimal, StudentResult};
use crate::snapshot::{ExamSubjectConfig, Student};
use serde::Serialize;
use std::collections::HashMap;

/// Reservation categories tabulated on the summary page, in print order.
pub const CATEGORIES: [&str; 5] = ["General", "OBC", "OEC", "SC", "ST"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "m" | "male" | "boy" => Gender::Male,
            "f" | "female" | "girl" => Gender::Female,
            _ => Gender::Other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenderCount {
    pub male: usize,
    pub female: usize,
    /// Includes students whose gender is neither male nor female.
    pub total: usize,
}

impl GenderCount {
    fn add(&mut self, gender: Gender) {
        match gender {
            Gender::Male => self.male += 1,
            Gender::Female => self.female += 1,
            Gender::Other => {}
        }
        self.total += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeCount {
    pub grade: String,
    #[serde(flatten)]
    pub counts: GenderCount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAnalysis {
    pub subject_id: String,
    pub subject_name: String,
    pub distribution: Vec<GradeCount>,
    pub passed: usize,
    pub failed: usize,
    pub absent: usize,
    pub not_entered: usize,
    pub average_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCount {
    pub category: String,
    #[serde(flatten)]
    pub counts: GenderCount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBreakdown {
    pub gender: GenderCount,
    pub categories: Vec<CategoryCount>,
}

/// Subject x grade x gender table. `configs` are the included subjects in
/// exam order; every student's `subjects` list follows the same order.
pub fn analyze_subjects(
    configs: &[&ExamSubjectConfig],
    subject_names: &HashMap<&str, String>,
    students: &[StudentResult],
    grade_labels: &[String],
) -> Vec<SubjectAnalysis> {
    let mut out = Vec::with_capacity(configs.len());
    for (idx, config) in configs.iter().enumerate() {
        let mut distribution: Vec<GradeCount> = grade_labels
            .iter()
            .map(|g| GradeCount {
                grade: g.clone(),
                counts: GenderCount::default(),
            })
            .collect();
        let mut passed = 0usize;
        let mut failed = 0usize;
        let mut absent = 0usize;
        let mut not_entered = 0usize;
        let mut percent_sum = 0.0_f64;

        for st in students {
            let Some(subject) = st.subjects.get(idx) else {
                continue;
            };
            if !subject.counted {
                not_entered += 1;
                continue;
            }
            if subject.te_absent || subject.ce_absent {
                absent += 1;
            }
            if subject.passed {
                passed += 1;
            } else {
                failed += 1;
            }
            percent_sum += subject.percent;
            if let Some(row) = distribution.iter_mut().find(|r| r.grade == subject.grade) {
                row.counts.add(Gender::classify(&st.gender));
            }
        }

        let counted = passed + failed;
        let average_percent = if counted > 0 {
            round_off_1_decimal(percent_sum / (counted as f64))
        } else {
            0.0
        };
        out.push(SubjectAnalysis {
            subject_id: config.subject_id.clone(),
            subject_name: subject_names
                .get(config.subject_id.as_str())
                .cloned()
                .unwrap_or_else(|| config.subject_id.clone()),
            distribution,
            passed,
            failed,
            absent,
            not_entered,
            average_percent,
        });
    }
    out
}

/// Roster-only counts for the first-page summary tables.
pub fn class_breakdown(students: &[Student]) -> ClassBreakdown {
    let mut gender = GenderCount::default();
    let mut categories: Vec<CategoryCount> = CATEGORIES
        .iter()
        .map(|c| CategoryCount {
            category: c.to_string(),
            counts: GenderCount::default(),
        })
        .collect();
    for st in students {
        let g = Gender::classify(&st.gender);
        gender.add(g);
        let wanted = st.category.trim();
        if let Some(row) = categories
            .iter_mut()
            .find(|c| c.category.eq_ignore_ascii_case(wanted))
        {
            row.counts.add(g);
        }
    }
    ClassBreakdown { gender, categories }
}
