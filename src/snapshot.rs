use crate::calc::CalcError;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Read-only inputs for one report pass. Everything the engine looks at is
/// captured here up front so a computation never sees a half-updated roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSnapshot {
    pub class: ClassInfo,
    pub exam: Exam,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub students: Vec<Student>,
    #[serde(default)]
    pub marks: Vec<MarkRecord>,
    #[serde(default)]
    pub attendance: Vec<AttendanceRecord>,
    #[serde(default)]
    pub schemes: Vec<GradeScheme>,
    #[serde(default)]
    pub advices: Vec<AdviceRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub grade_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkSection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub mark_value: u32,
    pub max_marks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSubjectConfig {
    pub subject_id: String,
    #[serde(default)]
    pub max_te: f64,
    #[serde(default)]
    pub max_ce: f64,
    #[serde(default = "default_true")]
    pub included: bool,
    #[serde(default)]
    pub sections: Vec<MarkSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub class_id: String,
    #[serde(default)]
    pub subject_configs: Vec<ExamSubjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub class_id: String,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedMark {
    pub section_id: String,
    #[serde(default, deserialize_with = "mark_text")]
    pub marks: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRecord {
    pub student_id: String,
    pub subject_id: String,
    #[serde(default)]
    pub exam_id: String,
    #[serde(default, deserialize_with = "mark_text")]
    pub te_mark: String,
    #[serde(default, deserialize_with = "mark_text")]
    pub ce_mark: String,
    #[serde(default)]
    pub detailed_marks: Vec<DetailedMark>,
    #[serde(default)]
    pub is_locked: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    #[serde(default)]
    pub exam_id: String,
    pub student_id: String,
    #[serde(default, deserialize_with = "mark_text")]
    pub percentage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBoundary {
    pub grade: String,
    pub min_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeScheme {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub applicable_classes: Vec<String>,
    #[serde(default)]
    pub boundaries: Vec<GradeBoundary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdviceRecord {
    pub student_id: String,
    pub subject_id: String,
    #[serde(default)]
    pub text: String,
}

fn default_true() -> bool {
    true
}

// Mark entry UIs send both "45" and 45; keep the raw text either way.
fn mark_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match v {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    })
}

impl ReportSnapshot {
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, CalcError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| CalcError::new("bad_params", format!("invalid snapshot: {}", e)))
    }

    pub fn subject_name(&self, subject_id: &str) -> String {
        self.subjects
            .iter()
            .find(|s| s.id == subject_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| subject_id.to_string())
    }

    /// Marks for this snapshot's exam keyed by (student, subject). Records
    /// without an exam id are taken to belong to the snapshot exam.
    pub fn marks_by_pair(&self) -> HashMap<(&str, &str), &MarkRecord> {
        let mut out = HashMap::new();
        for m in &self.marks {
            if !m.exam_id.is_empty() && m.exam_id != self.exam.id {
                continue;
            }
            out.insert((m.student_id.as_str(), m.subject_id.as_str()), m);
        }
        out
    }

    pub fn attendance_by_student(&self) -> HashMap<&str, &str> {
        let mut out = HashMap::new();
        for a in &self.attendance {
            if !a.exam_id.is_empty() && a.exam_id != self.exam.id {
                continue;
            }
            out.insert(a.student_id.as_str(), a.percentage.as_str());
        }
        out
    }
}

fn query_failed(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

fn parse_applicable_classes(raw: &str) -> Vec<String> {
    let t = raw.trim();
    if t.is_empty() {
        return Vec::new();
    }
    if let Ok(list) = serde_json::from_str::<Vec<String>>(t) {
        return list;
    }
    t.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn load_grade_schemes(conn: &Connection) -> Result<Vec<GradeScheme>, CalcError> {
    let mut schemes_stmt = conn
        .prepare(
            "SELECT id, name, applicable_classes
             FROM grade_schemes
             ORDER BY sort_order, rowid",
        )
        .map_err(query_failed)?;
    let mut schemes: Vec<GradeScheme> = schemes_stmt
        .query_map([], |r| {
            let applicable: String = r.get(2)?;
            Ok(GradeScheme {
                id: r.get(0)?,
                name: r.get(1)?,
                applicable_classes: parse_applicable_classes(&applicable),
                boundaries: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut bounds_stmt = conn
        .prepare(
            "SELECT scheme_id, grade, min_percent
             FROM grade_boundaries
             ORDER BY scheme_id, min_percent DESC",
        )
        .map_err(query_failed)?;
    let rows = bounds_stmt
        .query_map([], |r| {
            let scheme_id: String = r.get(0)?;
            Ok((
                scheme_id,
                GradeBoundary {
                    grade: r.get(1)?,
                    min_percent: r.get(2)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    for (scheme_id, boundary) in rows {
        if let Some(s) = schemes.iter_mut().find(|s| s.id == scheme_id) {
            s.boundaries.push(boundary);
        }
    }
    Ok(schemes)
}

/// Captures everything needed to report on `exam_id` inside one read
/// transaction.
pub fn load_snapshot(conn: &Connection, exam_id: &str) -> Result<ReportSnapshot, CalcError> {
    let tx = conn.unchecked_transaction().map_err(query_failed)?;

    let exam_row: Option<(String, String)> = tx
        .query_row(
            "SELECT name, class_id FROM exams WHERE id = ?",
            [exam_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_failed)?;
    let Some((exam_name, class_id)) = exam_row else {
        return Err(CalcError::new("not_found", "exam not found"));
    };

    let class_row: Option<(String, String)> = tx
        .query_row(
            "SELECT name, grade_level FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_failed)?;
    let Some((class_name, grade_level)) = class_row else {
        return Err(CalcError::new("not_found", "class not found"));
    };

    let mut sections_stmt = tx
        .prepare(
            "SELECT id, subject_id, name, mark_value, max_marks
             FROM exam_subject_sections
             WHERE exam_id = ?
             ORDER BY sort_order, rowid",
        )
        .map_err(query_failed)?;
    let section_rows = sections_stmt
        .query_map([exam_id], |r| {
            let subject_id: String = r.get(1)?;
            Ok((
                subject_id,
                MarkSection {
                    id: r.get(0)?,
                    name: r.get(2)?,
                    mark_value: clamp_mark_value(r.get(3)?),
                    max_marks: r.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    let mut sections_by_subject: HashMap<String, Vec<MarkSection>> = HashMap::new();
    for (subject_id, section) in section_rows {
        sections_by_subject.entry(subject_id).or_default().push(section);
    }

    let mut configs_stmt = tx
        .prepare(
            "SELECT es.subject_id, COALESCE(es.max_te, 0), COALESCE(es.max_ce, 0), es.included,
                    s.name, s.code
             FROM exam_subjects es
             JOIN subjects s ON s.id = es.subject_id
             WHERE es.exam_id = ?
             ORDER BY es.sort_order, es.rowid",
        )
        .map_err(query_failed)?;
    let config_rows = configs_stmt
        .query_map([exam_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, i64>(3)? != 0,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    let mut subjects = Vec::with_capacity(config_rows.len());
    let mut subject_configs = Vec::with_capacity(config_rows.len());
    for (subject_id, max_te, max_ce, included, name, code) in config_rows {
        subjects.push(Subject {
            id: subject_id.clone(),
            name,
            code,
        });
        let sections = sections_by_subject.remove(&subject_id).unwrap_or_default();
        subject_configs.push(ExamSubjectConfig {
            subject_id,
            max_te,
            max_ce,
            included,
            sections,
        });
    }

    let mut students_stmt = tx
        .prepare(
            "SELECT id, name, COALESCE(gender, ''), COALESCE(category, ''), sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order, rowid",
        )
        .map_err(query_failed)?;
    let students: Vec<Student> = students_stmt
        .query_map([&class_id], |r| {
            Ok(Student {
                id: r.get(0)?,
                name: r.get(1)?,
                gender: r.get(2)?,
                category: r.get(3)?,
                class_id: class_id.clone(),
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut detailed_stmt = tx
        .prepare(
            "SELECT student_id, subject_id, section_id, COALESCE(marks, '')
             FROM detailed_marks
             WHERE exam_id = ?",
        )
        .map_err(query_failed)?;
    let detailed_rows = detailed_stmt
        .query_map([exam_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                DetailedMark {
                    section_id: r.get(2)?,
                    marks: r.get(3)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    let mut detailed_by_pair: HashMap<(String, String), Vec<DetailedMark>> = HashMap::new();
    for (student_id, subject_id, d) in detailed_rows {
        detailed_by_pair
            .entry((student_id, subject_id))
            .or_default()
            .push(d);
    }

    let mut marks_stmt = tx
        .prepare(
            "SELECT student_id, subject_id, COALESCE(te_mark, ''), COALESCE(ce_mark, ''), is_locked
             FROM marks
             WHERE exam_id = ?",
        )
        .map_err(query_failed)?;
    let marks: Vec<MarkRecord> = marks_stmt
        .query_map([exam_id], |r| {
            let student_id: String = r.get(0)?;
            let subject_id: String = r.get(1)?;
            Ok(MarkRecord {
                student_id,
                subject_id,
                exam_id: exam_id.to_string(),
                te_mark: r.get(2)?,
                ce_mark: r.get(3)?,
                detailed_marks: Vec::new(),
                is_locked: r.get::<_, Option<i64>>(4)?.map(|v| v != 0),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?
        .into_iter()
        .map(|mut m| {
            if let Some(d) =
                detailed_by_pair.remove(&(m.student_id.clone(), m.subject_id.clone()))
            {
                m.detailed_marks = d;
            }
            m
        })
        .collect();

    let mut attendance_stmt = tx
        .prepare("SELECT student_id, percentage FROM attendance WHERE exam_id = ?")
        .map_err(query_failed)?;
    let attendance: Vec<AttendanceRecord> = attendance_stmt
        .query_map([exam_id], |r| {
            Ok(AttendanceRecord {
                exam_id: exam_id.to_string(),
                student_id: r.get(0)?,
                percentage: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut advices_stmt = tx
        .prepare("SELECT student_id, subject_id, text FROM advices WHERE exam_id = ?")
        .map_err(query_failed)?;
    let advices: Vec<AdviceRecord> = advices_stmt
        .query_map([exam_id], |r| {
            Ok(AdviceRecord {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                text: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let schemes = load_grade_schemes(&tx)?;

    drop(sections_stmt);
    drop(configs_stmt);
    drop(students_stmt);
    drop(detailed_stmt);
    drop(marks_stmt);
    drop(attendance_stmt);
    drop(advices_stmt);
    tx.commit().map_err(query_failed)?;

    Ok(ReportSnapshot {
        class: ClassInfo {
            id: class_id.clone(),
            name: class_name,
            grade_level,
        },
        exam: Exam {
            id: exam_id.to_string(),
            name: exam_name,
            class_id,
            subject_configs,
        },
        subjects,
        students,
        marks,
        attendance,
        schemes,
        advices,
    })
}

/// Negative values read as 0; values past `u32::MAX` saturate.
fn clamp_mark_value(raw: i64) -> u32 {
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}
