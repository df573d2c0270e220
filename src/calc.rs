use crate::analysis::{self, ClassBreakdown, SubjectAnalysis};
use crate::grading::{self, BandSet, GradingPolicy, NO_GRADE};
use crate::snapshot::{ExamSubjectConfig, GradeScheme, MarkRecord, MarkSection, ReportSnapshot};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Overall PASS threshold, as a percentage of the student's counted max.
pub const PASS_PERCENT: f64 = 35.0;
/// Per-subject pass threshold used for class statistics.
pub const SUBJECT_PASS_PERCENT: f64 = 35.0;
/// Section mark values always reported, even when an exam has none.
pub const FIXED_SECTION_BUCKETS: [u32; 6] = [1, 2, 3, 4, 5, 6];

const ABSENT_SENTINEL: &str = "A";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkState {
    Blank,
    Absent,
    Scored(f64),
}

impl MarkState {
    /// `"A"` is an absence, empty is not entered, anything else is a
    /// number; junk and non-finite numbers score 0.
    pub fn parse(raw: &str) -> Self {
        let t = raw.trim();
        if t.is_empty() {
            return MarkState::Blank;
        }
        if t == ABSENT_SENTINEL {
            return MarkState::Absent;
        }
        match t.parse::<f64>() {
            Ok(v) if v.is_finite() => MarkState::Scored(v),
            _ => MarkState::Scored(0.0),
        }
    }

    pub fn value(self) -> f64 {
        match self {
            MarkState::Scored(v) => v,
            MarkState::Blank | MarkState::Absent => 0.0,
        }
    }

    pub fn is_blank(self) -> bool {
        self == MarkState::Blank
    }

    pub fn is_absent(self) -> bool {
        self == MarkState::Absent
    }
}

/// `100 * obtained / max`, or 0 whenever that would not be a finite number.
pub fn percent_of(obtained: f64, max: f64) -> f64 {
    if max > 0.0 {
        let p = 100.0 * obtained / max;
        if p.is_finite() {
            return p;
        }
    }
    0.0
}

/// One-decimal rounding with halves going up: `floor(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RankBasis {
    #[default]
    GrandTotal,
    Percentage,
}

impl RankBasis {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grandtotal" | "total" => Some(RankBasis::GrandTotal),
            "percentage" | "percent" => Some(RankBasis::Percentage),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RankBasis::GrandTotal => "grandTotal",
            RankBasis::Percentage => "percentage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOptions {
    pub include_te: bool,
    pub include_ce: bool,
    pub rank_by: RankBasis,
    pub default_scheme_id: Option<String>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            include_te: true,
            include_ce: true,
            rank_by: RankBasis::GrandTotal,
            default_scheme_id: None,
        }
    }
}

/// Applies a request's `options` object over `base`.
pub fn parse_report_options(
    base: ReportOptions,
    raw: Option<&serde_json::Value>,
) -> Result<ReportOptions, CalcError> {
    let Some(raw) = raw else {
        return Ok(base);
    };
    if raw.is_null() {
        return Ok(base);
    }
    let Some(obj) = raw.as_object() else {
        return Err(CalcError::new("bad_params", "options must be an object"));
    };

    let mut out = base;
    for (key, v) in obj {
        match key.as_str() {
            "includeTe" | "includeCe" => {
                let Some(b) = v.as_bool() else {
                    return Err(CalcError::new(
                        "bad_params",
                        format!("options.{} must be boolean", key),
                    ));
                };
                if key == "includeTe" {
                    out.include_te = b;
                } else {
                    out.include_ce = b;
                }
            }
            "rankBy" => {
                let Some(basis) = v.as_str().and_then(RankBasis::parse) else {
                    return Err(CalcError::new(
                        "bad_params",
                        "options.rankBy must be one of: grandTotal, percentage",
                    ));
                };
                out.rank_by = basis;
            }
            "defaultSchemeId" => {
                if v.is_null() {
                    out.default_scheme_id = None;
                } else {
                    let Some(s) = v.as_str() else {
                        return Err(CalcError::new(
                            "bad_params",
                            "options.defaultSchemeId must be string or null",
                        ));
                    };
                    let t = s.trim();
                    out.default_scheme_id = if t.is_empty() { None } else { Some(t.to_string()) };
                }
            }
            _ => {
                return Err(CalcError::new(
                    "bad_params",
                    format!("unknown option: {}", key),
                ))
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionBucket {
    pub mark_value: u32,
    pub obtained: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_id: String,
    pub subject_name: String,
    pub te_raw: String,
    pub ce_raw: String,
    pub te: f64,
    pub ce: f64,
    pub te_absent: bool,
    pub ce_absent: bool,
    /// False when neither TE nor CE was entered; such a subject adds nothing
    /// to the student's total or max.
    pub counted: bool,
    pub total: f64,
    pub max: f64,
    pub percent: f64,
    pub grade: String,
    pub passed: bool,
    pub sections: Vec<SectionBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub student_id: String,
    pub name: String,
    pub gender: String,
    pub category: String,
    pub sort_order: i64,
    pub subjects: Vec<SubjectResult>,
    pub grand_total: f64,
    pub max_total: f64,
    pub percentage: f64,
    pub grade: String,
    pub result: ResultStatus,
    pub rank: usize,
    pub attendance: Option<String>,
    pub all_advices: BTreeMap<String, String>,
}

/// Inputs shared by every subject of a class: grade level, scheme, toggles.
#[derive(Debug, Clone, Copy)]
pub struct GradingContext<'a> {
    pub policy: &'a GradingPolicy,
    pub grade_level: &'a str,
    pub scheme: Option<&'a GradeScheme>,
    pub include_te: bool,
    pub include_ce: bool,
}

impl GradingContext<'_> {
    fn grade(&self, percentage: f64) -> String {
        self.policy.resolve(percentage, self.grade_level, self.scheme)
    }
}

pub fn section_breakdown(
    sections: &[MarkSection],
    record: Option<&MarkRecord>,
) -> Vec<SectionBucket> {
    let mut buckets: BTreeMap<u32, (f64, f64)> = FIXED_SECTION_BUCKETS
        .iter()
        .map(|v| (*v, (0.0, 0.0)))
        .collect();
    for section in sections {
        let obtained = record
            .and_then(|r| {
                r.detailed_marks
                    .iter()
                    .find(|d| d.section_id == section.id)
            })
            .map(|d| MarkState::parse(&d.marks).value())
            .unwrap_or(0.0);
        let entry = buckets.entry(section.mark_value).or_insert((0.0, 0.0));
        entry.0 += obtained;
        entry.1 += section.max_marks;
    }
    buckets
        .into_iter()
        .map(|(mark_value, (obtained, max))| SectionBucket {
            mark_value,
            obtained,
            max,
        })
        .collect()
}

pub fn aggregate_subject(
    ctx: &GradingContext<'_>,
    config: &ExamSubjectConfig,
    subject_name: String,
    record: Option<&MarkRecord>,
) -> SubjectResult {
    let te_raw = record.map(|r| r.te_mark.clone()).unwrap_or_default();
    let ce_raw = record.map(|r| r.ce_mark.clone()).unwrap_or_default();
    let te_state = MarkState::parse(&te_raw);
    let ce_state = MarkState::parse(&ce_raw);
    let sections = section_breakdown(&config.sections, record);

    let counted = !(te_state.is_blank() && ce_state.is_blank());
    if !counted {
        return SubjectResult {
            subject_id: config.subject_id.clone(),
            subject_name,
            te_raw,
            ce_raw,
            te: 0.0,
            ce: 0.0,
            te_absent: false,
            ce_absent: false,
            counted,
            total: 0.0,
            max: 0.0,
            percent: 0.0,
            grade: NO_GRADE.to_string(),
            passed: false,
            sections,
        };
    }

    let te = te_state.value();
    let ce = ce_state.value();
    let mut total = 0.0;
    let mut max = 0.0;
    if ctx.include_te {
        total += te;
        max += config.max_te;
    }
    if ctx.include_ce {
        total += ce;
        max += config.max_ce;
    }
    let percent = percent_of(total, max);

    SubjectResult {
        subject_id: config.subject_id.clone(),
        subject_name,
        te_raw,
        ce_raw,
        te,
        ce,
        te_absent: te_state.is_absent(),
        ce_absent: ce_state.is_absent(),
        counted,
        total,
        max,
        percent,
        grade: ctx.grade(percent),
        passed: max > 0.0 && percent >= SUBJECT_PASS_PERCENT,
        sections,
    }
}

/// Ranks students by descending `basis`; equal keys keep their input order
/// and still get distinct consecutive ranks. Returns indices in rank order.
pub fn rank_students(students: &mut [StudentResult], basis: RankBasis) -> Vec<usize> {
    let key = |s: &StudentResult| match basis {
        RankBasis::GrandTotal => s.grand_total,
        RankBasis::Percentage => s.percentage,
    };
    let mut order: Vec<usize> = (0..students.len()).collect();
    order.sort_by(|a, b| {
        key(&students[*b])
            .partial_cmp(&key(&students[*a]))
            .unwrap_or(Ordering::Equal)
    });
    for (pos, idx) in order.iter().enumerate() {
        students[*idx].rank = pos + 1;
    }
    order
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub class: crate::snapshot::ClassInfo,
    pub exam: ExamSummary,
    pub options: ReportOptions,
    pub bands: Option<BandSet>,
    pub grade_labels: Vec<String>,
    /// Roster order; `rank` is filled in on every row.
    pub students: Vec<StudentResult>,
    pub rank_order: Vec<String>,
    pub subjects: Vec<SubjectAnalysis>,
    pub class_breakdown: ClassBreakdown,
    pub score_sum: f64,
}

pub fn compute_class_report(snapshot: &ReportSnapshot, options: &ReportOptions) -> ClassReport {
    let policy = grading::standard_policy();
    let grade_level = snapshot.class.grade_level.as_str();
    let scheme = grading::select_scheme(
        &snapshot.schemes,
        grade_level,
        options.default_scheme_id.as_deref(),
    );
    let ctx = GradingContext {
        policy,
        grade_level,
        scheme,
        include_te: options.include_te,
        include_ce: options.include_ce,
    };

    let configs: Vec<&ExamSubjectConfig> = snapshot
        .exam
        .subject_configs
        .iter()
        .filter(|c| c.included)
        .collect();
    let subject_names: HashMap<&str, String> = configs
        .iter()
        .map(|c| (c.subject_id.as_str(), snapshot.subject_name(&c.subject_id)))
        .collect();
    let marks = snapshot.marks_by_pair();
    let attendance = snapshot.attendance_by_student();
    let mut advices: HashMap<&str, BTreeMap<String, String>> = HashMap::new();
    for a in &snapshot.advices {
        advices
            .entry(a.student_id.as_str())
            .or_default()
            .insert(a.subject_id.clone(), a.text.clone());
    }

    let mut students: Vec<StudentResult> = Vec::with_capacity(snapshot.students.len());
    for st in &snapshot.students {
        let subjects: Vec<SubjectResult> = configs
            .iter()
            .map(|c| {
                let name = subject_names
                    .get(c.subject_id.as_str())
                    .cloned()
                    .unwrap_or_default();
                let record = marks
                    .get(&(st.id.as_str(), c.subject_id.as_str()))
                    .copied();
                aggregate_subject(&ctx, c, name, record)
            })
            .collect();

        let grand_total: f64 = subjects.iter().map(|s| s.total).sum();
        let max_total: f64 = subjects.iter().map(|s| s.max).sum();
        let percentage = percent_of(grand_total, max_total);
        let result = if percentage >= PASS_PERCENT {
            ResultStatus::Pass
        } else {
            ResultStatus::Fail
        };

        students.push(StudentResult {
            student_id: st.id.clone(),
            name: st.name.clone(),
            gender: st.gender.clone(),
            category: st.category.clone(),
            sort_order: st.sort_order,
            subjects,
            grand_total,
            max_total,
            percentage,
            grade: ctx.grade(percentage),
            result,
            rank: 0,
            attendance: attendance
                .get(st.id.as_str())
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            all_advices: advices.remove(st.id.as_str()).unwrap_or_default(),
        });
    }

    let order = rank_students(&mut students, options.rank_by);
    let rank_order = order
        .iter()
        .map(|i| students[*i].student_id.clone())
        .collect();

    let bands = policy.bands_for(grade_level, scheme);
    let grade_labels = bands.as_ref().map(|b| b.labels()).unwrap_or_default();
    let subjects = analysis::analyze_subjects(&configs, &subject_names, &students, &grade_labels);
    let class_breakdown = analysis::class_breakdown(&snapshot.students);
    let score_sum = students.iter().map(|s| s.grand_total).sum();

    ClassReport {
        class: snapshot.class.clone(),
        exam: ExamSummary {
            id: snapshot.exam.id.clone(),
            name: snapshot.exam.name.clone(),
        },
        options: options.clone(),
        bands,
        grade_labels,
        students,
        rank_order,
        subjects,
        class_breakdown,
        score_sum,
    }
}
