use crate::snapshot::{GradeBoundary, GradeScheme};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Grade shown when nothing can be resolved (NaN input, no scheme).
pub const NO_GRADE: &str = "-";

const SCHEME_FLOOR: &str = "F";
const FIXED_FLOOR: &str = "E";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelRule {
    Range { min: u32, max: u32 },
}

impl LevelRule {
    fn matches(self, level: Option<u32>) -> bool {
        let Some(level) = level else {
            return false;
        };
        match self {
            LevelRule::Range { min, max } => (min..=max).contains(&level),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradeTier {
    pub name: &'static str,
    pub rule: LevelRule,
    pub bands: Vec<GradeBoundary>,
    pub floor: &'static str,
}

/// The bands a percentage is graded against, sorted by descending minimum.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandSet {
    pub tier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme_id: Option<String>,
    pub boundaries: Vec<GradeBoundary>,
    pub floor: String,
}

impl BandSet {
    fn from_boundaries(
        tier: &str,
        scheme_id: Option<String>,
        boundaries: &[GradeBoundary],
        floor: &str,
    ) -> Self {
        let mut sorted = boundaries.to_vec();
        sorted.sort_by(|a, b| {
            b.min_percent
                .partial_cmp(&a.min_percent)
                .unwrap_or(Ordering::Equal)
        });
        Self {
            tier: tier.to_string(),
            scheme_id,
            boundaries: sorted,
            floor: floor.to_string(),
        }
    }

    pub fn grade_for(&self, percentage: f64) -> String {
        if percentage.is_nan() {
            return NO_GRADE.to_string();
        }
        self.boundaries
            .iter()
            .find(|b| b.min_percent <= percentage)
            .map(|b| b.grade.clone())
            .unwrap_or_else(|| self.floor.clone())
    }

    /// Every label this set can produce, best first.
    pub fn labels(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.boundaries.len() + 1);
        for b in &self.boundaries {
            if !out.contains(&b.grade) {
                out.push(b.grade.clone());
            }
        }
        if !out.contains(&self.floor) {
            out.push(self.floor.clone());
        }
        out
    }
}

fn band(grade: &str, min_percent: f64) -> GradeBoundary {
    GradeBoundary {
        grade: grade.to_string(),
        min_percent,
    }
}

/// Ordered grading tiers. The first tier whose rule matches the class grade
/// level wins; otherwise the class's configured scheme is used.
#[derive(Debug, Clone)]
pub struct GradingPolicy {
    pub tiers: Vec<GradeTier>,
}

impl GradingPolicy {
    pub fn standard() -> Self {
        Self {
            tiers: vec![
                GradeTier {
                    name: "secondary",
                    rule: LevelRule::Range { min: 9, max: 10 },
                    bands: vec![
                        band("A+", 90.0),
                        band("A", 80.0),
                        band("B+", 70.0),
                        band("B", 60.0),
                        band("C+", 50.0),
                        band("C", 40.0),
                        band("D+", 30.0),
                        band("D", 20.0),
                    ],
                    floor: FIXED_FLOOR,
                },
                GradeTier {
                    name: "upperPrimary",
                    rule: LevelRule::Range { min: 5, max: 8 },
                    bands: vec![
                        band("A", 80.0),
                        band("B", 60.0),
                        band("C", 40.0),
                        band("D", 30.0),
                    ],
                    floor: FIXED_FLOOR,
                },
            ],
        }
    }

    pub fn bands_for(&self, grade_level: &str, scheme: Option<&GradeScheme>) -> Option<BandSet> {
        let level = parse_grade_level(grade_level);
        if let Some(tier) = self.tiers.iter().find(|t| t.rule.matches(level)) {
            return Some(BandSet::from_boundaries(
                tier.name, None, &tier.bands, tier.floor,
            ));
        }
        scheme.map(|s| {
            BandSet::from_boundaries("scheme", Some(s.id.clone()), &s.boundaries, SCHEME_FLOOR)
        })
    }

    pub fn resolve(&self, percentage: f64, grade_level: &str, scheme: Option<&GradeScheme>) -> String {
        if percentage.is_nan() {
            return NO_GRADE.to_string();
        }
        match self.bands_for(grade_level, scheme) {
            Some(bands) => bands.grade_for(percentage),
            None => NO_GRADE.to_string(),
        }
    }
}

pub fn standard_policy() -> &'static GradingPolicy {
    static POLICY: OnceLock<GradingPolicy> = OnceLock::new();
    POLICY.get_or_init(GradingPolicy::standard)
}

pub fn resolve_grade(percentage: f64, grade_level: &str, scheme: Option<&GradeScheme>) -> String {
    standard_policy().resolve(percentage, grade_level, scheme)
}

/// First run of ASCII digits in the level text: "Class 9" -> 9, "10A" -> 10.
pub fn parse_grade_level(grade_level: &str) -> Option<u32> {
    let digits: String = grade_level
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Scheme applicable to a grade level: an exact `applicableClasses` match,
/// then the configured default, then the first scheme on file.
pub fn select_scheme<'a>(
    schemes: &'a [GradeScheme],
    grade_level: &str,
    default_scheme_id: Option<&str>,
) -> Option<&'a GradeScheme> {
    let wanted = grade_level.trim().to_ascii_lowercase();
    let exact = schemes.iter().find(|s| {
        s.applicable_classes
            .iter()
            .any(|c| c.trim().to_ascii_lowercase() == wanted)
    });
    if exact.is_some() {
        return exact;
    }
    if let Some(id) = default_scheme_id {
        if let Some(s) = schemes.iter().find(|s| s.id == id) {
            return Some(s);
        }
    }
    schemes.first()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme(id: &str, classes: &[&str], bounds: &[(&str, f64)]) -> GradeScheme {
        GradeScheme {
            id: id.to_string(),
            name: id.to_string(),
            applicable_classes: classes.iter().map(|c| c.to_string()).collect(),
            boundaries: bounds.iter().map(|(g, p)| band(g, *p)).collect(),
        }
    }

    #[test]
    fn fixed_tiers_win_over_schemes() {
        let s = scheme("s1", &["10"], &[("X", 0.0)]);
        assert_eq!(resolve_grade(91.0, "10", Some(&s)), "A+");
        assert_eq!(resolve_grade(81.0, "7", None), "A");
        assert_eq!(resolve_grade(19.9, "Class 9", None), "E");
        assert_eq!(resolve_grade(29.0, "Std 5", None), "E");
        assert_eq!(resolve_grade(30.0, "8", None), "D");
    }

    #[test]
    fn configured_scheme_used_outside_fixed_tiers() {
        let s = scheme("s1", &["3"], &[("A", 80.0), ("B", 50.0)]);
        assert_eq!(resolve_grade(65.0, "3", Some(&s)), "B");
        assert_eq!(resolve_grade(80.0, "3", Some(&s)), "A");
        assert_eq!(resolve_grade(10.0, "3", Some(&s)), "F");
        assert_eq!(resolve_grade(65.0, "3", None), NO_GRADE);
        assert_eq!(resolve_grade(65.0, "Nursery", None), NO_GRADE);
    }

    #[test]
    fn unsorted_scheme_boundaries_are_sorted_before_matching() {
        let s = scheme("s1", &[], &[("C", 30.0), ("A", 80.0), ("B", 50.0)]);
        assert_eq!(resolve_grade(55.0, "2", Some(&s)), "B");
        assert_eq!(resolve_grade(95.0, "2", Some(&s)), "A");
    }

    #[test]
    fn nan_and_infinities_are_total() {
        let s = scheme("s1", &[], &[("A", 80.0)]);
        assert_eq!(resolve_grade(f64::NAN, "10", Some(&s)), NO_GRADE);
        assert_eq!(resolve_grade(f64::NAN, "3", Some(&s)), NO_GRADE);
        assert_eq!(resolve_grade(f64::INFINITY, "10", None), "A+");
        assert_eq!(resolve_grade(f64::NEG_INFINITY, "10", None), "E");
        assert_eq!(resolve_grade(f64::INFINITY, "3", Some(&s)), "A");
        assert_eq!(resolve_grade(f64::NEG_INFINITY, "3", Some(&s)), "F");
    }

    #[test]
    fn grade_quality_never_improves_as_percentage_drops() {
        let s = scheme("s1", &[], &[("A", 75.0), ("B", 50.0), ("C", 25.0)]);
        for level in ["10", "6", "2"] {
            let bands = standard_policy()
                .bands_for(level, Some(&s))
                .expect("bands");
            let labels = bands.labels();
            let position = |g: &str| labels.iter().position(|l| l == g).expect("known label");
            let mut prev = 0usize;
            let mut p = 120.0;
            while p >= -20.0 {
                let pos = position(&resolve_grade(p, level, Some(&s)));
                assert!(pos >= prev, "level {} at {}%", level, p);
                prev = pos;
                p -= 0.5;
            }
        }
    }

    #[test]
    fn grade_level_parsing() {
        assert_eq!(parse_grade_level("Class 9"), Some(9));
        assert_eq!(parse_grade_level("10A"), Some(10));
        assert_eq!(parse_grade_level("Grade 5 (B)"), Some(5));
        assert_eq!(parse_grade_level("LKG"), None);
    }

    #[test]
    fn scheme_selection_falls_back_to_default_then_first() {
        let schemes = vec![
            scheme("first", &["1"], &[]),
            scheme("lower", &[" Class 3 ", "class 4"], &[]),
            scheme("fallback", &[], &[]),
        ];
        let pick = |level: &str, default: Option<&str>| {
            select_scheme(&schemes, level, default).map(|s| s.id.clone())
        };
        assert_eq!(pick("CLASS 4", None).as_deref(), Some("lower"));
        assert_eq!(pick("Class 3", Some("fallback")).as_deref(), Some("lower"));
        assert_eq!(pick("Class 2", Some("fallback")).as_deref(), Some("fallback"));
        assert_eq!(pick("Class 2", Some("missing")).as_deref(), Some("first"));
        assert_eq!(pick("Class 2", None).as_deref(), Some("first"));
        assert!(select_scheme(&[], "Class 2", None).is_none());
    }
}
