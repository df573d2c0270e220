use crate::grading;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};
use crate::snapshot::{self, GradeScheme};
use serde_json::json;

fn handle_grades_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    // null stands in for a NaN percentage.
    let percentage = match req.params.get("percentage") {
        Some(v) if v.is_null() => f64::NAN,
        Some(v) => match v.as_f64() {
            Some(n) => n,
            None => return err(&req.id, "bad_params", "percentage must be a number", None),
        },
        None => return err(&req.id, "bad_params", "missing percentage", None),
    };
    let Some(grade_level) = req.params.get("gradeLevel").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing gradeLevel", None);
    };

    let schemes: Vec<GradeScheme> = match req.params.get("schemes").filter(|v| !v.is_null()) {
        Some(raw) => match serde_json::from_value(raw.clone()) {
            Ok(v) => v,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("invalid schemes: {}", e),
                    None,
                )
            }
        },
        None => match state.db.as_ref() {
            Some(conn) => match snapshot::load_grade_schemes(conn) {
                Ok(v) => v,
                Err(e) => return calc_err(&req.id, e),
            },
            None => Vec::new(),
        },
    };

    let scheme = match req.params.get("schemeId").and_then(|v| v.as_str()) {
        Some(id) => match schemes.iter().find(|s| s.id == id) {
            Some(s) => Some(s),
            None => {
                return err(
                    &req.id,
                    "not_found",
                    "grade scheme not found",
                    Some(json!({ "schemeId": id })),
                )
            }
        },
        None => {
            let defaults = match setup::report_defaults(state.db.as_ref()) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            grading::select_scheme(&schemes, grade_level, defaults.default_scheme_id.as_deref())
        }
    };

    let policy = grading::standard_policy();
    let bands = policy.bands_for(grade_level, scheme);
    let grade = grading::resolve_grade(percentage, grade_level, scheme);
    ok(
        &req.id,
        json!({
            "grade": grade,
            "tier": bands.as_ref().map(|b| b.tier.clone()),
            "schemeId": bands.as_ref().and_then(|b| b.scheme_id.clone()),
            "labels": bands.as_ref().map(|b| b.labels()).unwrap_or_default()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.resolve" => Some(handle_grades_resolve(state, req)),
        _ => None,
    }
}
