use crate::calc;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, CachedReport, Request};
use crate::layout;
use crate::snapshot::{self, ReportSnapshot};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

fn load_request_snapshot(state: &AppState, req: &Request) -> Result<ReportSnapshot, Value> {
    if let Some(raw) = req.params.get("snapshot").filter(|v| !v.is_null()) {
        let mut snap = ReportSnapshot::from_json(raw).map_err(|e| calc_err(&req.id, e))?;
        // Inline snapshots without schemes borrow the workspace's.
        if snap.schemes.is_empty() {
            if let Some(conn) = state.db.as_ref() {
                snap.schemes =
                    snapshot::load_grade_schemes(conn).map_err(|e| calc_err(&req.id, e))?;
            }
        }
        return Ok(snap);
    }
    let exam_id = required_str(req, "examId")?;
    let conn = db_conn(&state.db, req)?;
    snapshot::load_snapshot(conn, &exam_id).map_err(|e| calc_err(&req.id, e))
}

fn report_json(req: &Request, cached: &CachedReport, layout_key: &layout::LayoutKey) -> Value {
    match serde_json::to_value(cached) {
        Ok(mut v) => {
            v["layoutKey"] = json!(layout_key.0);
            ok(&req.id, v)
        }
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

fn handle_reports_compute(state: &mut AppState, req: &Request) -> Value {
    let base = match setup::report_defaults(state.db.as_ref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let options = match calc::parse_report_options(base, req.params.get("options")) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let page = match setup::layout_defaults(state.db.as_ref()) {
        Ok(v) => v.page,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let snap = match load_request_snapshot(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let report = calc::compute_class_report(&snap, &options);
    let layout_key = layout::layout_key(&report.students, &page);
    let cached = CachedReport {
        report_id: uuid::Uuid::new_v4().to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        report,
    };
    tracing::info!(
        report_id = %cached.report_id,
        exam_id = %cached.report.exam.id,
        students = cached.report.students.len(),
        subjects = cached.report.subjects.len(),
        rank_by = cached.report.options.rank_by.as_str(),
        "report computed"
    );
    let resp = report_json(req, &cached, &layout_key);
    state.cache_report(cached);
    resp
}

fn handle_reports_open(state: &mut AppState, req: &Request) -> Value {
    let report_id = match required_str(req, "reportId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(cached) = state.report(&report_id) else {
        return err(
            &req.id,
            "not_found",
            "report not found",
            Some(json!({ "reportId": report_id })),
        );
    };
    let page = match setup::layout_defaults(state.db.as_ref()) {
        Ok(v) => v.page,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let layout_key = layout::layout_key(&cached.report.students, &page);
    report_json(req, cached, &layout_key)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.compute" => Some(handle_reports_compute(state, req)),
        "reports.open" => Some(handle_reports_open(state, req)),
        _ => None,
    }
}
