use crate::calc::ClassReport;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{height_input, page_options, required_str, required_u64, HeightInput};
use crate::ipc::types::{AppState, Request};
use crate::layout::{
    self, CommitOutcome, EstimatedHeights, HeightSource, LayoutError, PageOptions,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Heading plus rows of the gender table and the category table.
fn summary_rows(report: &ClassReport) -> usize {
    2 + 3 + report.class_breakdown.categories.len()
}

fn heights<'a>(
    input: HeightInput,
    report: &ClassReport,
    options: &'a PageOptions,
) -> HeightSource<'a> {
    match input {
        HeightInput::Measured(m) => HeightSource::Measured(m),
        HeightInput::Estimate(metrics) => HeightSource::Estimated(EstimatedHeights {
            metrics,
            options,
            subject_count: report.subjects.len(),
            summary_rows: summary_rows(report),
        }),
    }
}

fn source_name(source: &HeightSource<'_>) -> &'static str {
    match source {
        HeightSource::Measured(_) => "measured",
        HeightSource::Estimated(_) => "estimated",
    }
}

fn layout_err(req: &Request, e: &LayoutError) -> Value {
    err(&req.id, e.code(), e.to_string(), None)
}

fn report_not_found(req: &Request, report_id: &str) -> Value {
    err(
        &req.id,
        "not_found",
        "report not found",
        Some(json!({ "reportId": report_id })),
    )
}

fn handle_layout_plan(state: &mut AppState, req: &Request) -> Value {
    let report_id = match required_str(req, "reportId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let defaults = match setup::layout_defaults(state.db.as_ref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let options = match page_options(req, defaults.page) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let input = match height_input(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(cached) = state.report(&report_id) else {
        return report_not_found(req, &report_id);
    };

    let rows = &cached.report.students;
    let source = heights(input, &cached.report, &options);
    let pages = match layout::plan_pages(rows, &source, options.limits()) {
        Ok(p) => p,
        Err(e) => return layout_err(req, &e),
    };
    tracing::debug!(
        report_id = %report_id,
        pages = pages.len(),
        source = source_name(&source),
        "layout planned"
    );
    ok(
        &req.id,
        json!({
            "reportId": report_id,
            "layoutKey": layout::layout_key(rows, &options),
            "source": source_name(&source),
            "options": options,
            "usableHeightPx": options.usable_height_px(),
            "pages": pages
        }),
    )
}

fn handle_layout_request(state: &mut AppState, req: &Request) -> Value {
    let report_id = match required_str(req, "reportId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let defaults = match setup::layout_defaults(state.db.as_ref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let options = match page_options(req, defaults.page) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(cached) = state.reports.get(&report_id) else {
        return report_not_found(req, &report_id);
    };
    let key = layout::layout_key(&cached.report.students, &options);

    state
        .layout
        .set_debounce(Duration::from_millis(defaults.debounce_ms));
    let ticket = state
        .layout
        .request(&report_id, key, options, Instant::now());
    tracing::debug!(
        report_id = %report_id,
        generation = ticket.generation,
        changed = ticket.changed,
        "layout requested"
    );
    ok(
        &req.id,
        json!({
            "reportId": report_id,
            "generation": ticket.generation,
            "layoutKey": ticket.layout_key,
            "changed": ticket.changed,
            "debounceMs": ticket.debounce_ms
        }),
    )
}

fn handle_layout_commit(state: &mut AppState, req: &Request) -> Value {
    let generation = match required_u64(req, "generation") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let input = match height_input(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let pending = state
        .layout
        .pending_for(generation)
        .map(|p| (p.report_id.clone(), p.options));

    let mut body = match pending {
        None => {
            tracing::warn!(
                generation,
                current = state.layout.generation(),
                "stale layout commit dropped"
            );
            json!({
                "applied": false,
                "reason": "stale",
                "currentGeneration": state.layout.generation()
            })
        }
        Some((report_id, options)) => {
            let Some(cached) = state.reports.get(&report_id) else {
                return report_not_found(req, &report_id);
            };
            let source = heights(input, &cached.report, &options);
            let outcome =
                state
                    .layout
                    .commit(generation, &cached.report.students, &source, Instant::now());
            match outcome {
                CommitOutcome::Applied(applied) => {
                    tracing::info!(
                        report_id = %applied.report_id,
                        generation = applied.generation,
                        pages = applied.pages.len(),
                        source = source_name(&source),
                        "layout applied"
                    );
                    match serde_json::to_value(applied) {
                        Ok(mut v) => {
                            v["applied"] = json!(true);
                            v
                        }
                        Err(e) => return err(&req.id, "serialize_failed", e.to_string(), None),
                    }
                }
                CommitOutcome::Stale { current_generation } => json!({
                    "applied": false,
                    "reason": "stale",
                    "currentGeneration": current_generation
                }),
                CommitOutcome::NotSettled { remaining_ms } => json!({
                    "applied": false,
                    "reason": "not_settled",
                    "remainingMs": remaining_ms
                }),
                CommitOutcome::Failed(e) => {
                    tracing::warn!(generation, error = %e, "layout pass failed; keeping previous plan");
                    json!({
                        "applied": false,
                        "reason": e.code(),
                        "message": e.to_string()
                    })
                }
            }
        }
    };

    if body.get("applied").and_then(|v| v.as_bool()) != Some(true) {
        body["previous"] = serde_json::to_value(state.layout.applied()).unwrap_or(Value::Null);
    }
    ok(&req.id, body)
}

fn handle_layout_current(state: &mut AppState, req: &Request) -> Value {
    ok(
        &req.id,
        json!({
            "generation": state.layout.generation(),
            "pendingGeneration": state.layout.pending().map(|p| p.generation),
            "applied": serde_json::to_value(state.layout.applied()).unwrap_or(Value::Null)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "layout.plan" => Some(handle_layout_plan(state, req)),
        "layout.request" => Some(handle_layout_request(state, req)),
        "layout.commit" => Some(handle_layout_commit(state, req)),
        "layout.current" => Some(handle_layout_current(state, req)),
        _ => None,
    }
}
