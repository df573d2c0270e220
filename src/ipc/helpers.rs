use crate::ipc::error::err;
use crate::ipc::types::Request;
use crate::layout::{ColumnVisibility, DisplayMode, Measurements, Orientation, PageOptions, TextMetrics};
use rusqlite::Connection;
use serde_json::{json, Value};

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn required_u64(req: &Request, key: &str) -> Result<u64, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn db_conn<'a>(db: &'a Option<Connection>, req: &Request) -> Result<&'a Connection, Value> {
    db.as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn bad(req: &Request, message: impl Into<String>, field: &str) -> Value {
    err(
        &req.id,
        "bad_params",
        message,
        Some(json!({ "field": field })),
    )
}

fn px(req: &Request, v: &Value, key: &str, max: f64) -> Result<f64, Value> {
    match v.as_f64() {
        Some(n) if n.is_finite() && (0.0..=max).contains(&n) => Ok(n),
        _ => Err(bad(
            req,
            format!("page.{} must be a number in 0..={}", key, max),
            key,
        )),
    }
}

/// Applies `params.page` over `base`. Column toggles are merged one by one.
pub fn page_options(req: &Request, base: PageOptions) -> Result<PageOptions, Value> {
    let Some(raw) = req.params.get("page") else {
        return Ok(base);
    };
    if raw.is_null() {
        return Ok(base);
    }
    let Some(obj) = raw.as_object() else {
        return Err(bad(req, "page must be an object", "page"));
    };
    let mut out = base;
    for (k, v) in obj {
        match k.as_str() {
            "orientation" => {
                out.orientation = v.as_str().and_then(Orientation::parse).ok_or_else(|| {
                    bad(req, "page.orientation must be one of: portrait, landscape", k)
                })?;
            }
            "displayMode" => {
                out.display_mode = v.as_str().and_then(DisplayMode::parse).ok_or_else(|| {
                    bad(req, "page.displayMode must be one of: marks, grade, both", k)
                })?;
            }
            "safetyBufferPx" => out.safety_buffer_px = px(req, v, k, 400.0)?,
            "verticalPaddingPx" => out.vertical_padding_px = px(req, v, k, 600.0)?,
            "columns" => out.columns = merge_columns(req, out.columns, v)?,
            _ => return Err(bad(req, format!("unknown page field: {}", k), k)),
        }
    }
    Ok(out)
}

fn merge_columns(req: &Request, base: ColumnVisibility, v: &Value) -> Result<ColumnVisibility, Value> {
    let Some(obj) = v.as_object() else {
        return Err(bad(req, "page.columns must be an object", "columns"));
    };
    let mut out = base;
    for (k, flag) in obj {
        let Some(on) = flag.as_bool() else {
            return Err(bad(req, format!("page.columns.{} must be boolean", k), k));
        };
        let slot = match k.as_str() {
            "te" => &mut out.te,
            "ce" => &mut out.ce,
            "total" => &mut out.total,
            "percentage" => &mut out.percentage,
            "grade" => &mut out.grade,
            "rank" => &mut out.rank,
            "result" => &mut out.result,
            "attendance" => &mut out.attendance,
            "advice" => &mut out.advice,
            _ => return Err(bad(req, format!("unknown column: {}", k), k)),
        };
        *slot = on;
    }
    Ok(out)
}

/// How a plan gets its heights: renderer measurements or the text estimator.
pub enum HeightInput {
    Measured(Measurements),
    Estimate(TextMetrics),
}

pub fn height_input(req: &Request) -> Result<HeightInput, Value> {
    if let Some(m) = req.params.get("measurements").filter(|v| !v.is_null()) {
        let parsed: Measurements = serde_json::from_value(m.clone()).map_err(|e| {
            bad(req, format!("invalid measurements: {}", e), "measurements")
        })?;
        return Ok(HeightInput::Measured(parsed));
    }
    if req.params.get("estimate").and_then(|v| v.as_bool()) == Some(true) {
        let metrics = match req.params.get("textMetrics").filter(|v| !v.is_null()) {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                bad(req, format!("invalid textMetrics: {}", e), "textMetrics")
            })?,
            None => TextMetrics::default(),
        };
        return Ok(HeightInput::Estimate(metrics));
    }
    Err(err(
        &req.id,
        "bad_params",
        "provide measurements or estimate: true",
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(params: Value) -> Request {
        Request {
            id: "1".to_string(),
            method: "layout.plan".to_string(),
            params,
        }
    }

    #[test]
    fn page_options_merge_over_base() {
        let r = req(json!({
            "page": {
                "orientation": "landscape",
                "safetyBufferPx": 20,
                "columns": { "advice": true, "te": false }
            }
        }));
        let p = page_options(&r, PageOptions::default()).expect("page options");
        assert_eq!(p.orientation, Orientation::Landscape);
        assert_eq!(p.safety_buffer_px, 20.0);
        assert!(p.columns.advice);
        assert!(!p.columns.te);
        assert!(p.columns.ce);
        assert_eq!(p.display_mode, DisplayMode::Both);
    }

    #[test]
    fn page_options_reject_bad_values() {
        for page in [
            json!({ "orientation": "sideways" }),
            json!({ "safetyBufferPx": -1 }),
            json!({ "columns": { "rank": "yes" } }),
            json!({ "margin": 3 }),
        ] {
            let e = page_options(&req(json!({ "page": page })), PageOptions::default())
                .expect_err("rejected");
            assert_eq!(e["error"]["code"], "bad_params");
        }
    }

    #[test]
    fn height_input_requires_a_source() {
        assert!(height_input(&req(json!({}))).is_err());
        assert!(matches!(
            height_input(&req(json!({ "estimate": true }))),
            Ok(HeightInput::Estimate(_))
        ));
        let measured = height_input(&req(json!({
            "measurements": { "firstPageOverhead": 100, "subsequentPageOverhead": 40, "rowHeights": [20] }
        })));
        assert!(matches!(measured, Ok(HeightInput::Measured(_))));
    }
}
