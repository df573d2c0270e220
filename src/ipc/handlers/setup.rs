use crate::calc::{RankBasis, ReportOptions};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::layout::{
    DisplayMode, Orientation, PageOptions, DEFAULT_DEBOUNCE_MS, DEFAULT_SAFETY_BUFFER_PX,
    DEFAULT_VERTICAL_PADDING_PX,
};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Reports,
    Layout,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "reports" => Some(Self::Reports),
            "layout" => Some(Self::Layout),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Reports => "setup.reports",
            Self::Layout => "setup.layout",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "defaultSchemeId": null,
            "rankBy": RankBasis::default().as_str()
        }),
        SetupSection::Reports => json!({
            "includeTe": true,
            "includeCe": true,
            "defaultDisplayMode": DisplayMode::default().as_str()
        }),
        SetupSection::Layout => json!({
            "safetyBufferPx": DEFAULT_SAFETY_BUFFER_PX as i64,
            "debounceMs": DEFAULT_DEBOUNCE_MS,
            "verticalPaddingPx": DEFAULT_VERTICAL_PADDING_PX as i64,
            "defaultOrientation": Orientation::default().as_str()
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    if s.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(s))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "defaultSchemeId" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 64)?);
                }
                "rankBy" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(basis) = RankBasis::parse(&s) else {
                        return Err("rankBy must be one of: grandTotal, percentage".into());
                    };
                    obj.insert(k.clone(), Value::String(basis.as_str().to_string()));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "includeTe" | "includeCe" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "defaultDisplayMode" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(mode) = DisplayMode::parse(&s) else {
                        return Err(
                            "defaultDisplayMode must be one of: marks, grade, both".into(),
                        );
                    };
                    obj.insert(k.clone(), Value::String(mode.as_str().to_string()));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
            SetupSection::Layout => match k.as_str() {
                "safetyBufferPx" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 400)?));
                }
                "debounceMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 5000)?));
                }
                "verticalPaddingPx" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 600)?));
                }
                "defaultOrientation" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(o) = Orientation::parse(&s) else {
                        return Err(
                            "defaultOrientation must be one of: portrait, landscape".into(),
                        );
                    };
                    obj.insert(k.clone(), Value::String(o.as_str().to_string()));
                }
                _ => return Err(format!("unknown layout field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: Option<&Connection>, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    let Some(conn) = conn else {
        return Ok(current);
    };
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed saved values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if let Err(msg) = merge_section_patch(section, &mut current, &one) {
                    tracing::warn!(key = section.key(), %msg, "ignoring saved setting");
                }
            }
        }
    }
    Ok(current)
}

/// Report options as configured for the workspace; built-in defaults when
/// no workspace is open.
pub fn report_defaults(conn: Option<&Connection>) -> anyhow::Result<ReportOptions> {
    let grading = load_section(conn, SetupSection::Grading)?;
    let reports = load_section(conn, SetupSection::Reports)?;
    let mut out = ReportOptions::default();
    if let Some(b) = reports.get("includeTe").and_then(|v| v.as_bool()) {
        out.include_te = b;
    }
    if let Some(b) = reports.get("includeCe").and_then(|v| v.as_bool()) {
        out.include_ce = b;
    }
    if let Some(basis) = grading
        .get("rankBy")
        .and_then(|v| v.as_str())
        .and_then(RankBasis::parse)
    {
        out.rank_by = basis;
    }
    out.default_scheme_id = grading
        .get("defaultSchemeId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct LayoutDefaults {
    pub page: PageOptions,
    pub debounce_ms: u64,
}

pub fn layout_defaults(conn: Option<&Connection>) -> anyhow::Result<LayoutDefaults> {
    let layout = load_section(conn, SetupSection::Layout)?;
    let reports = load_section(conn, SetupSection::Reports)?;
    let mut page = PageOptions::default();
    if let Some(n) = layout.get("safetyBufferPx").and_then(|v| v.as_f64()) {
        page.safety_buffer_px = n;
    }
    if let Some(n) = layout.get("verticalPaddingPx").and_then(|v| v.as_f64()) {
        page.vertical_padding_px = n;
    }
    if let Some(o) = layout
        .get("defaultOrientation")
        .and_then(|v| v.as_str())
        .and_then(Orientation::parse)
    {
        page.orientation = o;
    }
    if let Some(m) = reports
        .get("defaultDisplayMode")
        .and_then(|v| v.as_str())
        .and_then(DisplayMode::parse)
    {
        page.display_mode = m;
    }
    let debounce_ms = layout
        .get("debounceMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_DEBOUNCE_MS);
    Ok(LayoutDefaults { page, debounce_ms })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match load_section(Some(conn), SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = match load_section(Some(conn), SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let layout = match load_section(Some(conn), SetupSection::Layout) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "reports": reports,
            "layout": layout
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(Some(conn), section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let SetupSection::Layout = section {
        if let Some(ms) = current.get("debounceMs").and_then(|v| v.as_u64()) {
            state
                .layout
                .set_debounce(std::time::Duration::from_millis(ms));
        }
    }
    tracing::info!(section = section.key(), "setup updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
