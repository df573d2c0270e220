use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::calc::ClassReport;
use crate::layout::LayoutScheduler;

/// Computed reports kept for `reports.open` and layout requests.
pub const REPORT_CACHE_LIMIT: usize = 8;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedReport {
    pub report_id: String,
    pub generated_at: String,
    #[serde(flatten)]
    pub report: ClassReport,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub reports: HashMap<String, CachedReport>,
    pub report_order: VecDeque<String>,
    pub layout: LayoutScheduler,
}

impl AppState {
    pub fn cache_report(&mut self, report: CachedReport) {
        let id = report.report_id.clone();
        self.reports.insert(id.clone(), report);
        self.report_order.retain(|r| r != &id);
        self.report_order.push_back(id);
        while self.report_order.len() > REPORT_CACHE_LIMIT {
            if let Some(old) = self.report_order.pop_front() {
                self.reports.remove(&old);
            }
        }
    }

    pub fn report(&self, report_id: &str) -> Option<&CachedReport> {
        self.reports.get(report_id)
    }
}
