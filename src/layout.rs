use crate::calc::StudentResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use std::time::{Duration, Instant};

/// CSS reference pixels per millimetre (96 dpi).
pub const PX_PER_MM: f64 = 96.0 / 25.4;
pub const A4_SHORT_MM: f64 = 210.0;
pub const A4_LONG_MM: f64 = 297.0;

pub const DEFAULT_SAFETY_BUFFER_PX: f64 = 50.0;
pub const DEFAULT_VERTICAL_PADDING_PX: f64 = 76.0;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "portrait" => Some(Orientation::Portrait),
            "landscape" => Some(Orientation::Landscape),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }

    pub fn page_height_mm(self) -> f64 {
        match self {
            Orientation::Portrait => A4_LONG_MM,
            Orientation::Landscape => A4_SHORT_MM,
        }
    }

    pub fn page_width_mm(self) -> f64 {
        match self {
            Orientation::Portrait => A4_SHORT_MM,
            Orientation::Landscape => A4_LONG_MM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayMode {
    Marks,
    Grade,
    #[default]
    Both,
}

impl DisplayMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "marks" => Some(DisplayMode::Marks),
            "grade" => Some(DisplayMode::Grade),
            "both" => Some(DisplayMode::Both),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisplayMode::Marks => "marks",
            DisplayMode::Grade => "grade",
            DisplayMode::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColumnVisibility {
    pub te: bool,
    pub ce: bool,
    pub total: bool,
    pub percentage: bool,
    pub grade: bool,
    pub rank: bool,
    pub result: bool,
    pub attendance: bool,
    pub advice: bool,
}

impl Default for ColumnVisibility {
    fn default() -> Self {
        Self {
            te: true,
            ce: true,
            total: true,
            percentage: true,
            grade: true,
            rank: true,
            result: true,
            attendance: true,
            advice: false,
        }
    }
}

impl ColumnVisibility {
    fn flags(&self) -> [(&'static str, bool); 9] {
        [
            ("te", self.te),
            ("ce", self.ce),
            ("total", self.total),
            ("percentage", self.percentage),
            ("grade", self.grade),
            ("rank", self.rank),
            ("result", self.result),
            ("attendance", self.attendance),
            ("advice", self.advice),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageOptions {
    pub orientation: Orientation,
    pub display_mode: DisplayMode,
    pub columns: ColumnVisibility,
    pub safety_buffer_px: f64,
    pub vertical_padding_px: f64,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            orientation: Orientation::Portrait,
            display_mode: DisplayMode::Both,
            columns: ColumnVisibility::default(),
            safety_buffer_px: DEFAULT_SAFETY_BUFFER_PX,
            vertical_padding_px: DEFAULT_VERTICAL_PADDING_PX,
        }
    }
}

impl PageOptions {
    pub fn usable_height_px(&self) -> f64 {
        self.orientation.page_height_mm() * PX_PER_MM - self.vertical_padding_px
    }

    pub fn usable_width_px(&self) -> f64 {
        self.orientation.page_width_mm() * PX_PER_MM
    }

    pub fn limits(&self) -> PlanLimits {
        PlanLimits {
            usable_height_px: self.usable_height_px(),
            safety_buffer_px: self.safety_buffer_px,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanLimits {
    pub usable_height_px: f64,
    pub safety_buffer_px: f64,
}

pub trait RowHeightProvider {
    /// Rendered height of row `index`; `None` when it could not be measured.
    fn row_height(&self, index: usize, row: &StudentResult) -> Option<f64>;
}

pub trait OverheadProvider {
    /// Header plus the two summary tables.
    fn first_page_overhead(&self) -> Option<f64>;
    /// Header only.
    fn subsequent_page_overhead(&self) -> Option<f64>;
}

/// Heights reported back by the renderer. An element it could not find
/// comes back as `null`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurements {
    #[serde(default)]
    pub first_page_overhead: Option<f64>,
    #[serde(default)]
    pub subsequent_page_overhead: Option<f64>,
    #[serde(default)]
    pub row_heights: Vec<Option<f64>>,
}

impl RowHeightProvider for Measurements {
    fn row_height(&self, index: usize, _row: &StudentResult) -> Option<f64> {
        self.row_heights.get(index).copied().flatten()
    }
}

impl OverheadProvider for Measurements {
    fn first_page_overhead(&self) -> Option<f64> {
        self.first_page_overhead
    }

    fn subsequent_page_overhead(&self) -> Option<f64> {
        self.subsequent_page_overhead
    }
}

/// Deterministic stand-in for a renderer: fixed-pitch text wrapped into
/// equal-width table cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextMetrics {
    pub char_width_px: f64,
    pub line_height_px: f64,
    pub cell_padding_px: f64,
    pub header_px: f64,
    pub summary_row_px: f64,
}

impl Default for TextMetrics {
    fn default() -> Self {
        Self {
            char_width_px: 6.5,
            line_height_px: 16.0,
            cell_padding_px: 8.0,
            header_px: 120.0,
            summary_row_px: 22.0,
        }
    }
}

pub struct EstimatedHeights<'a> {
    pub metrics: TextMetrics,
    pub options: &'a PageOptions,
    pub subject_count: usize,
    /// Rows across both first-page summary tables, headings included.
    pub summary_rows: usize,
}

impl EstimatedHeights<'_> {
    fn per_subject_columns(&self) -> usize {
        let c = &self.options.columns;
        let marks = [c.te, c.ce, c.total].iter().filter(|v| **v).count();
        let grade = usize::from(c.grade);
        match self.options.display_mode {
            DisplayMode::Marks => marks.max(1),
            DisplayMode::Grade => grade.max(1),
            DisplayMode::Both => (marks + grade).max(1),
        }
    }

    fn column_count(&self) -> usize {
        let c = &self.options.columns;
        let overall = [c.total, c.percentage, c.grade, c.rank, c.result, c.attendance, c.advice]
            .iter()
            .filter(|v| **v)
            .count();
        // serial number + name
        2 + self.subject_count * self.per_subject_columns() + overall
    }

    fn column_width_px(&self) -> f64 {
        self.options.usable_width_px() / (self.column_count() as f64)
    }

    fn lines_for(&self, text: &str) -> usize {
        let usable = (self.column_width_px() - self.metrics.cell_padding_px).max(1.0);
        let chars_per_line = (usable / self.metrics.char_width_px).floor().max(1.0) as usize;
        let n = text.chars().count().max(1);
        n.div_ceil(chars_per_line)
    }
}

impl RowHeightProvider for EstimatedHeights<'_> {
    fn row_height(&self, _index: usize, row: &StudentResult) -> Option<f64> {
        let mut lines = self.lines_for(&row.name);
        if self.options.columns.advice {
            let advice: String = row
                .all_advices
                .values()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            lines = lines.max(self.lines_for(&advice));
        }
        Some(lines as f64 * self.metrics.line_height_px + self.metrics.cell_padding_px)
    }
}

impl OverheadProvider for EstimatedHeights<'_> {
    fn first_page_overhead(&self) -> Option<f64> {
        Some(self.metrics.header_px + self.summary_rows as f64 * self.metrics.summary_row_px)
    }

    fn subsequent_page_overhead(&self) -> Option<f64> {
        Some(self.metrics.header_px)
    }
}

/// Where a plan's heights come from.
pub enum HeightSource<'a> {
    Measured(Measurements),
    Estimated(EstimatedHeights<'a>),
}

impl RowHeightProvider for HeightSource<'_> {
    fn row_height(&self, index: usize, row: &StudentResult) -> Option<f64> {
        match self {
            HeightSource::Measured(m) => m.row_height(index, row),
            HeightSource::Estimated(e) => e.row_height(index, row),
        }
    }
}

impl OverheadProvider for HeightSource<'_> {
    fn first_page_overhead(&self) -> Option<f64> {
        match self {
            HeightSource::Measured(m) => m.first_page_overhead(),
            HeightSource::Estimated(e) => e.first_page_overhead(),
        }
    }

    fn subsequent_page_overhead(&self) -> Option<f64> {
        match self {
            HeightSource::Measured(m) => m.subsequent_page_overhead(),
            HeightSource::Estimated(e) => e.subsequent_page_overhead(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayoutError {
    #[error("page overhead was not measured")]
    OverheadUnavailable,
    #[error("row {index} was not measured")]
    RowUnavailable { index: usize },
    #[error("page has no usable height")]
    NoUsableHeight,
}

impl LayoutError {
    pub fn code(&self) -> &'static str {
        match self {
            LayoutError::OverheadUnavailable | LayoutError::RowUnavailable { .. } => {
                "measurement_unavailable"
            }
            LayoutError::NoUsableHeight => "no_usable_height",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PageKind {
    Students,
    Analysis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub index: usize,
    pub kind: PageKind,
    /// Half-open range into the roster-ordered student list.
    pub row_start: usize,
    pub row_end: usize,
    pub student_ids: Vec<String>,
    pub carries_summary: bool,
    pub content_height_px: f64,
}

fn measured(v: Option<f64>) -> Option<f64> {
    v.filter(|h| h.is_finite() && *h > 0.0)
}

/// Greedy first-fit: rows fill the current page until the next one would
/// cross `usable - buffer`, then a new page starts. A trailing analysis page
/// is always appended.
pub fn plan_pages<H>(
    rows: &[StudentResult],
    heights: &H,
    limits: PlanLimits,
) -> Result<Vec<Page>, LayoutError>
where
    H: RowHeightProvider + OverheadProvider,
{
    if !(limits.usable_height_px.is_finite() && limits.usable_height_px > 0.0) {
        return Err(LayoutError::NoUsableHeight);
    }
    let first_overhead =
        measured(heights.first_page_overhead()).ok_or(LayoutError::OverheadUnavailable)?;
    let next_overhead =
        measured(heights.subsequent_page_overhead()).ok_or(LayoutError::OverheadUnavailable)?;
    let row_heights = rows
        .iter()
        .enumerate()
        .map(|(i, r)| measured(heights.row_height(i, r)).ok_or(LayoutError::RowUnavailable { index: i }))
        .collect::<Result<Vec<f64>, _>>()?;

    let threshold = limits.usable_height_px - limits.safety_buffer_px.max(0.0);
    let mut pages: Vec<Page> = Vec::new();
    let mut start = 0usize;
    let mut current = first_overhead;

    for (i, h) in row_heights.iter().enumerate() {
        let is_first_page = pages.is_empty();
        let page_has_rows = i > start;
        if current + h > threshold && (page_has_rows || is_first_page) {
            pages.push(students_page(pages.len(), rows, start, i, current));
            start = i;
            current = next_overhead;
        }
        current += h;
    }
    pages.push(students_page(pages.len(), rows, start, rows.len(), current));

    pages.push(Page {
        index: pages.len(),
        kind: PageKind::Analysis,
        row_start: rows.len(),
        row_end: rows.len(),
        student_ids: Vec::new(),
        carries_summary: false,
        content_height_px: 0.0,
    });
    Ok(pages)
}

fn students_page(index: usize, rows: &[StudentResult], start: usize, end: usize, height: f64) -> Page {
    Page {
        index,
        kind: PageKind::Students,
        row_start: start,
        row_end: end,
        student_ids: rows[start..end].iter().map(|r| r.student_id.clone()).collect(),
        carries_summary: index == 0,
        content_height_px: height,
    }
}

/// Fingerprint of everything that changes rendered height: student count,
/// score sum, orientation, display mode and column toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LayoutKey(pub String);

pub fn layout_key(rows: &[StudentResult], options: &PageOptions) -> LayoutKey {
    let score_sum: f64 = rows.iter().map(|r| r.grand_total).sum();
    let mut hasher = Sha256::new();
    hasher.update(format!("students={};", rows.len()));
    hasher.update(format!("scores={:.4};", score_sum));
    hasher.update(format!("orientation={};", options.orientation.as_str()));
    hasher.update(format!("display={};", options.display_mode.as_str()));
    for (name, on) in options.columns.flags() {
        hasher.update(format!("{}={};", name, on));
    }
    LayoutKey(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedLayout {
    pub generation: u64,
    pub report_id: String,
    pub layout_key: LayoutKey,
    pub options: PageOptions,
    pub usable_height_px: f64,
    pub pages: Vec<Page>,
}

#[derive(Debug, Clone)]
pub struct PendingLayout {
    pub generation: u64,
    pub report_id: String,
    pub layout_key: LayoutKey,
    pub options: PageOptions,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutTicket {
    pub generation: u64,
    pub layout_key: LayoutKey,
    /// False when the fingerprint matches what is already pending or applied.
    pub changed: bool,
    pub debounce_ms: u64,
}

#[derive(Debug)]
pub enum CommitOutcome<'a> {
    Applied(&'a AppliedLayout),
    Stale { current_generation: u64 },
    NotSettled { remaining_ms: u64 },
    Failed(LayoutError),
}

/// Tracks which pagination pass is current. Each content change bumps the
/// generation; results for an older generation are dropped on commit.
#[derive(Debug)]
pub struct LayoutScheduler {
    generation: u64,
    debounce: Duration,
    pending: Option<PendingLayout>,
    applied: Option<AppliedLayout>,
}

impl Default for LayoutScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DEBOUNCE_MS))
    }
}

impl LayoutScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            generation: 0,
            debounce,
            pending: None,
            applied: None,
        }
    }

    pub fn set_debounce(&mut self, debounce: Duration) {
        self.debounce = debounce;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending(&self) -> Option<&PendingLayout> {
        self.pending.as_ref()
    }

    pub fn applied(&self) -> Option<&AppliedLayout> {
        self.applied.as_ref()
    }

    pub fn request(
        &mut self,
        report_id: &str,
        layout_key: LayoutKey,
        options: PageOptions,
        now: Instant,
    ) -> LayoutTicket {
        let debounce_ms = self.debounce.as_millis() as u64;
        let same = |id: &str, key: &LayoutKey| id == report_id && *key == layout_key;

        if let Some(p) = &self.pending {
            if same(&p.report_id, &p.layout_key) {
                return LayoutTicket {
                    generation: p.generation,
                    layout_key,
                    changed: false,
                    debounce_ms,
                };
            }
        } else if let Some(a) = &self.applied {
            if same(&a.report_id, &a.layout_key) {
                return LayoutTicket {
                    generation: a.generation,
                    layout_key,
                    changed: false,
                    debounce_ms,
                };
            }
        }

        self.generation += 1;
        self.pending = Some(PendingLayout {
            generation: self.generation,
            report_id: report_id.to_string(),
            layout_key: layout_key.clone(),
            options,
            requested_at: now,
        });
        LayoutTicket {
            generation: self.generation,
            layout_key,
            changed: true,
            debounce_ms,
        }
    }

    /// Finishes pass `generation`. A failed measurement keeps both the
    /// previous plan and the pending request so the caller can retry.
    pub fn commit<H>(
        &mut self,
        generation: u64,
        rows: &[StudentResult],
        heights: &H,
        now: Instant,
    ) -> CommitOutcome<'_>
    where
        H: RowHeightProvider + OverheadProvider,
    {
        let Some(pending) = self.pending.as_ref().filter(|p| p.generation == generation) else {
            return CommitOutcome::Stale {
                current_generation: self.generation,
            };
        };
        let elapsed = now.saturating_duration_since(pending.requested_at);
        if elapsed < self.debounce {
            return CommitOutcome::NotSettled {
                remaining_ms: (self.debounce - elapsed).as_millis() as u64,
            };
        }

        let pages = match plan_pages(rows, heights, pending.options.limits()) {
            Ok(p) => p,
            Err(e) => return CommitOutcome::Failed(e),
        };
        let Some(pending) = self.pending.take() else {
            return CommitOutcome::Stale {
                current_generation: self.generation,
            };
        };
        let applied = self.applied.insert(AppliedLayout {
            generation: pending.generation,
            report_id: pending.report_id,
            layout_key: pending.layout_key,
            options: pending.options,
            usable_height_px: pending.options.usable_height_px(),
            pages,
        });
        CommitOutcome::Applied(applied)
    }

    /// The pending pass for `generation`, if that generation is current.
    pub fn pending_for(&self, generation: u64) -> Option<&PendingLayout> {
        self.pending.as_ref().filter(|p| p.generation == generation)
    }
}
