//! Chart generator: structured numeric table → PNG chart artifact.
//!
//! ## Chart selection
//!
//! An explicit hint from the section plan wins. Otherwise:
//!
//! | Label column            | Chart |
//! |-------------------------|-------|
//! | time-like (dates, months, quarters, years) | line |
//! | categorical             | bar   |
//! | none (numbers only)     | bar over row numbers |
//!
//! A pie request over data containing negative values falls back to bar.
//! Tables with no numeric column, or no row with a parseable value, are
//! `UnplottableData` and never produce an artifact.

mod canvas;

use crate::artifact::{ArtifactId, ArtifactKind, ArtifactStore};
use crate::document::{parse_number, Table};
use crate::error::SectionError;
use crate::pipeline::encode::png_bytes;
use canvas::{fit_text, text_height, text_width, Canvas, AXIS, GRID, INK, PALETTE};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Points beyond this are dropped; a bar chart of 200 categories is noise.
const MAX_POINTS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartHint {
    Bar,
    Line,
    Pie,
}

impl ChartHint {
    pub fn as_str(self) -> &'static str {
        match self {
            ChartHint::Bar => "bar",
            ChartHint::Line => "line",
            ChartHint::Pie => "pie",
        }
    }
}

impl std::str::FromStr for ChartHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bar" => Ok(ChartHint::Bar),
            "line" => Ok(ChartHint::Line),
            "pie" => Ok(ChartHint::Pie),
            other => Err(format!("unknown chart type '{other}' (expected bar, line or pie)")),
        }
    }
}

/// Data and layout for one chart, after column selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    pub hint: ChartHint,
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

static RE_TIME_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(date|month|year|yr|quarter|qtr|week|day|period|time|fy)\b").unwrap()
});

static RE_TIME_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^(
            \d{4}-\d{1,2}(-\d{1,2})?             # 2024-03, 2024-03-31
          | \d{1,2}/\d{1,2}/\d{2,4}              # 03/31/2024
          | (q[1-4]|h[12])([\s\-/']*\d{2,4})?    # Q3, Q3 2024, H1-24
          | \d{4}\s*[\-/]?\s*(q[1-4]|h[12])      # 2024 Q3
          | fy\s*'?\d{2,4}                       # FY24
          | (jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?([\s\-/']*\d{2,4})?
          | (19|20)\d{2}                         # bare year
        )$",
    )
    .unwrap()
});

/// Whether a label column looks like a time axis.
pub fn is_time_like(header: &str, labels: &[&str]) -> bool {
    if RE_TIME_HEADER.is_match(header) {
        return true;
    }
    let filled: Vec<&str> = labels.iter().map(|l| l.trim()).filter(|l| !l.is_empty()).collect();
    if filled.is_empty() {
        return false;
    }
    let hits = filled.iter().filter(|l| RE_TIME_VALUE.is_match(l)).count();
    hits * 2 > filled.len()
}

/// Pick label/value columns and a chart type for `table`.
pub fn build_spec(table: &Table, hint: Option<ChartHint>, title: &str) -> Result<ChartSpec, SectionError> {
    let numeric = table.numeric_columns();
    if numeric.is_empty() {
        return Err(SectionError::UnplottableData {
            detail: format!("no numeric column among [{}]", table.headers.join(", ")),
        });
    }

    let label_col = (0..table.width()).find(|i| {
        !numeric.contains(i) && table.column(*i).any(|c| !c.trim().is_empty())
    });

    // A numeric year column works as the axis when there is no text label.
    let (label_col, value_col) = match label_col {
        Some(l) => (Some(l), numeric[0]),
        None if numeric.len() >= 2 && is_time_like(&table.headers[numeric[0]], &[]) => {
            (Some(numeric[0]), numeric[1])
        }
        None => (None, numeric[0]),
    };

    let mut labels = Vec::new();
    let mut values = Vec::new();
    for (row_idx, row) in table.rows.iter().enumerate() {
        let Some(v) = row.get(value_col).and_then(|c| parse_number(c)) else {
            continue;
        };
        let label = match label_col {
            Some(l) => row.get(l).map(|s| s.trim().to_string()).unwrap_or_default(),
            None => format!("{}", row_idx + 1),
        };
        labels.push(label);
        values.push(v);
        if values.len() == MAX_POINTS {
            break;
        }
    }
    if values.is_empty() {
        return Err(SectionError::UnplottableData {
            detail: format!("column '{}' has no parseable values", table.headers[value_col]),
        });
    }

    let time_axis = label_col
        .map(|l| {
            let cells: Vec<&str> = labels.iter().map(String::as_str).collect();
            is_time_like(&table.headers[l], &cells)
        })
        .unwrap_or(false);

    let mut chosen = hint.unwrap_or(if time_axis { ChartHint::Line } else { ChartHint::Bar });
    if chosen == ChartHint::Pie && values.iter().any(|v| *v < 0.0) {
        debug!("pie chart requested over negative values; using bar");
        chosen = ChartHint::Bar;
    }
    if chosen == ChartHint::Line && values.len() < 2 {
        chosen = ChartHint::Bar;
    }

    Ok(ChartSpec {
        hint: chosen,
        title: title.to_string(),
        x_label: label_col.map(|l| table.headers[l].clone()).unwrap_or_else(|| "row".into()),
        y_label: table.headers[value_col].clone(),
        labels,
        values,
    })
}

/// A chart registered in the artifact store.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedChart {
    pub id: ArtifactId,
    /// The type actually drawn, after inference and fallbacks.
    pub kind: ChartHint,
}

/// Smallest canvas the layout code can draw into.
pub const MIN_CHART_WIDTH: u32 = 200;
pub const MIN_CHART_HEIGHT: u32 = 150;

/// Renders chart specs into PNG artifacts.
///
/// Dimensions are only set through [`ChartGenerator::new`], which clamps
/// them to the minimum canvas.
#[derive(Debug, Clone, Copy)]
pub struct ChartGenerator {
    width: u32,
    height: u32,
}

impl Default for ChartGenerator {
    fn default() -> Self {
        Self {
            width: 800,
            height: 480,
        }
    }
}

impl ChartGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(MIN_CHART_WIDTH),
            height: height.max(MIN_CHART_HEIGHT),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Plot `table` and register the PNG in `store`.
    pub fn render_chart(
        &self,
        table: &Table,
        hint: Option<ChartHint>,
        title: &str,
        store: &ArtifactStore,
    ) -> Result<RenderedChart, SectionError> {
        let spec = build_spec(table, hint, title)?;
        let img = self.draw(&spec);
        let png = png_bytes(&DynamicImage::ImageRgb8(img)).map_err(|e| SectionError::UnplottableData {
            detail: format!("PNG encoding failed: {e}"),
        })?;
        let id = store.register(ArtifactKind::Chart, "image/png", png);
        debug!(artifact = %id, chart = spec.hint.as_str(), points = spec.values.len(), "chart rendered");
        Ok(RenderedChart { id, kind: spec.hint })
    }

    /// Rasterise a spec.
    pub fn draw(&self, spec: &ChartSpec) -> image::RgbImage {
        let mut c = Canvas::new(self.width, self.height);
        let title = fit_text(&spec.title, 2, self.width.saturating_sub(20));
        c.text_centered(self.width as i64 / 2, 14, &title, 2, INK);
        match spec.hint {
            ChartHint::Pie => draw_pie(&mut c, spec),
            ChartHint::Bar | ChartHint::Line => draw_xy(&mut c, spec),
        }
        c.into_image()
    }
}

struct Plot {
    left: i64,
    right: i64,
    top: i64,
    bottom: i64,
    lo: f64,
    hi: f64,
}

impl Plot {
    fn y(&self, v: f64) -> i64 {
        let t = (v - self.lo) / (self.hi - self.lo);
        self.bottom - (t * (self.bottom - self.top) as f64).round() as i64
    }
}

fn draw_xy(c: &mut Canvas, spec: &ChartSpec) {
    let (lo, hi, step) = axis_range(&spec.values, spec.hint == ChartHint::Bar);
    let tick_labels: Vec<String> = ticks(lo, hi, step).iter().map(|t| compact_number(*t)).collect();
    let gutter = tick_labels.iter().map(|t| text_width(t, 1)).max().unwrap_or(0) as i64 + 24;
    let p = Plot {
        left: gutter.max(60),
        right: c.width() as i64 - 24,
        top: 48,
        bottom: c.height() as i64 - 56,
        lo,
        hi,
    };

    for (t, label) in ticks(lo, hi, step).into_iter().zip(&tick_labels) {
        let y = p.y(t);
        c.hline(p.left, p.right, y, GRID);
        c.text_right(p.left - 8, y - 3, label, 1, INK);
    }
    c.vline(p.left, p.top, p.bottom, AXIS);
    c.hline(p.left, p.right, p.bottom, AXIS);

    let n = spec.values.len() as i64;
    let slot = ((p.right - p.left) / n.max(1)).max(1);
    let label_px = (slot - 4).max(6) as u32;
    let stride = label_stride(&spec.labels, label_px);
    let zero = p.y(0.0f64.clamp(lo, hi));
    let colour = PALETTE[0];

    let mut prev: Option<(i64, i64)> = None;
    for (i, (label, v)) in spec.labels.iter().zip(&spec.values).enumerate() {
        let cx = p.left + slot * i as i64 + slot / 2;
        let y = p.y(*v);
        match spec.hint {
            ChartHint::Bar => {
                let half = (slot * 7 / 20).max(1);
                c.fill_rect(cx - half, y, cx + half, zero, colour);
            }
            _ => {
                if let Some((px, py)) = prev {
                    c.line(px, py, cx, y, 3, colour);
                }
                c.disc(cx, y, 4, colour);
                prev = Some((cx, y));
            }
        }
        if i % stride == 0 {
            let text = fit_text(label, 1, label_px * stride as u32);
            c.text_centered(cx, p.bottom + 8, &text, 1, INK);
        }
    }

    let x_label = fit_text(&spec.x_label, 1, (p.right - p.left).max(0) as u32);
    c.text_centered((p.left + p.right) / 2, c.height() as i64 - 24, &x_label, 1, AXIS);
    let y_label = fit_text(&spec.y_label, 1, 200);
    c.text(8, p.top - 20, &y_label, 1, AXIS);
}

fn draw_pie(c: &mut Canvas, spec: &ChartSpec) {
    use std::f64::consts::TAU;
    let total: f64 = spec.values.iter().sum();
    let legend_w = 220i64;
    let r = ((c.width() as i64 - legend_w).min(c.height() as i64 - 70) / 2 - 10).max(10);
    let cx = (c.width() as i64 - legend_w) / 2;
    let cy = 40 + (c.height() as i64 - 40) / 2;

    if total <= 0.0 {
        c.disc(cx, cy, r, GRID);
        return;
    }

    let mut start = 0.0;
    let line_h = text_height(1) as i64 + 8;
    for (i, (label, v)) in spec.labels.iter().zip(&spec.values).enumerate() {
        let colour = PALETTE[i % PALETTE.len()];
        let end = start + v / total * TAU;
        c.wedge(cx, cy, r, start, end, colour);
        start = end;

        let ly = 56 + i as i64 * line_h;
        if ly + line_h < c.height() as i64 {
            let lx = c.width() as i64 - legend_w + 10;
            c.fill_rect(lx, ly, lx + 8, ly + 7, colour);
            let text = format!("{} {:.1}%", fit_text(label, 1, 140), v / total * 100.0);
            c.text(lx + 14, ly, &text, 1, INK);
        }
    }
}

/// Axis bounds and tick step. Bars always include zero.
fn axis_range(values: &[f64], include_zero: bool) -> (f64, f64, f64) {
    let mut lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let mut hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if include_zero {
        lo = lo.min(0.0);
        hi = hi.max(0.0);
    }
    if (hi - lo).abs() < f64::EPSILON {
        let pad = if hi == 0.0 { 1.0 } else { hi.abs() * 0.1 };
        lo -= pad;
        hi += pad;
    }
    let step = nice_step((hi - lo) / 5.0);
    ((lo / step).floor() * step, (hi / step).ceil() * step, step)
}

fn nice_step(raw: f64) -> f64 {
    let mag = 10f64.powf(raw.log10().floor());
    let norm = raw / mag;
    let nice = if norm <= 1.0 {
        1.0
    } else if norm <= 2.0 {
        2.0
    } else if norm <= 5.0 {
        5.0
    } else {
        10.0
    };
    nice * mag
}

fn ticks(lo: f64, hi: f64, step: f64) -> Vec<f64> {
    let n = ((hi - lo) / step).round() as i64;
    (0..=n).map(|i| lo + step * i as f64).collect()
}

fn label_stride(labels: &[String], slot_px: u32) -> usize {
    let widest = labels.iter().map(|l| text_width(l, 1)).max().unwrap_or(0);
    if widest <= slot_px {
        1
    } else {
        ((widest / slot_px.max(1)) as usize + 1).min(labels.len().max(1))
    }
}

/// `1234567` → `1.2M`, `0.25` → `0.25`.
pub fn compact_number(v: f64) -> String {
    let a = v.abs();
    let (scaled, suffix) = if a >= 1e9 {
        (v / 1e9, "B")
    } else if a >= 1e6 {
        (v / 1e6, "M")
    } else if a >= 1e3 {
        (v / 1e3, "K")
    } else {
        (v, "")
    };
    if scaled.fract().abs() < 1e-9 {
        format!("{}{}", scaled as i64, suffix)
    } else if suffix.is_empty() && a < 1.0 {
        format!("{scaled:.2}")
    } else {
        format!("{scaled:.1}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(headers: &[&str], rows: &[&[&str]]) -> Table {
        Table::new(
            headers.iter().map(|s| s.to_string()).collect(),
            rows.iter().map(|r| r.iter().map(|s| s.to_string()).collect()).collect(),
        )
    }

    #[test]
    fn monthly_revenue_is_a_line() {
        let t = table(&["month", "revenue"], &[&["Jan", "100"], &["Feb", "120"], &["Mar", "150"]]);
        let spec = build_spec(&t, None, "Revenue").unwrap();
        assert_eq!(spec.hint, ChartHint::Line);
        assert_eq!(spec.labels, vec!["Jan", "Feb", "Mar"]);
        assert_eq!(spec.values, vec![100.0, 120.0, 150.0]);
    }

    #[test]
    fn categories_are_bars() {
        let t = table(&["region", "sales"], &[&["North", "$1,200"], &["South", "900"]]);
        assert_eq!(build_spec(&t, None, "Sales").unwrap().hint, ChartHint::Bar);
    }

    #[test]
    fn numbers_only_plot_over_row_numbers() {
        let t = table(&["value"], &[&["3"], &["4"]]);
        let spec = build_spec(&t, None, "Values").unwrap();
        assert_eq!(spec.hint, ChartHint::Bar);
        assert_eq!(spec.labels, vec!["1", "2"]);
    }

    #[test]
    fn numeric_year_column_becomes_axis() {
        let t = table(&["year", "profit"], &[&["2022", "5"], &["2023", "7"]]);
        let spec = build_spec(&t, None, "Profit").unwrap();
        assert_eq!(spec.hint, ChartHint::Line);
        assert_eq!(spec.labels, vec!["2022", "2023"]);
        assert_eq!(spec.values, vec![5.0, 7.0]);
    }

    #[test]
    fn pie_with_negatives_falls_back_to_bar() {
        let t = table(&["segment", "margin"], &[&["A", "10"], &["B", "(5)"]]);
        let spec = build_spec(&t, Some(ChartHint::Pie), "Margin").unwrap();
        assert_eq!(spec.hint, ChartHint::Bar);
    }

    #[test]
    fn no_numeric_column_is_unplottable_and_registers_nothing() {
        let t = table(&["name", "city"], &[&["Ann", "Oslo"], &["Bo", "Rome"]]);
        let store = ArtifactStore::new("job-1");
        let err = ChartGenerator::default()
            .render_chart(&t, None, "People", &store)
            .unwrap_err();
        assert!(matches!(err, SectionError::UnplottableData { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn rendered_chart_is_a_registered_png() {
        let t = table(&["quarter", "revenue"], &[&["Q1", "10"], &["Q2", "-4"], &["Q3", "12"]]);
        let store = ArtifactStore::new("job-2");
        let gen = ChartGenerator::new(400, 300);
        for hint in [None, Some(ChartHint::Bar), Some(ChartHint::Pie)] {
            let chart = gen.render_chart(&t, hint, "Quarterly revenue", &store).unwrap();
            let art = store.get(&chart.id).unwrap();
            assert_eq!(art.kind, ArtifactKind::Chart);
            let img = image::load_from_memory(&art.bytes).unwrap();
            assert_eq!((img.width(), img.height()), (400, 300));
        }
    }

    #[test]
    fn rendered_chart_reports_drawn_type() {
        let store = ArtifactStore::new("job-3");
        let gen = ChartGenerator::default();
        let months = table(&["month", "revenue"], &[&["Jan", "100"], &["Feb", "120"], &["Mar", "130"]]);
        assert_eq!(gen.render_chart(&months, None, "Revenue", &store).unwrap().kind, ChartHint::Line);
        let signed = table(&["region", "delta"], &[&["N", "5"], &["S", "-3"]]);
        assert_eq!(
            gen.render_chart(&signed, Some(ChartHint::Pie), "Delta", &store).unwrap().kind,
            ChartHint::Bar
        );
    }

    #[test]
    fn tiny_sizes_are_clamped_to_the_minimum_canvas() {
        let gen = ChartGenerator::new(0, 1);
        assert_eq!((gen.width(), gen.height()), (MIN_CHART_WIDTH, MIN_CHART_HEIGHT));
        let t = table(&["region", "units"], &[&["North", "4"], &["South", "6"]]);
        let store = ArtifactStore::new("job-4");
        let chart = gen.render_chart(&t, None, "A long chart title that will not fit", &store).unwrap();
        let img = image::load_from_memory(&store.get(&chart.id).unwrap().bytes).unwrap();
        assert_eq!((img.width(), img.height()), (MIN_CHART_WIDTH, MIN_CHART_HEIGHT));
    }

    #[test]
    fn time_detection() {
        assert!(is_time_like("Period", &[]));
        assert!(is_time_like("label", &["2024-01", "2024-02"]));
        assert!(is_time_like("label", &["Q1 2024", "Q2 2024"]));
        assert!(is_time_like("x", &["January", "February", "March"]));
        assert!(!is_time_like("region", &["North", "South"]));
    }

    #[test]
    fn compact_numbers() {
        assert_eq!(compact_number(0.0), "0");
        assert_eq!(compact_number(1500.0), "1.5K");
        assert_eq!(compact_number(2_000_000.0), "2M");
        assert_eq!(compact_number(-250.0), "-250");
        assert_eq!(compact_number(0.25), "0.25");
    }

    #[test]
    fn axis_includes_zero_for_bars() {
        let (lo, hi, step) = axis_range(&[120.0, 150.0], true);
        assert_eq!(lo, 0.0);
        assert!(hi >= 150.0);
        assert!(step > 0.0);
    }
}
