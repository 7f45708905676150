//! Occupancy survey and the periodic human-readable report.
//!
//! The analyzer walks every bucket, tallies how full each one is and which
//! address flags its entries carry, and renders the result as a fixed-width
//! ASCII histogram plus counter totals and per-second rates.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::addr::BlockAddr;

/// Number of columns in the occupancy histogram; each column covers an
/// equal slice of `[0, cells_per_bucket]`.
pub(crate) const HISTOGRAM_WIDTH: usize = 64;

/// Tallies accumulated over one full scan of the table.
#[derive(Debug, Clone)]
pub(crate) struct OccupancySurvey {
    cells_per_bucket: usize,
    /// Bucket counts by fill slice.
    columns: Vec<usize>,
    pub occupied_cells: usize,
    pub total_cells: usize,
    pub compressed: usize,
    pub compressed_offset: usize,
    pub toxic: usize,
    pub unaligned_eof: usize,
}

impl OccupancySurvey {
    pub fn new(cells_per_bucket: usize) -> Self {
        Self {
            cells_per_bucket,
            columns: vec![0; HISTOGRAM_WIDTH],
            occupied_cells: 0,
            total_cells: 0,
            compressed: 0,
            compressed_offset: 0,
            toxic: 0,
            unaligned_eof: 0,
        }
    }

    /// Record one occupied cell's address flags.
    pub fn note_cell(&mut self, addr: BlockAddr) {
        self.occupied_cells += 1;
        if addr.is_compressed() {
            self.compressed += 1;
            if addr.has_compressed_offset() {
                self.compressed_offset += 1;
            }
        }
        if addr.is_toxic() {
            self.toxic += 1;
        }
        if addr.is_unaligned_eof() {
            self.unaligned_eof += 1;
        }
    }

    /// Record one bucket's fill level.
    pub fn note_bucket(&mut self, occupied: usize) {
        let column = occupied * HISTOGRAM_WIDTH / (1 + self.cells_per_bucket);
        self.columns[column] += 1;
    }
}

fn percent(num: usize, den: usize) -> String {
    if den > 0 {
        format!("{}%", num * 100 / den)
    } else {
        "--%".to_string()
    }
}

/// Render the histogram rows, tallest threshold first, one `#` per column
/// meeting the row's threshold. Thresholds double per row.
fn render_histogram(columns: &[usize]) -> String {
    let mut rows = Vec::new();
    let mut thresholds = Vec::new();
    let mut threshold = 1usize;
    loop {
        let mut exceeded = false;
        let row: String = columns
            .iter()
            .map(|&count| {
                if count >= threshold {
                    exceeded = true;
                    '#'
                } else {
                    ' '
                }
            })
            .collect();
        rows.push(row);
        thresholds.push(threshold);
        threshold *= 2;
        if !exceeded {
            break;
        }
    }

    let mut out = String::new();
    for (i, (row, threshold)) in rows.iter().zip(&thresholds).enumerate().rev() {
        let unit = if i + 1 == rows.len() { " buckets" } else { "" };
        let _ = writeln!(out, "{row} {threshold}{unit}");
    }
    out
}

/// Render the full report: header, histogram, flag breakdown, counter
/// totals, and per-second rates.
pub(crate) fn render_report(
    survey: &OccupancySurvey,
    totals: &BTreeMap<&'static str, u64>,
    uptime: Duration,
) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "Now:     {now} (unix)");
    let _ = writeln!(out, "Uptime:  {} seconds", uptime.as_secs());
    let _ = writeln!(out);

    let occupied = survey.occupied_cells;
    let total = survey.total_cells;
    let _ = writeln!(
        out,
        "Bucket occupancy histogram ({}/{} cells occupied, {})",
        occupied,
        total,
        percent(occupied, total)
    );
    out.push_str(&render_histogram(&survey.columns));
    let _ = writeln!(
        out,
        "0%      |      25%      |      50%      |      75%      |   100% bucket fill"
    );

    let uncompressed = occupied - survey.compressed;
    let legacy = survey.compressed - survey.compressed_offset;
    let _ = writeln!(
        out,
        "compressed {} ({}) with-offset {} ({}) legacy {} ({})",
        survey.compressed,
        percent(survey.compressed, occupied),
        survey.compressed_offset,
        percent(survey.compressed_offset, occupied),
        legacy,
        percent(legacy, occupied)
    );
    let _ = writeln!(
        out,
        "uncompressed {} ({}) unaligned_eof {} ({}) toxic {} ({})",
        uncompressed,
        percent(uncompressed, occupied),
        survey.unaligned_eof,
        percent(survey.unaligned_eof, occupied),
        survey.toxic,
        percent(survey.toxic, occupied)
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "TOTAL:");
    let mut line = String::from("\t");
    for (name, value) in totals {
        let _ = write!(line, "{name}={value} ");
    }
    let _ = writeln!(out, "{}", line.trim_end());

    let _ = writeln!(out);
    let _ = writeln!(out, "RATES:");
    let secs = uptime.as_secs_f64().max(f64::EPSILON);
    let mut line = String::from("\t");
    for (name, value) in totals {
        let _ = write!(line, "{name}={:.3} ", *value as f64 / secs);
    }
    let _ = writeln!(out, "{}", line.trim_end());

    out
}
