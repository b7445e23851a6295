//! Calibration evaluation: segment averages, linear conversion, threshold
//! breaches and the fallback correction polynomial.

use ndarray::{Array1, Array2};

use crate::align::{DisplayTable, SegmentBounds};
use crate::data::TimeSeries;
use crate::CalibrationInfo;

/// Highest current-loop channel index; indices above it (other than the
/// reserved ambient index) have no defined reference values.
const LAST_CURRENT_LOOP_INDEX: u32 = 8;

/// Millivolt reference channel index.
const MILLIVOLT_INDEX: u32 = 9;

/// Breach thresholds keyed by display-row label. Rows with no entry here
/// are never flagged.
pub const CALIBRATION_THRESHOLDS: [(&str, f64); 3] = [
    ("Abs Error (µA) - ±3.6 µA", 3.6),
    ("Abs Error (mV) - ±0.12 mV", 0.12),
    ("Abs Error (mV) - ±1.0 mV", 1.0),
];

/// Coefficient labels of the correction polynomial, descending degree.
pub const COEFFICIENT_LABELS: [&str; 4] = ["S3", "S2", "S1", "S0"];

pub fn threshold_for_label(label: &str) -> Option<f64> {
    CALIBRATION_THRESHOLDS
        .iter()
        .find(|(key, _)| *key == label)
        .map(|(_, threshold)| *threshold)
}

/// Channel-type reference values for one calibration run, already
/// truncated or zero-padded to the supplied segment count.
#[derive(Clone, Debug)]
pub struct ChannelReference {
    pub applied: Vec<f64>,
    pub unit: &'static str,
    pub error_label: String,
    pub threshold: Option<f64>,
}

impl ChannelReference {
    fn new(applied: &[f64], unit: &'static str, error_label: &str, segments: usize) -> Self {
        let mut applied: Vec<f64> = applied.iter().copied().take(segments).collect();
        applied.resize(segments, 0.0);
        ChannelReference {
            applied,
            unit,
            error_label: error_label.to_string(),
            threshold: threshold_for_label(error_label),
        }
    }

    /// Raw counts the channel should report for each applied value, spread
    /// linearly over the channel's range.
    pub fn expected_counts(&self, max_range: f64) -> Vec<f64> {
        let first = self.applied.first().copied().unwrap_or(0.0);
        let last = self.applied.last().copied().unwrap_or(0.0);
        let span = last - first;
        self.applied
            .iter()
            .map(|applied| {
                if span == 0.0 {
                    0.0
                } else {
                    (applied - first) / span * max_range
                }
            })
            .collect()
    }
}

/// Select the reference table for a channel index. Current-loop channels
/// (≤ 8) and the millivolt reference channel (9) have defined values; any
/// other index falls back to neutral zeros with no threshold.
pub fn reference_for(channel_index: u32, segments: usize) -> ChannelReference {
    if channel_index <= LAST_CURRENT_LOOP_INDEX {
        ChannelReference::new(
            &[4000.0, 8000.0, 12000.0, 16000.0, 20000.0],
            "µA",
            "Abs Error (µA) - ±3.6 µA",
            segments,
        )
    } else if channel_index == MILLIVOLT_INDEX {
        ChannelReference::new(
            &[-5.89, 9.28, 24.46, 39.64, 54.81],
            "mV",
            "Abs Error (mV) - ±0.12 mV",
            segments,
        )
    } else {
        ChannelReference::new(&[], "", "Abs Error", segments)
    }
}

/// Full result of evaluating one calibration run.
#[derive(Clone, Debug)]
pub struct CalibrationOutcome {
    pub reference: ChannelReference,
    /// NaN-safe mean of the raw channel value over each segment.
    pub counts: Vec<f64>,
    pub expected_counts: Vec<f64>,
    pub converted: Vec<f64>,
    pub errors: Vec<f64>,
    pub breaches: Vec<bool>,
    /// Correction polynomial, present only when a threshold was breached.
    pub coefficients: Option<[f64; 4]>,
}

impl CalibrationOutcome {
    pub fn has_breach(&self) -> bool {
        self.breaches.iter().any(|b| *b)
    }
}

/// Evaluate every calibration segment of `channel_column` against the
/// channel type's reference values.
pub fn evaluate_segments(
    series: &TimeSeries,
    channel_column: &str,
    bounds: &[SegmentBounds],
    info: &CalibrationInfo,
) -> CalibrationOutcome {
    let reference = reference_for(info.channel_index, bounds.len());
    let expected_counts = reference.expected_counts(info.max_range);
    let column = series.column(channel_column);

    let counts: Vec<f64> = bounds
        .iter()
        .map(|segment| match (column, segment.start, segment.end) {
            (Some(values), Some(start), Some(end)) if start <= end => {
                nan_mean(&values[start..=end.min(values.len().saturating_sub(1))])
            }
            _ => f64::NAN,
        })
        .collect();

    let first = reference.applied.first().copied().unwrap_or(0.0);
    let last = reference.applied.last().copied().unwrap_or(0.0);
    let slope = if info.max_range == 0.0 {
        0.0
    } else {
        (last - first) / info.max_range
    };
    let intercept = first;

    let converted: Vec<f64> = counts.iter().map(|c| slope * c + intercept).collect();
    let errors: Vec<f64> = reference
        .applied
        .iter()
        .zip(&converted)
        .map(|(applied, converted)| applied - converted)
        .collect();
    let breaches: Vec<bool> = errors
        .iter()
        .map(|error| match reference.threshold {
            Some(threshold) => error.abs() > threshold,
            None => false,
        })
        .collect();

    let coefficients = if breaches.iter().any(|b| *b) {
        Some(fit_correction(&counts, &expected_counts))
    } else {
        None
    };

    CalibrationOutcome {
        reference,
        counts,
        expected_counts,
        converted,
        errors,
        breaches,
        coefficients,
    }
}

/// Least-squares polynomial fit of counts → expected counts.
///
/// Degree is min(3, valid pairs − 1); fewer than 2 valid pairs leaves every
/// coefficient undefined. Coefficients come back in descending-degree
/// order, right-padded with NaN when the degree is below 3.
pub fn fit_correction(counts: &[f64], expected: &[f64]) -> [f64; 4] {
    let pairs: Vec<(f64, f64)> = counts
        .iter()
        .zip(expected)
        .filter(|(c, e)| c.is_finite() && e.is_finite())
        .map(|(c, e)| (*c, *e))
        .collect();

    let mut out = [f64::NAN; 4];
    if pairs.len() < 2 {
        return out;
    }
    let degree = usize::min(3, pairs.len() - 1);
    let terms = degree + 1;

    let mut design = Array2::zeros((pairs.len(), terms));
    for (row, (x, _)) in pairs.iter().enumerate() {
        for col in 0..terms {
            design[[row, col]] = x.powi((degree - col) as i32);
        }
    }
    let observed = Array1::from_iter(pairs.iter().map(|(_, y)| *y));

    let normal = design.t().dot(&design);
    let rhs = design.t().dot(&observed);
    if let Some(solution) = solve_linear(normal, rhs) {
        for (slot, value) in out.iter_mut().zip(solution.iter()) {
            *slot = *value;
        }
    }
    out
}

/// Solve a small dense system by Gaussian elimination with partial
/// pivoting; a singular system yields `None`.
fn solve_linear(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                a[[i, col]]
                    .abs()
                    .partial_cmp(&a[[j, col]].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if a[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                let tmp = a[[col, k]];
                a[[col, k]] = a[[pivot, k]];
                a[[pivot, k]] = tmp;
            }
            b.swap(col, pivot);
        }
        for row in (col + 1)..n {
            let factor = a[[row, col]] / a[[col, col]];
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in (row + 1)..n {
            sum -= a[[row, col]] * x[col];
        }
        x[row] = sum / a[[row, row]];
    }
    Some(x)
}

fn nan_mean(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        if value.is_finite() {
            sum += value;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Build the calibration display table: one column per segment, row labels
/// in column 0. Cell backgrounds are decided by the caller from
/// `CalibrationOutcome::breaches`.
pub fn calibration_table(outcome: &CalibrationOutcome) -> DisplayTable {
    let unit = outcome.reference.unit;
    let applied_label = if unit.is_empty() {
        "Applied".to_string()
    } else {
        format!("Applied ({unit})")
    };
    let converted_label = if unit.is_empty() {
        "Converted".to_string()
    } else {
        format!("Converted ({unit})")
    };

    let mut rows = Vec::with_capacity(4);
    rows.push(build_row(&applied_label, &outcome.reference.applied));
    rows.push(build_row("Average Counts", &outcome.counts));
    rows.push(build_row(&converted_label, &outcome.converted));
    rows.push(build_row(&outcome.reference.error_label, &outcome.errors));
    DisplayTable { rows }
}

fn build_row(label: &str, values: &[f64]) -> Vec<String> {
    let mut row = Vec::with_capacity(values.len() + 1);
    row.push(label.to_string());
    row.extend(values.iter().map(|v| format_cell(*v)));
    row
}

fn format_cell(value: f64) -> String {
    if !value.is_finite() {
        return String::new();
    }
    if value.fract() == 0.0 {
        return format!("{value:.0}");
    }
    let formatted = format!("{value:.3}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_timestamp;
    use chrono::NaiveDateTime;
    use std::collections::BTreeMap;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    fn info(channel_index: u32, max_range: f64) -> CalibrationInfo {
        CalibrationInfo {
            channel_index,
            key_points: Vec::new(),
            max_range,
        }
    }

    #[test]
    fn reference_truncates_and_pads() {
        let reference = reference_for(1, 3);
        assert_eq!(reference.applied, vec![4000.0, 8000.0, 12000.0]);

        let padded = reference_for(1, 7);
        assert_eq!(padded.applied.len(), 7);
        assert_eq!(padded.applied[5], 0.0);
        assert_eq!(padded.applied[6], 0.0);
    }

    #[test]
    fn unknown_channel_gets_neutral_reference() {
        let reference = reference_for(12, 5);
        assert!(reference.applied.iter().all(|v| *v == 0.0));
        assert_eq!(reference.error_label, "Abs Error");
        assert_eq!(reference.threshold, None);
    }

    #[test]
    fn threshold_is_strictly_greater_than() {
        // Range 16000 with the current-loop table gives slope 1 and
        // intercept 4000, so segment 0's error is exactly -counts.
        let series = TimeSeries::from_parts(
            vec![ts("2026-01-21T10:00:00.000000"), ts("2026-01-21T10:00:01.000000")],
            BTreeMap::from([("Calibrated Channel".to_string(), vec![3.6, 3.6])]),
        );
        let bounds = vec![SegmentBounds {
            start: Some(0),
            end: Some(1),
        }];
        let at_threshold =
            evaluate_segments(&series, "Calibrated Channel", &bounds, &info(1, 16000.0));
        assert_eq!(at_threshold.errors[0], -3.6);
        assert!(!at_threshold.breaches[0]);
        assert!(at_threshold.coefficients.is_none());

        let series = TimeSeries::from_parts(
            vec![ts("2026-01-21T10:00:00.000000"), ts("2026-01-21T10:00:01.000000")],
            BTreeMap::from([("Calibrated Channel".to_string(), vec![3.7, 3.7])]),
        );
        let beyond = evaluate_segments(&series, "Calibrated Channel", &bounds, &info(1, 16000.0));
        assert!(beyond.breaches[0]);
        assert!(beyond.coefficients.is_some());
    }

    #[test]
    fn segment_mean_is_nan_safe() {
        let series = TimeSeries::from_parts(
            vec![
                ts("2026-01-21T10:00:00.000000"),
                ts("2026-01-21T10:00:01.000000"),
                ts("2026-01-21T10:00:02.000000"),
            ],
            BTreeMap::from([(
                "Calibrated Channel".to_string(),
                vec![10.0, f64::NAN, 20.0],
            )]),
        );
        let bounds = vec![
            SegmentBounds {
                start: Some(0),
                end: Some(2),
            },
            SegmentBounds::default(),
        ];
        let outcome = evaluate_segments(&series, "Calibrated Channel", &bounds, &info(1, 16000.0));
        assert_eq!(outcome.counts[0], 15.0);
        assert!(outcome.counts[1].is_nan());
    }

    #[test]
    fn fit_degree_three_with_five_points() {
        let counts = [0.0, 1.0, 2.0, 3.0, 4.0];
        let expected: Vec<f64> = counts.iter().map(|x| x * x * x).collect();
        let coeffs = fit_correction(&counts, &expected);
        assert!((coeffs[0] - 1.0).abs() < 1e-6);
        assert!(coeffs[1].abs() < 1e-6);
        assert!(coeffs[2].abs() < 1e-6);
        assert!(coeffs[3].abs() < 1e-6);
    }

    #[test]
    fn fit_degree_one_with_two_points() {
        let coeffs = fit_correction(&[0.0, 2.0], &[1.0, 5.0]);
        assert!((coeffs[0] - 2.0).abs() < 1e-9);
        assert!((coeffs[1] - 1.0).abs() < 1e-9);
        assert!(coeffs[2].is_nan());
        assert!(coeffs[3].is_nan());
    }

    #[test]
    fn fit_undefined_below_two_points() {
        let coeffs = fit_correction(&[1.0, f64::NAN], &[2.0, 3.0]);
        assert!(coeffs.iter().all(|c| c.is_nan()));
    }

    #[test]
    fn table_rows_carry_labels_and_blanks() {
        let series = TimeSeries::from_parts(
            vec![ts("2026-01-21T10:00:00.000000")],
            BTreeMap::from([("Calibrated Channel".to_string(), vec![8000.0])]),
        );
        let bounds = vec![
            SegmentBounds {
                start: Some(0),
                end: Some(0),
            },
            SegmentBounds::default(),
        ];
        let outcome = evaluate_segments(&series, "Calibrated Channel", &bounds, &info(1, 16000.0));
        let table = calibration_table(&outcome);
        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[0][0], "Applied (µA)");
        assert_eq!(table.rows[3][0], "Abs Error (µA) - ±3.6 µA");
        assert_eq!(table.rows[1][1], "8000");
        // The unlocated second segment renders blank.
        assert_eq!(table.rows[1][2], "");
    }
}
