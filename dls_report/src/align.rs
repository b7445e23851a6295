//! Alignment of named test events and calibration key points to sampled rows.

use chrono::Duration;

use crate::data::{parse_timestamp, TimeSeries, DISPLAY_FORMAT};
use crate::{ChannelInfo, AMBIENT_CHANNEL};

/// Fixed labels of the production hold events, in display order.
pub const HOLD_LABELS: [&str; 3] = ["Start of Stabilisation", "Start of Hold", "End of Hold"];

/// Short marker labels matching `HOLD_LABELS`, drawn on the chart.
pub const HOLD_MARKS: [&str; 3] = ["SOS", "SOH", "EOH"];

/// Calibration segment window: samples within 10 s of the key point.
const SEGMENT_WINDOW_SECONDS: i64 = 10;

/// Row indices of the located hold events; an event whose timestamp is
/// absent or unparseable stays `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HoldIndices {
    pub start_of_stabilisation: Option<usize>,
    pub start_of_hold: Option<usize>,
    pub end_of_hold: Option<usize>,
}

impl HoldIndices {
    /// Marker label and row index for each located event.
    pub fn markers(&self) -> impl Iterator<Item = (&'static str, usize)> {
        [
            (HOLD_MARKS[0], self.start_of_stabilisation),
            (HOLD_MARKS[1], self.start_of_hold),
            (HOLD_MARKS[2], self.end_of_hold),
        ]
        .into_iter()
        .filter_map(|(label, idx)| idx.map(|i| (label, i)))
    }
}

/// A rendered table: plain string cells, row labels in column 0. The first
/// row may be a header row; blank cells mark missing data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayTable {
    pub rows: Vec<Vec<String>>,
}

impl DisplayTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Inclusive row bounds of one calibration segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentBounds {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

/// Locate the three hold events for a production channel.
///
/// Always returns all three display rows, with blank cells where the event
/// timestamp is missing or unparseable. Channel values are integer-truncated;
/// the ambient temperature is carried through as recorded.
pub fn locate_hold_rows(
    series: &TimeSeries,
    channel: &ChannelInfo,
    unique_number: &str,
) -> (HoldIndices, DisplayTable) {
    let events = [
        channel.start_of_stabilisation.as_deref(),
        channel.start_of_hold.as_deref(),
        channel.end_of_hold.as_deref(),
    ];

    let pressure_column = series.column(unique_number);
    let ambient_column = series.column(AMBIENT_CHANNEL);

    let mut indices = HoldIndices::default();
    let mut rows = vec![vec![
        String::new(),
        "Datetime".to_string(),
        format!("{unique_number} (psi)"),
        format!("{AMBIENT_CHANNEL} (°C)"),
    ]];

    for (slot, (label, raw)) in HOLD_LABELS.iter().zip(events).enumerate() {
        let mut row = vec![
            (*label).to_string(),
            String::new(),
            String::new(),
            String::new(),
        ];

        if let Some(ts) = raw.and_then(parse_timestamp) {
            if let Some(idx) = series.nearest_row(ts) {
                match slot {
                    0 => indices.start_of_stabilisation = Some(idx),
                    1 => indices.start_of_hold = Some(idx),
                    _ => indices.end_of_hold = Some(idx),
                }
                row[1] = ts.format(DISPLAY_FORMAT).to_string();
                if let Some(value) = pressure_column.and_then(|col| col.get(idx)) {
                    if value.is_finite() {
                        row[2] = format!("{}", value.trunc() as i64);
                    }
                }
                if let Some(value) = ambient_column.and_then(|col| col.get(idx)) {
                    if value.is_finite() {
                        row[3] = format!("{value}");
                    }
                }
            }
        }

        rows.push(row);
    }

    (indices, DisplayTable { rows })
}

/// Locate the sampled bounds of each calibration segment: the nearest row to
/// the key point and the nearest row 10 seconds later. An unparseable key
/// point leaves both bounds unset.
pub fn locate_calibration_segments(series: &TimeSeries, key_points: &[String]) -> Vec<SegmentBounds> {
    key_points
        .iter()
        .map(|raw| match parse_timestamp(raw) {
            Some(ts) => SegmentBounds {
                start: series.nearest_row(ts),
                end: series.nearest_row(ts + Duration::seconds(SEGMENT_WINDOW_SECONDS)),
            },
            None => SegmentBounds::default(),
        })
        .collect()
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

    fn sample_series() -> TimeSeries {
        TimeSeries::from_parts(
            vec![
                ts("2026-01-21T10:00:00.000000"),
                ts("2026-01-21T10:00:05.000000"),
                ts("2026-01-21T10:00:10.000000"),
                ts("2026-01-21T10:00:15.000000"),
            ],
            BTreeMap::from([
                ("U100".to_string(), vec![100.7, 5000.2, 5001.9, 4999.3]),
                (
                    AMBIENT_CHANNEL.to_string(),
                    vec![21.0, 21.5, 22.0, 22.5],
                ),
            ]),
        )
    }

    #[test]
    fn hold_rows_populate_located_events() {
        let channel = ChannelInfo {
            unique_number: "U100".to_string(),
            start_of_stabilisation: Some("2026-01-21T10:00:04.000000".to_string()),
            start_of_hold: Some("2026-01-21T10:00:09.900000".to_string()),
            end_of_hold: None,
            ..ChannelInfo::default()
        };
        let (indices, table) = locate_hold_rows(&sample_series(), &channel, "U100");

        assert_eq!(indices.start_of_stabilisation, Some(1));
        assert_eq!(indices.start_of_hold, Some(2));
        assert_eq!(indices.end_of_hold, None);

        // Header plus the three fixed rows, even with an absent event.
        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[1][0], "Start of Stabilisation");
        assert_eq!(table.rows[1][1], "21/01/2026 10:00:04");
        // Values are truncated, not rounded.
        assert_eq!(table.rows[1][2], "5000");
        assert_eq!(table.rows[1][3], "21.5");
        assert_eq!(table.rows[3], vec!["End of Hold", "", "", ""]);
    }

    #[test]
    fn unparseable_event_leaves_blank_row() {
        let channel = ChannelInfo {
            unique_number: "U100".to_string(),
            start_of_hold: Some("not a timestamp".to_string()),
            ..ChannelInfo::default()
        };
        let (indices, table) = locate_hold_rows(&sample_series(), &channel, "U100");
        assert_eq!(indices, HoldIndices::default());
        assert_eq!(table.rows[2], vec!["Start of Hold", "", "", ""]);
    }

    #[test]
    fn calibration_segments_span_ten_seconds() {
        let bounds = locate_calibration_segments(
            &sample_series(),
            &[
                "2026-01-21T10:00:00.000000".to_string(),
                "bogus".to_string(),
            ],
        );
        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds[0].start, Some(0));
        assert_eq!(bounds[0].end, Some(2));
        assert_eq!(bounds[1], SegmentBounds::default());
    }

    #[test]
    fn markers_skip_missing_events() {
        let indices = HoldIndices {
            start_of_stabilisation: Some(1),
            start_of_hold: None,
            end_of_hold: Some(3),
        };
        let markers: Vec<_> = indices.markers().collect();
        assert_eq!(markers, vec![("SOS", 1), ("EOH", 3)]);
    }
}
