//! Sample-file ingestion and the time-ordered series it produces.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;

use chrono::NaiveDateTime;

use crate::{ChannelInfo, ReportError, AMBIENT_CHANNEL, AMBIENT_CHANNEL_INDEX, CALIBRATED_CHANNEL};

/// Fixed timestamp format of the sample file and all event timestamps.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Timestamp format used in rendered tables.
pub const DISPLAY_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Parse a recorded timestamp; absent or malformed values become `None`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(trimmed, DATETIME_FORMAT).ok()
}

/// A table of recorded samples ordered by a strictly increasing Datetime
/// index. Rows whose timestamp failed to parse never enter the series, and
/// duplicate timestamps keep the first occurrence, so nearest-row lookups
/// are always well-defined.
#[derive(Clone, Debug, Default)]
pub struct TimeSeries {
    timestamps: Vec<NaiveDateTime>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    /// Index of the row whose timestamp is nearest to `target`, ties broken
    /// toward the earlier row. Targets outside the recorded span clamp to
    /// the first or last row.
    pub fn nearest_row(&self, target: NaiveDateTime) -> Option<usize> {
        if self.timestamps.is_empty() {
            return None;
        }
        let idx = self.timestamps.partition_point(|t| *t < target);
        if idx == 0 {
            return Some(0);
        }
        if idx == self.timestamps.len() {
            return Some(idx - 1);
        }
        let before = target - self.timestamps[idx - 1];
        let after = self.timestamps[idx] - target;
        if after < before {
            Some(idx)
        } else {
            Some(idx - 1)
        }
    }

    /// Working copy restricted to the named columns (missing names are
    /// dropped), sharing no storage with `self`.
    pub fn slice_columns(&self, names: &[&str]) -> TimeSeries {
        let mut columns = BTreeMap::new();
        for name in names {
            if let Some(values) = self.columns.get(*name) {
                columns.insert((*name).to_string(), values.clone());
            }
        }
        TimeSeries {
            timestamps: self.timestamps.clone(),
            columns,
        }
    }

    /// Drop every row after `limit` (rows at exactly `limit` are kept).
    pub fn truncate_after(&mut self, limit: NaiveDateTime) {
        let keep = self.timestamps.partition_point(|t| *t <= limit);
        self.timestamps.truncate(keep);
        for values in self.columns.values_mut() {
            values.truncate(keep);
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        timestamps: Vec<NaiveDateTime>,
        columns: BTreeMap<String, Vec<f64>>,
    ) -> TimeSeries {
        TimeSeries {
            timestamps,
            columns,
        }
    }
}

/// Result of loading a production sample file.
#[derive(Clone, Debug)]
pub struct LoadedSamples {
    pub series: TimeSeries,
    /// Channel identities with a data column, in channel order.
    pub active_channels: Vec<String>,
}

/// Load the sample file for a production test.
///
/// Positional column `i` (1-based) is renamed to channel `i`'s unique
/// number when that identity is non-empty; the result is restricted to
/// Datetime, the active channel columns and the ambient column. Requested
/// columns missing from the file are silently dropped.
pub fn load_samples(path: &Path, channels: &[ChannelInfo]) -> Result<LoadedSamples, ReportError> {
    let mut wanted: Vec<(String, String)> = Vec::new();
    let mut active_channels = Vec::new();
    for (index, channel) in channels.iter().enumerate() {
        let unique = channel.unique_number.trim();
        if unique.is_empty() {
            continue;
        }
        wanted.push(((index + 1).to_string(), unique.to_string()));
        active_channels.push(unique.to_string());
    }
    wanted.push((AMBIENT_CHANNEL.to_string(), AMBIENT_CHANNEL.to_string()));

    let series = read_table(path, &wanted)?;
    let active_channels = active_channels
        .into_iter()
        .filter(|name| series.column(name).is_some())
        .collect();
    Ok(LoadedSamples {
        series,
        active_channels,
    })
}

/// Load the sample file for a calibration run. The indexed column becomes
/// `Calibrated Channel`; the reserved ambient index reads the ambient
/// column as the channel under calibration.
pub fn load_calibration_samples(
    path: &Path,
    channel_index: u32,
) -> Result<TimeSeries, ReportError> {
    let source = if channel_index == AMBIENT_CHANNEL_INDEX {
        AMBIENT_CHANNEL.to_string()
    } else {
        channel_index.to_string()
    };
    let wanted = vec![
        (source, CALIBRATED_CHANNEL.to_string()),
        (AMBIENT_CHANNEL.to_string(), AMBIENT_CHANNEL.to_string()),
    ];
    read_table(path, &wanted)
}

fn read_table(path: &Path, wanted: &[(String, String)]) -> Result<TimeSeries, ReportError> {
    let file = File::open(path).map_err(|e| ReportError::io(path, e))?;
    let metadata = file.metadata().map_err(|e| ReportError::io(path, e))?;
    if metadata.len() == 0 {
        return Err(ReportError::EmptyData(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let headers = reader
        .headers()
        .map_err(|e| ReportError::malformed(path, e))?
        .clone();
    if headers.is_empty() {
        return Err(ReportError::EmptyData(path.to_path_buf()));
    }

    let datetime_idx = headers
        .iter()
        .position(|h| h == "Datetime")
        .ok_or_else(|| ReportError::malformed(path, "missing Datetime column"))?;

    // (record index, output column name); sources absent from the file are
    // dropped, and a repeated output name keeps its first mapping.
    let mut seen_out = HashSet::new();
    let selected: Vec<(usize, String)> = wanted
        .iter()
        .filter_map(|(source, out)| {
            headers
                .iter()
                .position(|h| h == source)
                .map(|idx| (idx, out.clone()))
        })
        .filter(|(_, out)| seen_out.insert(out.clone()))
        .collect();

    let mut rows: Vec<(NaiveDateTime, Vec<f64>)> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ReportError::malformed(path, e))?;
        let timestamp = match record.get(datetime_idx).and_then(parse_timestamp) {
            Some(ts) => ts,
            None => continue,
        };
        let values = selected
            .iter()
            .map(|(idx, _)| {
                record
                    .get(*idx)
                    .and_then(|raw| raw.trim().parse::<f64>().ok())
                    .unwrap_or(f64::NAN)
            })
            .collect();
        rows.push((timestamp, values));
    }

    // Duplicate timestamps keep the first occurrence in file order.
    let mut seen = HashSet::with_capacity(rows.len());
    rows.retain(|(ts, _)| seen.insert(*ts));
    rows.sort_by_key(|(ts, _)| *ts);

    let mut timestamps = Vec::with_capacity(rows.len());
    let mut columns: BTreeMap<String, Vec<f64>> = selected
        .iter()
        .map(|(_, name)| (name.clone(), Vec::with_capacity(rows.len())))
        .collect();
    for (ts, values) in rows {
        timestamps.push(ts);
        for ((_, name), value) in selected.iter().zip(values) {
            if let Some(column) = columns.get_mut(name) {
                column.push(value);
            }
        }
    }

    Ok(TimeSeries {
        timestamps,
        columns,
    })
}
