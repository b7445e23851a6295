//! Report orchestration: per-channel fan-out, deterministic naming, and
//! crash-safe promotion of finished documents.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Duration;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::align::{locate_calibration_segments, locate_hold_rows};
use crate::calibrate::{calibration_table, evaluate_segments};
use crate::chart::{render_chart, ChartSpec};
use crate::data::{parse_timestamp, TimeSeries};
use crate::pdf::{
    logo_image, render_calibration_pdf, render_production_pdf, CalibrationPage, ProductionPage,
};
use crate::{CalibrationInfo, ChannelInfo, ReportError, TestMetadata, AMBIENT_CHANNEL, CALIBRATED_CHANNEL};

/// Secondary directory the finalized documents are mirrored into for the
/// viewer frontend.
pub const DEFAULT_MIRROR_DIR: &str = "/var/opt/codesys/PlcLogic/trend_data/static/pdfs";

/// Suffix of a document that is still being written.
const TEMP_SUFFIX: &str = ".tmp.pdf";

/// Where and how to publish the generated documents.
#[derive(Clone, Debug)]
pub struct ReportJob {
    pub output_dir: PathBuf,
    /// Best-effort mirror target; `None` disables mirroring.
    pub mirror_dir: Option<PathBuf>,
    pub logo_path: Option<PathBuf>,
}

/// Results of one generation run, keyed by output path rather than by
/// completion order.
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub written: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, ReportError)>,
}

fn filename_field(value: &Option<String>) -> &str {
    match value.as_deref() {
        Some(v) if !v.is_empty() => v,
        _ => "Unknown",
    }
}

/// Production document name: `{ots}_{line item}_{unique}_{date time}.pdf`.
pub fn production_output_name(metadata: &TestMetadata) -> String {
    format!(
        "{}_{}_{}_{}.pdf",
        filename_field(&metadata.ots_number),
        filename_field(&metadata.line_item),
        filename_field(&metadata.unique_number),
        metadata.date_time.as_deref().unwrap_or(""),
    )
}

/// Calibration document name: `Calibration_Channel-{index}_{date time}.pdf`.
pub fn calibration_output_name(metadata: &TestMetadata, channel_index: u32) -> String {
    format!(
        "Calibration_Channel-{}_{}.pdf",
        channel_index,
        filename_field(&metadata.date_time),
    )
}

fn temp_variant(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_name = match name.strip_suffix(".pdf") {
        Some(stem) => format!("{stem}{TEMP_SUFFIX}"),
        None => format!("{name}{TEMP_SUFFIX}"),
    };
    final_path.with_file_name(temp_name)
}

/// Promote a finished temporary document to its final name.
///
/// A pre-existing final file is removed first, then the temporary file is
/// renamed into place, so a concurrent reader never sees a partial
/// document. Paths without the temporary suffix pass through untouched.
pub fn finalize_output(temp_path: &Path) -> Result<PathBuf, ReportError> {
    let name = temp_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(stem) = name.strip_suffix(TEMP_SUFFIX) else {
        return Ok(temp_path.to_path_buf());
    };
    let final_path = temp_path.with_file_name(format!("{stem}.pdf"));

    if final_path.exists() {
        fs::remove_file(&final_path).map_err(|e| ReportError::io(&final_path, e))?;
    }
    if !temp_path.exists() {
        return Ok(final_path);
    }
    fs::rename(temp_path, &final_path).map_err(|e| ReportError::io(temp_path, e))?;
    Ok(final_path)
}

/// Copy a finalized document into the mirror directory. Failures are
/// logged and swallowed; mirroring never fails a report.
pub fn mirror_copy(final_path: &Path, mirror_dir: Option<&Path>) {
    let Some(dir) = mirror_dir else {
        return;
    };
    if !final_path.exists() {
        return;
    }
    let result = (|| -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let Some(name) = final_path.file_name() else {
            return Ok(());
        };
        let destination = dir.join(name);
        let same = match (destination.canonicalize(), final_path.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same {
            return Ok(());
        }
        fs::copy(final_path, &destination)?;
        Ok(())
    })();
    if let Err(error) = result {
        warn!(path = %final_path.display(), %error, "mirror copy skipped");
    }
}

/// Generate one report per visible channel.
///
/// Zero visible channels is an empty result, a single channel runs inline,
/// and several fan out across the worker pool. Each worker gets a
/// self-contained column slice and metadata copy; a failing channel is
/// reported alongside the other channels' finished paths.
pub fn generate_production(
    series: &TimeSeries,
    metadata: &TestMetadata,
    channels: &[ChannelInfo],
    job: &ReportJob,
) -> GenerationOutcome {
    let visible: Vec<&ChannelInfo> = channels.iter().filter(|c| c.visible).collect();
    if visible.is_empty() {
        info!("no visible channels, nothing to generate");
        return GenerationOutcome::default();
    }

    let results: Vec<Result<PathBuf, (PathBuf, ReportError)>> = if visible.len() == 1 {
        vec![generate_channel_report(series, metadata, visible[0], job)]
    } else {
        visible
            .par_iter()
            .map(|channel| generate_channel_report(series, metadata, channel, job))
            .collect()
    };

    let mut outcome = GenerationOutcome::default();
    for result in results {
        match result {
            Ok(path) => outcome.written.push(path),
            Err((path, error)) => outcome.failures.push((path, error)),
        }
    }
    outcome.written.sort();
    outcome.failures.sort_by(|a, b| a.0.cmp(&b.0));
    outcome
}

fn generate_channel_report(
    series: &TimeSeries,
    metadata: &TestMetadata,
    channel: &ChannelInfo,
    job: &ReportJob,
) -> Result<PathBuf, (PathBuf, ReportError)> {
    let unique = channel.unique_number.as_str();

    // Per-channel metadata copy, stamped with this channel's identity.
    let mut metadata = metadata.clone();
    metadata.unique_number = Some(unique.to_string());

    let final_path = job.output_dir.join(production_output_name(&metadata));
    let temp_path = temp_variant(&final_path);
    debug!(channel = unique, path = %final_path.display(), "generating report");

    let render = || -> Result<PathBuf, ReportError> {
        fs::create_dir_all(&job.output_dir).map_err(|e| ReportError::io(&job.output_dir, e))?;

        let mut slice = series.slice_columns(&[unique, AMBIENT_CHANNEL]);
        if let Some(end) = channel.end_of_test.as_deref().and_then(parse_timestamp) {
            slice.truncate_after(end + Duration::seconds(10));
        }

        let (holds, table) = locate_hold_rows(&slice, channel, unique);
        let markers = holds
            .markers()
            .map(|(label, idx)| (label.to_string(), idx))
            .collect();
        let chart = render_chart(&ChartSpec {
            series: &slice,
            value_column: unique,
            value_label: format!("{unique} (psi)"),
            markers,
        })?;

        render_production_pdf(
            &temp_path,
            &ProductionPage {
                metadata: &metadata,
                channel,
                table: &table,
                chart: &chart,
                logo: logo_image(job.logo_path.as_deref()),
            },
        )?;

        let final_path = finalize_output(&temp_path)?;
        mirror_copy(&final_path, job.mirror_dir.as_deref());
        Ok(final_path)
    };

    render().map_err(|error| (final_path.clone(), error))
}

/// Generate the single document of a calibration run.
pub fn generate_calibration(
    series: &TimeSeries,
    metadata: &TestMetadata,
    info: &CalibrationInfo,
    job: &ReportJob,
) -> GenerationOutcome {
    let final_path = job
        .output_dir
        .join(calibration_output_name(metadata, info.channel_index));
    let temp_path = temp_variant(&final_path);

    let render = || -> Result<PathBuf, ReportError> {
        fs::create_dir_all(&job.output_dir).map_err(|e| ReportError::io(&job.output_dir, e))?;

        let bounds = locate_calibration_segments(series, &info.key_points);
        let outcome = evaluate_segments(series, CALIBRATED_CHANNEL, &bounds, info);
        let table = calibration_table(&outcome);

        let mut markers = Vec::new();
        for segment in &bounds {
            for idx in [segment.start, segment.end].into_iter().flatten() {
                markers.push((String::new(), idx));
            }
        }
        let chart = render_chart(&ChartSpec {
            series,
            value_column: CALIBRATED_CHANNEL,
            value_label: format!("Channel {} (counts)", info.channel_index),
            markers,
        })?;

        let breach_row = outcome
            .reference
            .threshold
            .is_some()
            .then(|| (outcome.reference.error_label.clone(), outcome.breaches.clone()));

        render_calibration_pdf(
            &temp_path,
            &CalibrationPage {
                metadata,
                table: &table,
                breach_row,
                coefficients: outcome.coefficients,
                chart: &chart,
                logo: logo_image(job.logo_path.as_deref()),
            },
        )?;

        let final_path = finalize_output(&temp_path)?;
        mirror_copy(&final_path, job.mirror_dir.as_deref());
        Ok(final_path)
    };

    let mut result = GenerationOutcome::default();
    match render() {
        Ok(path) => result.written.push(path),
        Err(error) => result.failures.push((final_path, error)),
    }
    result
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

    fn metadata() -> TestMetadata {
        TestMetadata {
            test_name: Some("Hydrostatic Shell Test".to_string()),
            ots_number: Some("OTS-42".to_string()),
            line_item: Some("3".to_string()),
            date_time: Some("21-01-2026_14-55-37".to_string()),
            test_pressure: Some("5000".to_string()),
            ..TestMetadata::default()
        }
    }

    fn sample_series() -> TimeSeries {
        let start = ts("2026-01-21T10:00:00.000000");
        let mut stamps = Vec::new();
        let mut pressure = Vec::new();
        let mut hidden = Vec::new();
        let mut ambient = Vec::new();
        for i in 0..120 {
            stamps.push(start + Duration::seconds(i));
            pressure.push(4990.0 + (i % 7) as f64);
            hidden.push(100.0);
            ambient.push(21.0 + (i % 3) as f64 * 0.1);
        }
        TimeSeries::from_parts(
            stamps,
            BTreeMap::from([
                ("U100".to_string(), pressure),
                ("U200".to_string(), hidden),
                (AMBIENT_CHANNEL.to_string(), ambient),
            ]),
        )
    }

    #[test]
    fn output_names_are_deterministic() {
        let mut meta = metadata();
        meta.unique_number = Some("U100".to_string());
        assert_eq!(
            production_output_name(&meta),
            "OTS-42_3_U100_21-01-2026_14-55-37.pdf"
        );
        meta.ots_number = None;
        assert_eq!(
            production_output_name(&meta),
            "Unknown_3_U100_21-01-2026_14-55-37.pdf"
        );
        assert_eq!(
            calibration_output_name(&meta, 3),
            "Calibration_Channel-3_21-01-2026_14-55-37.pdf"
        );
    }

    #[test]
    fn finalize_replaces_stale_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("report.tmp.pdf");
        let stale = dir.path().join("report.pdf");
        fs::write(&temp, b"new").unwrap();
        fs::write(&stale, b"old").unwrap();

        let final_path = finalize_output(&temp).unwrap();
        assert_eq!(final_path, stale);
        assert!(!temp.exists());
        assert_eq!(fs::read(&final_path).unwrap(), b"new");
    }

    #[test]
    fn finalize_passes_through_non_temp_names() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("report.pdf");
        fs::write(&plain, b"x").unwrap();
        assert_eq!(finalize_output(&plain).unwrap(), plain);
        assert!(plain.exists());
    }

    #[test]
    fn mirror_copy_swallows_errors() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("report.pdf");
        fs::write(&source, b"pdf").unwrap();
        // A mirror path under a regular file cannot be created.
        let blocked = source.join("mirror");
        mirror_copy(&source, Some(&blocked));
        assert!(source.exists());
    }

    #[test]
    fn zero_visible_channels_is_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let job = ReportJob {
            output_dir: dir.path().to_path_buf(),
            mirror_dir: None,
            logo_path: None,
        };
        let channels = vec![ChannelInfo {
            unique_number: "U100".to_string(),
            visible: false,
            ..ChannelInfo::default()
        }];
        let outcome = generate_production(&sample_series(), &metadata(), &channels, &job);
        assert!(outcome.written.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn single_visible_channel_yields_one_finalized_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let job = ReportJob {
            output_dir: dir.path().to_path_buf(),
            mirror_dir: Some(mirror.path().to_path_buf()),
            logo_path: None,
        };
        let channels = vec![
            ChannelInfo {
                unique_number: "U100".to_string(),
                visible: true,
                transducer: "TX-9".to_string(),
                start_of_hold: Some("2026-01-21T10:00:30.000000".to_string()),
                ..ChannelInfo::default()
            },
            ChannelInfo {
                unique_number: "U200".to_string(),
                visible: false,
                ..ChannelInfo::default()
            },
        ];

        let outcome = generate_production(&sample_series(), &metadata(), &channels, &job);
        assert!(outcome.failures.is_empty(), "failures: {:?}", outcome.failures);
        assert_eq!(outcome.written.len(), 1);

        let expected = dir.path().join("OTS-42_3_U100_21-01-2026_14-55-37.pdf");
        assert_eq!(outcome.written[0], expected);
        assert!(expected.exists());
        assert!(!temp_variant(&expected).exists());
        // Finalized documents are mirrored under the same name.
        assert!(mirror.path().join("OTS-42_3_U100_21-01-2026_14-55-37.pdf").exists());

        let header = fs::read(&expected).unwrap();
        assert!(header.starts_with(b"%PDF"));
    }

    #[test]
    fn parallel_run_isolates_failing_channel() {
        let dir = tempfile::tempdir().unwrap();
        let job = ReportJob {
            output_dir: dir.path().to_path_buf(),
            mirror_dir: None,
            logo_path: None,
        };
        // The second channel has no data column, so its chart cannot render.
        let channels = vec![
            ChannelInfo {
                unique_number: "U100".to_string(),
                visible: true,
                ..ChannelInfo::default()
            },
            ChannelInfo {
                unique_number: "MISSING".to_string(),
                visible: true,
                ..ChannelInfo::default()
            },
        ];
        let outcome = generate_production(&sample_series(), &metadata(), &channels, &job);
        assert_eq!(outcome.written.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0].1, ReportError::Chart(_)));
    }

    #[test]
    fn calibration_breach_renders_with_regression_table() {
        let start = ts("2026-01-21T10:00:00.000000");
        let mut stamps = Vec::new();
        let mut counts = Vec::new();
        let mut ambient = Vec::new();
        // Segment 1 sits 100 counts high, well past the ±3.6 µA threshold.
        let plateaus = [0.0, 4100.0, 8000.0, 12000.0, 16000.0];
        for i in 0..300 {
            stamps.push(start + Duration::seconds(i));
            counts.push(plateaus[(i / 60) as usize]);
            ambient.push(21.0);
        }
        let series = TimeSeries::from_parts(
            stamps,
            BTreeMap::from([
                (CALIBRATED_CHANNEL.to_string(), counts),
                (AMBIENT_CHANNEL.to_string(), ambient),
            ]),
        );
        let info = CalibrationInfo {
            channel_index: 2,
            key_points: (0..5)
                .map(|i| format!("2026-01-21T10:{:02}:20.000000", i))
                .collect(),
            max_range: 16000.0,
        };

        // The engine must flag the breach and produce a length-4 vector.
        let bounds = locate_calibration_segments(&series, &info.key_points);
        let outcome = evaluate_segments(&series, CALIBRATED_CHANNEL, &bounds, &info);
        assert!(outcome.has_breach());
        let coefficients = outcome.coefficients.expect("regression expected on breach");
        assert_eq!(coefficients.len(), 4);

        let dir = tempfile::tempdir().unwrap();
        let job = ReportJob {
            output_dir: dir.path().to_path_buf(),
            mirror_dir: None,
            logo_path: None,
        };
        let generated = generate_calibration(&series, &metadata(), &info, &job);
        assert!(generated.failures.is_empty(), "failures: {:?}", generated.failures);
        assert_eq!(generated.written.len(), 1);
        assert!(generated.written[0].exists());
    }

    #[test]
    fn calibration_run_produces_single_document() {
        let start = ts("2026-01-21T10:00:00.000000");
        let mut stamps = Vec::new();
        let mut counts = Vec::new();
        let mut ambient = Vec::new();
        for i in 0..300 {
            stamps.push(start + Duration::seconds(i));
            // Five 60-second plateaus spread over the range.
            counts.push((i / 60) as f64 * 4000.0);
            ambient.push(21.0);
        }
        let series = TimeSeries::from_parts(
            stamps,
            BTreeMap::from([
                (CALIBRATED_CHANNEL.to_string(), counts),
                (AMBIENT_CHANNEL.to_string(), ambient),
            ]),
        );

        let info = CalibrationInfo {
            channel_index: 2,
            key_points: (0..5)
                .map(|i| format!("2026-01-21T10:{:02}:20.000000", i))
                .collect(),
            max_range: 16000.0,
        };
        let dir = tempfile::tempdir().unwrap();
        let job = ReportJob {
            output_dir: dir.path().to_path_buf(),
            mirror_dir: None,
            logo_path: None,
        };
        let outcome = generate_calibration(&series, &metadata(), &info, &job);
        assert!(outcome.failures.is_empty(), "failures: {:?}", outcome.failures);
        assert_eq!(outcome.written.len(), 1);
        assert!(outcome.written[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("Calibration_Channel-2_"));
        assert!(outcome.written[0].exists());
    }
}
