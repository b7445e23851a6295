//! Time-series chart rendering for embedding into report pages.

use std::panic;

use chrono::{Duration, NaiveDateTime};
use plotters::prelude::*;
use tracing::warn;

use crate::data::{TimeSeries, DISPLAY_FORMAT};
use crate::{ReportError, AMBIENT_CHANNEL};

/// Raster size of the embedded chart. The page stretches the image into the
/// chart region, so only the aspect ratio is visually significant.
pub const CHART_WIDTH: u32 = 1196;
pub const CHART_HEIGHT: u32 = 849;

const PRESSURE_COLOR: RGBColor = RGBColor(255, 0, 0);
const AMBIENT_COLOR: RGBColor = RGBColor(0, 0, 255);

/// What to draw: the value column on the left axis, the ambient reference
/// on the right axis, and labeled crosses at located event rows.
pub struct ChartSpec<'a> {
    pub series: &'a TimeSeries,
    pub value_column: &'a str,
    /// Left-axis label, e.g. `U100 (psi)`.
    pub value_label: String,
    pub markers: Vec<(String, usize)>,
}

/// Rendered chart pixels (RGB8, row-major).
pub struct ChartImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Render the chart into an RGB buffer.
///
/// The plotting backend is guarded against panics so a failed render is
/// reported as this channel's error rather than tearing down the worker.
pub fn render_chart(spec: &ChartSpec) -> Result<ChartImage, ReportError> {
    let mut pixels = vec![255u8; (CHART_WIDTH * CHART_HEIGHT * 3) as usize];
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        draw_into(spec, &mut pixels)
    }))
    .map_err(|_| ReportError::Chart("plotting backend panicked".to_string()))?;
    outcome.map_err(ReportError::Chart)?;
    Ok(ChartImage {
        pixels,
        width: CHART_WIDTH,
        height: CHART_HEIGHT,
    })
}

fn draw_into(spec: &ChartSpec, pixels: &mut [u8]) -> Result<(), String> {
    let series = spec.series;
    if series.is_empty() {
        return Err("no samples to plot".to_string());
    }
    let stamps = series.timestamps();
    let values = series
        .column(spec.value_column)
        .ok_or_else(|| format!("column {} missing from series", spec.value_column))?;
    let ambient = series.column(AMBIENT_CHANNEL);

    let mut x_min = stamps[0];
    let mut x_max = stamps[stamps.len() - 1];
    if x_min == x_max {
        x_max = x_min + Duration::seconds(1);
        x_min = x_min - Duration::seconds(1);
    }

    let y_max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::MIN, f64::max);
    let y_max = if y_max > 0.0 { y_max * 1.05 } else { 1.0 };

    let root = BitMapBackend::with_buffer(pixels, (CHART_WIDTH, CHART_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| e.to_string())?;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .set_label_area_size(LabelAreaPosition::Left, 80)
        .set_label_area_size(LabelAreaPosition::Bottom, 70)
        .set_label_area_size(LabelAreaPosition::Right, 80)
        .build_cartesian_2d(RangedDateTime::from(x_min..x_max), 0.0..y_max)
        .map_err(|e| e.to_string())?
        .set_secondary_coord(RangedDateTime::from(x_min..x_max), -60.0..260.0);

    // Axis text needs a usable system font; a headless host without one
    // still gets the data traces, so label drawing is best-effort.
    if let Err(error) = chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(10)
        .x_label_formatter(&|dt: &NaiveDateTime| dt.format(DISPLAY_FORMAT).to_string())
        .label_style(("sans-serif", 13))
        .y_desc(spec.value_label.clone())
        .axis_desc_style(("sans-serif", 16).into_font().color(&PRESSURE_COLOR))
        .draw()
    {
        warn!(%error, "skipping chart axis labels");
    }

    if let Err(error) = chart
        .configure_secondary_axes()
        .y_desc(format!("{AMBIENT_CHANNEL} (°C)"))
        .label_style(("sans-serif", 13).into_font().color(&AMBIENT_COLOR))
        .axis_desc_style(("sans-serif", 16).into_font().color(&AMBIENT_COLOR))
        .draw()
    {
        warn!(%error, "skipping secondary axis labels");
    }

    let pressure_points = stamps
        .iter()
        .zip(values)
        .filter(|(_, v)| v.is_finite())
        .map(|(t, v)| (*t, *v));
    chart
        .draw_series(LineSeries::new(pressure_points, PRESSURE_COLOR.stroke_width(1)))
        .map_err(|e| e.to_string())?
        .label(spec.value_label.clone())
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], PRESSURE_COLOR));

    if let Some(ambient) = ambient {
        let ambient_points: Vec<(NaiveDateTime, f64)> = stamps
            .iter()
            .zip(ambient)
            .filter(|(_, v)| v.is_finite())
            .map(|(t, v)| (*t, *v))
            .collect();
        chart
            .draw_secondary_series(DashedLineSeries::new(
                ambient_points,
                6,
                4,
                AMBIENT_COLOR.stroke_width(1),
            ))
            .map_err(|e| e.to_string())?
            .label(format!("{AMBIENT_CHANNEL} (°C)"))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], AMBIENT_COLOR));
    }

    for (label, idx) in &spec.markers {
        let (Some(t), Some(v)) = (stamps.get(*idx), values.get(*idx)) else {
            continue;
        };
        if !v.is_finite() {
            continue;
        }
        let marker = EmptyElement::at((*t, *v))
            + Cross::new((0, 0), 5, BLACK.stroke_width(1))
            + Text::new(label.clone(), (8, -16), ("sans-serif", 15).into_font());
        if let Err(error) = chart.plotting_area().draw(&marker) {
            warn!(%error, label = %label, "skipping event marker");
        }
    }

    if let Err(error) = chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerMiddle)
        .background_style(WHITE.mix(0.7))
        .border_style(BLACK.mix(0.3))
        .label_font(("sans-serif", 14))
        .draw()
    {
        warn!(%error, "skipping chart legend");
    }

    root.present().map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn renders_non_blank_image() {
        let series = TimeSeries::from_parts(
            vec![
                parse_timestamp("2026-01-21T10:00:00.000000").unwrap(),
                parse_timestamp("2026-01-21T10:00:01.000000").unwrap(),
                parse_timestamp("2026-01-21T10:00:02.000000").unwrap(),
            ],
            BTreeMap::from([
                ("U100".to_string(), vec![0.0, 5000.0, 4500.0]),
                (AMBIENT_CHANNEL.to_string(), vec![21.0, 21.5, 22.0]),
            ]),
        );
        let spec = ChartSpec {
            series: &series,
            value_column: "U100",
            value_label: "U100 (psi)".to_string(),
            markers: vec![("SOH".to_string(), 1)],
        };
        let image = render_chart(&spec).unwrap();
        assert_eq!(image.pixels.len(), (CHART_WIDTH * CHART_HEIGHT * 3) as usize);
        // The red pressure trace must have left non-white pixels behind.
        assert!(image.pixels.chunks(3).any(|px| px != [255, 255, 255]));
    }

    #[test]
    fn empty_series_is_a_chart_error() {
        let series = TimeSeries::default();
        let spec = ChartSpec {
            series: &series,
            value_column: "U100",
            value_label: "U100 (psi)".to_string(),
            markers: Vec::new(),
        };
        assert!(matches!(
            render_chart(&spec),
            Err(ReportError::Chart(_))
        ));
    }
}
