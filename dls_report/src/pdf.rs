//! Fixed-coordinate PDF page rendering.
//!
//! The layout constants are contract values carried over from the existing
//! report format; downstream reviewers compare documents visually, so they
//! are reproduced exactly rather than re-derived.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use once_cell::sync::OnceCell;
use printpdf::image_crate::{self, DynamicImage, GenericImageView, RgbImage};
use printpdf::path::{PaintMode, WindingOrder};
use printpdf::{
    BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Mm, PdfDocument,
    PdfLayerReference, Point, Polygon, Pt, Rgb,
};
use tracing::warn;

use crate::align::DisplayTable;
use crate::calibrate::COEFFICIENT_LABELS;
use crate::chart::ChartImage;
use crate::{format_torque, ChannelInfo, ReportError, TestMetadata};

/// Page layout in PDF points, landscape A4.
pub mod layout {
    pub const PAGE_WIDTH: f32 = 841.89;
    pub const PAGE_HEIGHT: f32 = 595.28;

    pub const MARGIN_RIGHT: f32 = 15.0;

    pub const CONTENT_X_START: f32 = 15.0;
    pub const CONTENT_Y_START: f32 = 15.0;

    pub const HEADER_X: f32 = CONTENT_X_START;
    pub const HEADER_Y: f32 = 515.0;
    pub const HEADER_W: f32 = 600.0;
    pub const HEADER_H: f32 = 65.0;

    pub const TABLE_X: f32 = CONTENT_X_START;
    pub const TABLE_Y: f32 = CONTENT_Y_START;
    pub const TABLE_W: f32 = HEADER_W;
    pub const TABLE_H: f32 = 51.5;

    pub const GRAPH_X: f32 = CONTENT_X_START;
    pub const GRAPH_Y: f32 = CONTENT_Y_START + TABLE_H;
    pub const GRAPH_H: f32 = 470.0 - TABLE_H;
    pub const GRAPH_W: f32 = HEADER_W;

    pub const RIGHT_COL_X: f32 = 630.0;
    pub const RIGHT_COL_W: f32 = 197.0;

    pub const LOGO_X: f32 = RIGHT_COL_X;
    pub const LOGO_Y: f32 = 515.0;
    pub const LOGO_W: f32 = 197.0;
    pub const LOGO_H: f32 = 65.0;

    pub const INFO_RIGHT_X: f32 = RIGHT_COL_X;
    pub const INFO_RIGHT_Y: f32 = 300.0;
    pub const INFO_RIGHT_W: f32 = RIGHT_COL_W;
    pub const INFO_RIGHT_H: f32 = 185.0;

    pub const STAMP_X: f32 = RIGHT_COL_X;
    pub const STAMP_Y: f32 = 35.0;
    pub const STAMP_W: f32 = RIGHT_COL_W;
    pub const STAMP_H: f32 = 180.0;

    pub const FOOTER_TEXT_Y: f32 = 10.0;

    pub const MAIN_TITLE_X: f32 = 315.0;
    pub const MAIN_TITLE_Y: f32 = 500.0;

    pub const HEADER_COL1_LABEL_X: f32 = 20.0;
    pub const HEADER_COL1_VALUE_X: f32 = 140.0;
    pub const HEADER_COL2_LABEL_X: f32 = 402.5;
    pub const HEADER_COL2_VALUE_X: f32 = 487.5;

    pub const HEADER_ROW1_Y: f32 = 571.875;
    pub const HEADER_ROW2_Y: f32 = 555.625;
    pub const HEADER_ROW3_Y: f32 = 539.375;
    pub const HEADER_ROW4_Y: f32 = 523.125;

    pub const RIGHT_COL_LABEL_X: f32 = 635.0;
    pub const RIGHT_COL_VALUE_X: f32 = 725.0;

    pub const DATA_LOGGER_Y: f32 = 457.5;
    pub const SERIAL_NO_Y: f32 = 442.5;
    pub const TRANSDUCERS_Y: f32 = 427.5;

    pub const OPERATIVE_Y: f32 = 22.5;
    pub const OPERATIVE_VALUE_X: f32 = 685.0;

    pub const TRANSDUCER_ROW_HEIGHT: f32 = 15.0;
}

use self::layout as l;

fn black() -> Color {
    Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None))
}

fn accent() -> Color {
    Color::Rgb(Rgb::new(0.325, 0.529, 0.761, None))
}

fn breach_red() -> Color {
    Color::Rgb(Rgb::new(1.0, 0.0, 0.0, None))
}

fn pass_green() -> Color {
    Color::Rgb(Rgb::new(0.196, 0.804, 0.196, None))
}

fn header_grey() -> Color {
    Color::Rgb(Rgb::new(0.827, 0.827, 0.827, None))
}

fn footer_grey() -> Color {
    Color::Rgb(Rgb::new(0.5, 0.5, 0.5, None))
}

fn pt(value: f32) -> Mm {
    Mm::from(Pt(value))
}

/// The three built-in faces every page uses.
struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    oblique: IndirectFontRef,
}

impl Fonts {
    fn add_to(doc: &printpdf::PdfDocumentReference) -> Result<Fonts, ReportError> {
        let regular = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| ReportError::Pdf(e.to_string()))?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| ReportError::Pdf(e.to_string()))?;
        let oblique = doc
            .add_builtin_font(BuiltinFont::HelveticaOblique)
            .map_err(|e| ReportError::Pdf(e.to_string()))?;
        Ok(Fonts {
            regular,
            bold,
            oblique,
        })
    }
}

/// Approximate Helvetica advance width in points. The built-in faces carry
/// no metrics, and only centered and right-aligned strings need a width.
fn approx_text_width(text: &str, size: f32) -> f32 {
    let units: f32 = text
        .chars()
        .map(|c| match c {
            'i' | 'j' | 'l' | '.' | ',' | '\'' | '|' | ':' | ';' => 0.28,
            'f' | 't' | 'r' | 'I' | '(' | ')' | '[' | ']' | '-' | ' ' => 0.35,
            'm' | 'M' | 'W' | 'w' => 0.85,
            c if c.is_ascii_uppercase() => 0.70,
            c if c.is_ascii_digit() => 0.556,
            _ => 0.52,
        })
        .sum();
    units * size
}

fn draw_text(
    layer: &PdfLayerReference,
    font: &IndirectFontRef,
    text: &str,
    x: f32,
    y: f32,
    color: Color,
    size: f32,
    left_aligned: bool,
    replace_empty: bool,
) {
    let text = if replace_empty && text.trim().is_empty() {
        "N/A"
    } else {
        text
    };
    let text_height = size * 0.7;
    let draw_x = if left_aligned {
        x
    } else {
        x - approx_text_width(text, size) / 2.0
    };
    let draw_y = y - text_height / 2.0;

    layer.set_fill_color(color);
    layer.use_text(text, size, pt(draw_x), pt(draw_y), font);
    layer.set_fill_color(black());
}

fn rect_points(x: f32, y: f32, w: f32, h: f32) -> Vec<(Point, bool)> {
    vec![
        (Point::new(pt(x), pt(y)), false),
        (Point::new(pt(x + w), pt(y)), false),
        (Point::new(pt(x + w), pt(y + h)), false),
        (Point::new(pt(x), pt(y + h)), false),
    ]
}

fn stroke_rect(layer: &PdfLayerReference, x: f32, y: f32, w: f32, h: f32) {
    layer.add_polygon(Polygon {
        rings: vec![rect_points(x, y, w, h)],
        mode: PaintMode::Stroke,
        winding_order: WindingOrder::NonZero,
    });
}

fn fill_rect(layer: &PdfLayerReference, x: f32, y: f32, w: f32, h: f32, color: Color) {
    layer.set_fill_color(color);
    layer.add_polygon(Polygon {
        rings: vec![rect_points(x, y, w, h)],
        mode: PaintMode::Fill,
        winding_order: WindingOrder::NonZero,
    });
    layer.set_fill_color(black());
}

fn draw_layout_boxes(layer: &PdfLayerReference) {
    let boxes = [
        (l::HEADER_X, l::HEADER_Y, l::HEADER_W, l::HEADER_H),
        (l::GRAPH_X, l::GRAPH_Y, l::GRAPH_W, l::GRAPH_H),
        (l::TABLE_X, l::TABLE_Y, l::TABLE_W, l::TABLE_H),
        (l::STAMP_X, l::STAMP_Y, l::STAMP_W, l::STAMP_H),
        (
            l::INFO_RIGHT_X,
            l::INFO_RIGHT_Y + l::TRANSDUCER_ROW_HEIGHT * 8.0,
            l::INFO_RIGHT_W,
            l::INFO_RIGHT_H - l::TRANSDUCER_ROW_HEIGHT * 8.0,
        ),
        (
            l::INFO_RIGHT_X,
            l::INFO_RIGHT_Y + l::TRANSDUCER_ROW_HEIGHT * 2.0,
            l::INFO_RIGHT_W,
            l::INFO_RIGHT_H - l::TRANSDUCER_ROW_HEIGHT * 7.0 - 5.0,
        ),
    ];
    layer.set_outline_color(black());
    layer.set_outline_thickness(0.5);
    for (x, y, w, h) in boxes {
        stroke_rect(layer, x, y, w, h);
    }
}

fn draw_section_headers(layer: &PdfLayerReference, fonts: &Fonts, title: &str) {
    draw_text(
        layer,
        &fonts.bold,
        title,
        l::MAIN_TITLE_X,
        l::MAIN_TITLE_Y,
        black(),
        16.0,
        false,
        false,
    );
    draw_text(
        layer,
        &fonts.bold,
        "Data Recording Equipment Used",
        l::RIGHT_COL_X + l::RIGHT_COL_W / 2.0,
        475.0,
        black(),
        12.0,
        false,
        false,
    );
    draw_text(
        layer,
        &fonts.bold,
        "3rd Party Stamp and Date",
        l::RIGHT_COL_X + l::RIGHT_COL_W / 2.0,
        45.0,
        black(),
        12.0,
        false,
        false,
    );
}

/// One positioned string: (x, y, text, accent-colored, replace-empty).
type TextPosition = (f32, f32, String, bool, bool);

/// Max pressure = min(pressure · 1.05, pressure + 500), rounded down.
pub fn max_pressure(test_pressure: f64) -> i64 {
    f64::min(test_pressure * 1.05, test_pressure + 500.0).floor() as i64
}

/// Allowable drop = max pressure − test pressure, zero for an unset pressure.
pub fn allowable_drop(test_pressure: f64) -> i64 {
    if test_pressure > 0.0 {
        (max_pressure(test_pressure) as f64 - test_pressure).trunc() as i64
    } else {
        0
    }
}

fn field(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn production_text_positions(metadata: &TestMetadata, channel: &ChannelInfo) -> Vec<TextPosition> {
    let test_pressure = metadata.test_pressure_value();
    let max_pressure = max_pressure(test_pressure);
    let allowable = allowable_drop(test_pressure);
    let breakout = format_torque(channel.breakout_torque.as_ref());
    let running = format_torque(channel.running_torque.as_ref());
    let row = |n: f32| l::TRANSDUCERS_Y - l::TRANSDUCER_ROW_HEIGHT * n;

    vec![
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW1_Y, "OTS Number".into(), false, false),
        (l::HEADER_COL1_VALUE_X, l::HEADER_ROW1_Y, field(&metadata.ots_number), true, true),
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW2_Y, "Unique Number".into(), false, false),
        (l::HEADER_COL1_VALUE_X, l::HEADER_ROW2_Y, field(&metadata.unique_number), true, true),
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW3_Y, "Drawing Number".into(), false, false),
        (l::HEADER_COL1_VALUE_X, l::HEADER_ROW3_Y, field(&metadata.drawing_number), true, true),
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW4_Y, "Client".into(), false, false),
        (l::HEADER_COL1_VALUE_X, l::HEADER_ROW4_Y, field(&metadata.client), true, true),
        (l::HEADER_COL2_LABEL_X, l::HEADER_ROW1_Y, "Line Item".into(), false, false),
        (l::HEADER_COL2_VALUE_X, l::HEADER_ROW1_Y, field(&metadata.line_item), true, true),
        (l::HEADER_COL2_LABEL_X, l::HEADER_ROW2_Y, "Test Date".into(), false, false),
        (l::HEADER_COL2_VALUE_X, l::HEADER_ROW2_Y, metadata.test_date_display(), true, true),
        (l::RIGHT_COL_LABEL_X, row(2.0), "Test Pressure".into(), false, false),
        (
            l::RIGHT_COL_VALUE_X,
            row(2.0),
            format!("{} psi", metadata.test_pressure.clone().unwrap_or_else(|| "0".into())),
            true,
            true,
        ),
        (l::RIGHT_COL_LABEL_X, row(3.0), "Max Pressure".into(), false, false),
        (l::RIGHT_COL_VALUE_X, row(3.0), format!("{max_pressure} psi"), true, true),
        (l::RIGHT_COL_LABEL_X, row(4.0), "Breakout Torque".into(), false, false),
        (l::RIGHT_COL_VALUE_X, row(4.0), breakout, true, false),
        (l::RIGHT_COL_LABEL_X, row(5.0), "Running Torque".into(), false, false),
        (l::RIGHT_COL_VALUE_X, row(5.0), running, true, false),
        (l::RIGHT_COL_LABEL_X, row(6.0), "Allowable Drop".into(), false, false),
        (l::RIGHT_COL_VALUE_X, row(6.0), format!("{allowable} psi"), true, false),
        (l::RIGHT_COL_LABEL_X, l::DATA_LOGGER_Y, "Data Logger".into(), false, false),
        (l::RIGHT_COL_VALUE_X, l::DATA_LOGGER_Y, field(&metadata.data_logger), true, true),
        (l::RIGHT_COL_LABEL_X, l::SERIAL_NO_Y, "Serial No.".into(), false, false),
        (l::RIGHT_COL_VALUE_X, l::SERIAL_NO_Y, field(&metadata.serial_number), true, true),
        (l::RIGHT_COL_LABEL_X, l::TRANSDUCERS_Y, "Transducer".into(), false, false),
        (l::RIGHT_COL_VALUE_X, l::TRANSDUCERS_Y, channel.transducer.clone(), true, false),
        (l::RIGHT_COL_LABEL_X, l::OPERATIVE_Y, "Operative:".into(), false, false),
        (l::OPERATIVE_VALUE_X, l::OPERATIVE_Y, field(&metadata.operator), true, false),
    ]
}

fn calibration_text_positions(metadata: &TestMetadata) -> Vec<TextPosition> {
    let test_date = metadata
        .test_date
        .clone()
        .unwrap_or_else(|| metadata.test_date_display());

    vec![
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW1_Y, "OTS Number".into(), false, false),
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW2_Y, "Unique Number".into(), false, false),
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW3_Y, "Drawing Number".into(), false, false),
        (l::HEADER_COL1_LABEL_X, l::HEADER_ROW4_Y, "Client".into(), false, false),
        (l::HEADER_COL2_LABEL_X, l::HEADER_ROW1_Y, "Line Item".into(), false, false),
        (l::HEADER_COL2_LABEL_X, l::HEADER_ROW2_Y, "Test Date".into(), false, false),
        (l::HEADER_COL2_VALUE_X, l::HEADER_ROW2_Y, test_date, true, true),
        (l::RIGHT_COL_LABEL_X, l::DATA_LOGGER_Y, "Data Logger".into(), false, false),
        (l::RIGHT_COL_VALUE_X, l::DATA_LOGGER_Y, field(&metadata.data_logger), true, true),
        (l::RIGHT_COL_LABEL_X, l::SERIAL_NO_Y, "Serial No.".into(), false, false),
        (l::RIGHT_COL_VALUE_X, l::SERIAL_NO_Y, field(&metadata.serial_number), true, true),
        (l::RIGHT_COL_LABEL_X, l::OPERATIVE_Y, "Operative:".into(), false, false),
    ]
}

fn draw_all_text(layer: &PdfLayerReference, fonts: &Fonts, positions: &[TextPosition]) {
    for (x, y, text, accented, replace_empty) in positions {
        let color = if *accented { accent() } else { black() };
        draw_text(
            layer,
            &fonts.regular,
            text,
            *x,
            *y,
            color,
            10.0,
            true,
            *replace_empty,
        );
    }
}

fn draw_footer(layer: &PdfLayerReference, fonts: &Fonts, metadata: &TestMetadata) {
    let stamp = match metadata.date_time.as_deref() {
        Some(value) if !value.is_empty() => value,
        _ => return,
    };
    let size = 8.0;
    let x = l::PAGE_WIDTH - l::MARGIN_RIGHT - approx_text_width(stamp, size);
    draw_text(
        layer,
        &fonts.oblique,
        stamp,
        x,
        l::FOOTER_TEXT_Y,
        footer_grey(),
        size,
        true,
        false,
    );
}

/// Render a display table into the fixed table region. Rows whose label has
/// an entry in `row_breaches` get per-cell pass/breach backgrounds; all
/// other rows stay neutral.
fn draw_table(
    layer: &PdfLayerReference,
    fonts: &Fonts,
    table: &DisplayTable,
    row_breaches: &HashMap<String, Vec<bool>>,
) {
    if table.is_empty() || table.rows[0].is_empty() {
        return;
    }
    let row_count = table.rows.len();
    let col_count = table.rows[0].len();
    let col_w = l::TABLE_W / col_count as f32;
    let row_h = l::TABLE_H / row_count as f32;

    for (i, row) in table.rows.iter().enumerate() {
        let cell_y = l::TABLE_Y + l::TABLE_H - (i as f32 + 1.0) * row_h;
        let breaches = row_breaches.get(row[0].as_str());
        for (j, cell) in row.iter().enumerate() {
            let cell_x = l::TABLE_X + j as f32 * col_w;
            if let Some(breaches) = breaches {
                if j > 0 {
                    let breached = breaches.get(j - 1).copied().unwrap_or(false);
                    let color = if breached { breach_red() } else { pass_green() };
                    fill_rect(layer, cell_x, cell_y, col_w, row_h, color);
                }
            }
            stroke_rect(layer, cell_x, cell_y, col_w, row_h);
            draw_text(
                layer,
                &fonts.regular,
                cell,
                cell_x + col_w / 2.0,
                cell_y + row_h / 2.0,
                black(),
                8.0,
                false,
                false,
            );
        }
    }
}

/// Five-significant-digit display used for polynomial coefficients.
fn format_significant(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let exponent = value.abs().log10().floor() as i32;
    if !(-4..5).contains(&exponent) {
        return format!("{value:.4e}");
    }
    let decimals = (4 - exponent).max(0) as usize;
    let formatted = format!("{value:.decimals$}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Coefficient table in the stamp area, drawn only when the correction
/// polynomial exists.
fn draw_regression_table(layer: &PdfLayerReference, fonts: &Fonts, coefficients: &[f64; 4]) {
    if coefficients.iter().all(|c| !c.is_finite()) {
        return;
    }
    let padding = 5.0;
    let x = l::STAMP_X + padding;
    let width = l::STAMP_W - 2.0 * padding;
    let label_w = width * 0.45;
    let value_w = width * 0.55;
    let row_h = 14.0;
    let top = l::STAMP_Y + l::STAMP_H - padding;

    let mut rows: Vec<(String, String)> = vec![("Coefficient".into(), "Value".into())];
    for (label, value) in COEFFICIENT_LABELS.iter().zip(coefficients) {
        let display = if value.is_finite() {
            format_significant(*value)
        } else {
            "N/A".to_string()
        };
        rows.push(((*label).to_string(), display));
    }

    layer.set_outline_color(black());
    layer.set_outline_thickness(0.5);
    for (i, (label, value)) in rows.iter().enumerate() {
        let cell_y = top - (i as f32 + 1.0) * row_h;
        if i == 0 {
            fill_rect(layer, x, cell_y, width, row_h, header_grey());
        }
        stroke_rect(layer, x, cell_y, label_w, row_h);
        stroke_rect(layer, x + label_w, cell_y, value_w, row_h);
        draw_text(
            layer,
            &fonts.regular,
            label,
            x + label_w / 2.0,
            cell_y + row_h / 2.0,
            black(),
            8.0,
            false,
            false,
        );
        draw_text(
            layer,
            &fonts.regular,
            value,
            x + label_w + value_w / 2.0,
            cell_y + row_h / 2.0,
            black(),
            8.0,
            false,
            false,
        );
    }
}

fn place_chart(layer: &PdfLayerReference, chart: &ChartImage) -> Result<(), ReportError> {
    let rgb = RgbImage::from_raw(chart.width, chart.height, chart.pixels.clone())
        .ok_or_else(|| ReportError::Pdf("chart buffer size mismatch".to_string()))?;
    let image = Image::from_dynamic_image(&DynamicImage::ImageRgb8(rgb));
    // The chart stretches to fill the graph region.
    image.add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(pt(l::GRAPH_X + 1.0)),
            translate_y: Some(pt(l::GRAPH_Y + 1.0)),
            scale_x: Some((l::GRAPH_W - 2.0) / chart.width as f32),
            scale_y: Some((l::GRAPH_H - 2.0) / chart.height as f32),
            dpi: Some(72.0),
            ..Default::default()
        },
    );
    Ok(())
}

fn place_logo(layer: &PdfLayerReference, logo: &DynamicImage) {
    let (w_px, h_px) = logo.dimensions();
    if w_px == 0 || h_px == 0 {
        return;
    }
    // Aspect-preserving fit, centered in the logo box.
    let scale = f32::min(l::LOGO_W / w_px as f32, l::LOGO_H / h_px as f32);
    let draw_w = w_px as f32 * scale;
    let draw_h = h_px as f32 * scale;
    let image = Image::from_dynamic_image(logo);
    image.add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(pt(l::LOGO_X + (l::LOGO_W - draw_w) / 2.0)),
            translate_y: Some(pt(l::LOGO_Y + (l::LOGO_H - draw_h) / 2.0)),
            scale_x: Some(scale),
            scale_y: Some(scale),
            dpi: Some(72.0),
            ..Default::default()
        },
    );
}

static LOGO_CACHE: OnceCell<Option<DynamicImage>> = OnceCell::new();

/// Shared logo image, decoded once per process and read-only afterwards, so
/// it is safe to use from parallel render workers. A missing or unreadable
/// file logs a warning and leaves the logo box empty.
pub fn logo_image(path: Option<&Path>) -> Option<&'static DynamicImage> {
    LOGO_CACHE
        .get_or_init(|| {
            let path = path?;
            match image_crate::open(path) {
                Ok(image) => Some(image),
                Err(error) => {
                    warn!(path = %path.display(), %error, "could not load logo image");
                    None
                }
            }
        })
        .as_ref()
}

/// Everything needed to draw one production report page.
pub struct ProductionPage<'a> {
    pub metadata: &'a TestMetadata,
    pub channel: &'a ChannelInfo,
    pub table: &'a DisplayTable,
    pub chart: &'a ChartImage,
    pub logo: Option<&'a DynamicImage>,
}

/// Everything needed to draw one calibration report page.
pub struct CalibrationPage<'a> {
    pub metadata: &'a TestMetadata,
    pub table: &'a DisplayTable,
    /// Per-segment breach flags keyed to the error row's label.
    pub breach_row: Option<(String, Vec<bool>)>,
    pub coefficients: Option<[f64; 4]>,
    pub chart: &'a ChartImage,
    pub logo: Option<&'a DynamicImage>,
}

pub fn render_production_pdf(path: &Path, page: &ProductionPage) -> Result<(), ReportError> {
    let (doc, page_idx, layer_idx) = PdfDocument::new(
        "Production Report",
        pt(l::PAGE_WIDTH),
        pt(l::PAGE_HEIGHT),
        "Layer 1",
    );
    let fonts = Fonts::add_to(&doc)?;
    let layer = doc.get_page(page_idx).get_layer(layer_idx);

    draw_layout_boxes(&layer);
    draw_section_headers(
        &layer,
        &fonts,
        page.metadata.test_name.as_deref().unwrap_or(""),
    );
    draw_all_text(
        &layer,
        &fonts,
        &production_text_positions(page.metadata, page.channel),
    );
    draw_table(&layer, &fonts, page.table, &HashMap::new());
    place_chart(&layer, page.chart)?;
    if let Some(logo) = page.logo {
        place_logo(&layer, logo);
    }
    draw_footer(&layer, &fonts, page.metadata);

    save_document(doc, path)
}

pub fn render_calibration_pdf(path: &Path, page: &CalibrationPage) -> Result<(), ReportError> {
    let (doc, page_idx, layer_idx) = PdfDocument::new(
        "Calibration Report",
        pt(l::PAGE_WIDTH),
        pt(l::PAGE_HEIGHT),
        "Layer 1",
    );
    let fonts = Fonts::add_to(&doc)?;
    let layer = doc.get_page(page_idx).get_layer(layer_idx);

    draw_layout_boxes(&layer);
    draw_section_headers(&layer, &fonts, "Calibration Report");
    draw_all_text(&layer, &fonts, &calibration_text_positions(page.metadata));

    let mut row_breaches = HashMap::new();
    if let Some((label, breaches)) = &page.breach_row {
        row_breaches.insert(label.clone(), breaches.clone());
    }
    draw_table(&layer, &fonts, page.table, &row_breaches);
    if let Some(coefficients) = &page.coefficients {
        draw_regression_table(&layer, &fonts, coefficients);
    }
    place_chart(&layer, page.chart)?;
    if let Some(logo) = page.logo {
        place_logo(&layer, logo);
    }
    draw_footer(&layer, &fonts, page.metadata);

    save_document(doc, path)
}

fn save_document(doc: printpdf::PdfDocumentReference, path: &Path) -> Result<(), ReportError> {
    let file = File::create(path).map_err(|e| ReportError::io(path, e))?;
    doc.save(&mut BufWriter::new(file))
        .map_err(|e| ReportError::Pdf(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_pressure_takes_the_smaller_margin() {
        // 5% of 5000 is below the 500 psi cap.
        assert_eq!(max_pressure(5000.0), 5250);
        // 5% of 20000 would exceed the cap.
        assert_eq!(max_pressure(20000.0), 20500);
        assert_eq!(allowable_drop(5000.0), 250);
        assert_eq!(allowable_drop(0.0), 0);
    }

    #[test]
    fn significant_format_matches_expectations() {
        assert_eq!(format_significant(0.0), "0");
        assert_eq!(format_significant(1.0), "1");
        assert_eq!(format_significant(-2.5), "-2.5");
        assert_eq!(format_significant(123.456), "123.46");
        assert_eq!(format_significant(0.00012345), "0.00012345");
    }

    #[test]
    fn width_estimate_scales_with_size() {
        let narrow = approx_text_width("iii", 10.0);
        let wide = approx_text_width("MMM", 10.0);
        assert!(narrow < wide);
        assert!((approx_text_width("abc", 20.0) - 2.0 * approx_text_width("abc", 10.0)).abs() < 1e-3);
    }
}
