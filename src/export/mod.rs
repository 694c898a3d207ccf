//! PDF export of inspection reports.
//!
//! Walks an already-fetched list of reports, groups them by machine and lays
//! the result out on A4 pages: a title band, a period caption, a section per
//! machine and one entry per report with an optional embedded photo. Layout
//! is plain cursor bookkeeping; when the remaining vertical space on a page
//! is too small for the next section header or image, a new page is started.
//!
//! Per-image failures (file missing on disk, undecodable bytes) are skipped
//! on purpose so a single bad photo never sinks the whole export.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use chrono::{Local, NaiveDate, NaiveTime};
use printpdf::image_crate::GenericImageView;
use printpdf::path::{PaintMode, WindingOrder};
use printpdf::{
    BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Line, Mm, PdfDocument,
    PdfDocumentReference, PdfLayerReference, Point, Polygon, Rgb,
};
use tracing::{debug, warn};

use crate::storage::models::Report;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("pdf error: {0}")]
    Pdf(#[from] printpdf::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const PAGE_W: f64 = 210.0;
const PAGE_H: f64 = 297.0;
const MARGIN_L: f64 = 10.0;
const MARGIN_R: f64 = 10.0;
const MARGIN_BOTTOM: f64 = 15.0;
const LINE_H: f64 = 6.0;
const IMAGE_MM: f64 = 45.0;
// Break before a section header when less than this remains on the page.
const SECTION_MIN_ROOM: f64 = 57.0;

/// Renders report lists into PDF files under the configured report dir.
#[derive(Clone)]
pub struct Exporter {
    upload_dir: PathBuf,
    report_dir: PathBuf,
    technician: String,
}

impl Exporter {
    pub fn new(upload_dir: PathBuf, report_dir: PathBuf, technician: String) -> Self {
        Self {
            upload_dir,
            report_dir,
            technician,
        }
    }

    /// Full-history export; the period caption comes from the min/max date
    /// actually present in the data.
    pub fn export_full(&self, reports: &[Report]) -> Result<PathBuf, ExportError> {
        let filename = format!(
            "report_machines_{}.pdf",
            Local::now().format("%Y%m%d_%H%M%S")
        );
        self.render_to_file(
            "MACHINE INSPECTION REPORT",
            &period_from_reports(reports),
            reports,
            &filename,
        )
    }

    /// Date-ranged export with a caller-supplied title; the period caption
    /// shows the requested range even when the data covers less.
    pub fn export_range(
        &self,
        title: &str,
        start: NaiveDate,
        end: NaiveDate,
        reports: &[Report],
    ) -> Result<PathBuf, ExportError> {
        let filename = format!("report_custom_{}.pdf", Local::now().format("%Y%m%d_%H%M%S"));
        self.render_to_file(title, &period_caption(start, end), reports, &filename)
    }

    fn render_to_file(
        &self,
        title: &str,
        period: &str,
        reports: &[Report],
        filename: &str,
    ) -> Result<PathBuf, ExportError> {
        let doc = self.render(title, period, reports)?;
        std::fs::create_dir_all(&self.report_dir)?;
        let path = self.report_dir.join(filename);
        doc.save(&mut BufWriter::new(File::create(&path)?))?;
        debug!(path=%path.display(), "export written");
        Ok(path)
    }

    fn render(
        &self,
        title: &str,
        period: &str,
        reports: &[Report],
    ) -> Result<PdfDocumentReference, ExportError> {
        let mut page = Composer::new(title)?;

        // Header band with the document title, then the period caption box.
        page.band(&to_winansi(title), 18.0, 20.0, Rgb::new(0.1, 0.46, 0.82, None));
        page.advance(3.0);
        page.band(period, 13.0, 12.0, Rgb::new(0.1, 0.46, 0.82, None));
        page.advance(5.0);

        // Responsible technician row.
        page.text_at(
            "Responsible technician:",
            11.0,
            FontFace::Bold,
            MARGIN_L,
        );
        page.text_at(&to_winansi(&self.technician), 11.0, FontFace::Regular, 65.0);
        page.advance(LINE_H + 4.0);

        for (machine, entries) in group_by_machine(reports) {
            page.ensure_room(SECTION_MIN_ROOM);

            page.band(&to_winansi(machine), 14.0, 12.0, Rgb::new(0.13, 0.59, 0.95, None));
            page.advance(4.0);

            for report in entries {
                page.ensure_room(LINE_H * 3.0);
                page.text_at(
                    &date_line(report.report_date, report.report_time),
                    11.0,
                    FontFace::Bold,
                    MARGIN_L,
                );
                page.advance(LINE_H);

                for line in wrap_text(&to_winansi(&report.description), 92) {
                    page.ensure_room(LINE_H);
                    page.text_at(&line, 11.0, FontFace::Regular, MARGIN_L);
                    page.advance(LINE_H);
                }
                page.advance(2.0);

                if let Some(image) = &report.image {
                    self.place_image(&mut page, image);
                }

                page.separator();
            }
            page.advance(3.0);
        }

        page.footer(&format!(
            "Report generated on {}",
            Local::now().format("%d/%m/%Y at %H:%M")
        ));

        Ok(page.into_doc())
    }

    /// Embed one photo at a fixed square footprint, breaking the page first
    /// when it would not fit. Missing or undecodable files are skipped and
    /// the export continues.
    fn place_image(&self, page: &mut Composer, image: &str) {
        let path = self.upload_dir.join(image);
        if !path.exists() {
            warn!(image, "referenced image missing on disk; skipping");
            return;
        }
        let dynamic = match printpdf::image_crate::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!(image, error=%e, "could not decode image; skipping");
                return;
            }
        };
        page.ensure_room(IMAGE_MM + 5.0);
        let (px_w, px_h) = {
            let d = printpdf::image_crate::DynamicImage::ImageRgb8(dynamic);
            let dims = d.dimensions();
            page.image(&d);
            dims
        };
        debug!(image, px_w, px_h, "image embedded");
        page.advance(IMAGE_MM + 5.0);
    }
}

/// Which document face to use for body text.
#[derive(Clone, Copy)]
enum FontFace {
    Regular,
    Bold,
}

/// Cursor-based page composer. `y` grows downward from the top edge; PDF
/// user space grows upward, so emission flips against the page height.
struct Composer {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    y: f64,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    oblique: IndirectFontRef,
}

impl Composer {
    fn new(title: &str) -> Result<Self, printpdf::Error> {
        let (doc, page_idx, layer_idx) = PdfDocument::new(title, mm(PAGE_W), mm(PAGE_H), "content");
        let regular = doc.add_builtin_font(BuiltinFont::Helvetica)?;
        let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold)?;
        let oblique = doc.add_builtin_font(BuiltinFont::HelveticaOblique)?;
        let layer = doc.get_page(page_idx).get_layer(layer_idx);
        Ok(Self {
            doc,
            layer,
            y: 12.0,
            regular,
            bold,
            oblique,
        })
    }

    fn into_doc(self) -> PdfDocumentReference {
        self.doc
    }

    fn font(&self, face: FontFace) -> &IndirectFontRef {
        match face {
            FontFace::Regular => &self.regular,
            FontFace::Bold => &self.bold,
        }
    }

    fn break_page(&mut self) {
        let (page_idx, layer_idx) = self.doc.add_page(mm(PAGE_W), mm(PAGE_H), "content");
        self.layer = self.doc.get_page(page_idx).get_layer(layer_idx);
        self.y = 12.0;
    }

    fn ensure_room(&mut self, needed: f64) {
        if self.y + needed > PAGE_H - MARGIN_BOTTOM {
            self.break_page();
        }
    }

    fn advance(&mut self, delta: f64) {
        self.y += delta;
    }

    /// Single text line at the current cursor; does not advance.
    fn text_at(&self, text: &str, size: f64, face: FontFace, x: f64) {
        self.layer.set_fill_color(Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None)));
        self.layer.use_text(
            text,
            size as _,
            mm(x),
            mm(PAGE_H - self.y - size * PT_TO_MM),
            self.font(face),
        );
    }

    /// Filled full-width band with centered white text; advances past it.
    fn band(&mut self, text: &str, size: f64, height: f64, fill: Rgb) {
        self.ensure_room(height);
        let top = self.y;
        let bottom = self.y + height;
        self.layer.set_fill_color(Color::Rgb(fill));
        self.layer.add_polygon(Polygon {
            rings: vec![vec![
                (point(MARGIN_L, top), false),
                (point(PAGE_W - MARGIN_R, top), false),
                (point(PAGE_W - MARGIN_R, bottom), false),
                (point(MARGIN_L, bottom), false),
            ]],
            mode: PaintMode::Fill,
            winding_order: WindingOrder::NonZero,
        });
        // Rough Helvetica centering: average glyph advance ~0.5 em.
        let text_w = text.chars().count() as f64 * size * PT_TO_MM * 0.5;
        let x = ((PAGE_W - text_w) / 2.0).max(MARGIN_L);
        let baseline = top + height / 2.0 + size * PT_TO_MM * 0.35;
        self.layer.set_fill_color(Color::Rgb(Rgb::new(1.0, 1.0, 1.0, None)));
        self.layer
            .use_text(text, size as _, mm(x), mm(PAGE_H - baseline), self.font(FontFace::Bold));
        self.y = bottom;
    }

    /// Thin grey separator line between records; advances past it.
    fn separator(&mut self) {
        self.layer
            .set_outline_color(Color::Rgb(Rgb::new(0.78, 0.78, 0.78, None)));
        self.layer.set_outline_thickness(0.3 as _);
        self.layer.add_line(Line {
            points: vec![
                (point(MARGIN_L + 5.0, self.y), false),
                (point(PAGE_W - MARGIN_R - 5.0, self.y), false),
            ],
            is_closed: false,
        });
        self.y += 5.0;
    }

    fn image(&self, img: &printpdf::image_crate::DynamicImage) {
        let (px_w, px_h) = img.dimensions();
        let pdf_image = Image::from_dynamic_image(img);
        // Native size at `dpi`; scale both axes down to the fixed square.
        let dpi = 300.0_f64;
        let natural_w = f64::from(px_w) * 25.4 / dpi;
        let natural_h = f64::from(px_h) * 25.4 / dpi;
        let transform = ImageTransform {
            translate_x: Some(mm(MARGIN_L)),
            translate_y: Some(mm(PAGE_H - self.y - IMAGE_MM)),
            scale_x: Some((IMAGE_MM / natural_w) as _),
            scale_y: Some((IMAGE_MM / natural_h) as _),
            dpi: Some(dpi as _),
            ..Default::default()
        };
        pdf_image.add_to_layer(self.layer.clone(), transform);
    }

    /// Generation-timestamp footer on the current (final) page.
    fn footer(&self, text: &str) {
        self.layer
            .set_fill_color(Color::Rgb(Rgb::new(0.5, 0.5, 0.5, None)));
        let text_w = text.chars().count() as f64 * 8.0 * PT_TO_MM * 0.5;
        let x = ((PAGE_W - text_w) / 2.0).max(MARGIN_L);
        self.layer
            .use_text(text, 8.0 as _, mm(x), mm(10.0), &self.oblique);
    }
}

const PT_TO_MM: f64 = 0.3528;

fn mm(v: f64) -> Mm {
    Mm(v as _)
}

fn point(x: f64, y_from_top: f64) -> Point {
    Point::new(mm(x), mm(PAGE_H - y_from_top))
}

/// Group reports by machine name (alphabetical) and re-sort each machine's
/// records by (date, time) ascending.
pub(crate) fn group_by_machine(reports: &[Report]) -> Vec<(&str, Vec<&Report>)> {
    let mut grouped: BTreeMap<&str, Vec<&Report>> = BTreeMap::new();
    for report in reports {
        grouped
            .entry(report.machine_name.as_str())
            .or_default()
            .push(report);
    }
    grouped
        .into_iter()
        .map(|(machine, mut entries)| {
            entries.sort_by_key(|r| (r.report_date, r.report_time));
            (machine, entries)
        })
        .collect()
}

/// Date line for one record. Midnight means "no time recorded" and is left
/// off entirely.
pub(crate) fn date_line(date: NaiveDate, time: NaiveTime) -> String {
    let mut line = format!("Date: {}", date.format("%d/%m/%Y"));
    if time != NaiveTime::MIN {
        line.push_str(&format!(" | Time: {}", time.format("%H:%M")));
    }
    line
}

/// Period caption from the dates actually present in the data.
pub(crate) fn period_from_reports(reports: &[Report]) -> String {
    let mut dates = reports.iter().map(|r| r.report_date);
    match dates.next() {
        None => "PERIOD: [no reports recorded]".to_string(),
        Some(first) => {
            let (min, max) = dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
            period_caption(min, max)
        }
    }
}

pub(crate) fn period_caption(start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "PERIOD: {} TO {}",
        start.format("%d/%m/%Y"),
        end.format("%d/%m/%Y")
    )
}

/// Lossy projection into the range the built-in PDF fonts can encode.
/// Anything outside Latin-1 becomes '?' instead of failing the export.
pub(crate) fn to_winansi(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            ' '..='~' => c,
            '\u{a0}'..='\u{ff}' => c,
            '\n' | '\r' | '\t' => ' ',
            _ => '?',
        })
        .collect()
}

/// Greedy word wrap at a character budget; overlong words are hard-split.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word;
        while word.chars().count() > width {
            let split_at = word
                .char_indices()
                .nth(width)
                .map(|(i, _)| i)
                .unwrap_or(word.len());
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word[..split_at].to_string());
            word = &word[split_at..];
        }
        let needed = word.chars().count() + if current.is_empty() { 0 } else { 1 };
        if current.chars().count() + needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn report(machine: &str, date: &str, time: &str) -> Report {
        Report {
            id: 0,
            machine_name: machine.to_string(),
            report_date: date.parse().unwrap(),
            report_time: time.parse().unwrap(),
            description: "routine check".to_string(),
            image: None,
            created_at: NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S")
                .unwrap(),
        }
    }

    #[test]
    fn groups_machines_alphabetically() {
        let reports = vec![
            report("B", "2024-01-01", "08:00:00"),
            report("A", "2024-01-02", "09:00:00"),
            report("B", "2024-01-03", "10:00:00"),
        ];
        let grouped = group_by_machine(&reports);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "A");
        assert_eq!(grouped[1].0, "B");
        assert_eq!(grouped[1].1.len(), 2);
    }

    #[test]
    fn sorts_within_machine_by_date_then_time() {
        let reports = vec![
            report("M", "2024-01-02", "08:00:00"),
            report("M", "2024-01-01", "14:00:00"),
            report("M", "2024-01-01", "09:00:00"),
        ];
        let grouped = group_by_machine(&reports);
        let entries = &grouped[0].1;
        assert_eq!(
            entries
                .iter()
                .map(|r| (r.report_date, r.report_time))
                .collect::<Vec<_>>(),
            vec![
                ("2024-01-01".parse().unwrap(), "09:00:00".parse().unwrap()),
                ("2024-01-01".parse().unwrap(), "14:00:00".parse().unwrap()),
                ("2024-01-02".parse().unwrap(), "08:00:00".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn midnight_hides_the_time_suffix() {
        let midnight = date_line("2024-03-05".parse().unwrap(), NaiveTime::MIN);
        assert_eq!(midnight, "Date: 05/03/2024");

        let afternoon = date_line("2024-03-05".parse().unwrap(), "14:30:00".parse().unwrap());
        assert_eq!(afternoon, "Date: 05/03/2024 | Time: 14:30");
    }

    #[test]
    fn period_caption_spans_min_and_max_dates() {
        let reports = vec![
            report("M", "2024-02-10", "00:00:00"),
            report("M", "2024-01-03", "00:00:00"),
            report("N", "2024-03-01", "00:00:00"),
        ];
        assert_eq!(
            period_from_reports(&reports),
            "PERIOD: 03/01/2024 TO 01/03/2024"
        );
    }

    #[test]
    fn empty_dataset_gets_placeholder_period() {
        assert_eq!(period_from_reports(&[]), "PERIOD: [no reports recorded]");
    }

    #[test]
    fn non_latin_text_is_substituted_not_fatal() {
        assert_eq!(to_winansi("bomba averiada"), "bomba averiada");
        assert_eq!(to_winansi("presión"), "presión");
        assert_eq!(to_winansi("温度异常"), "????");
    }

    #[test]
    fn crlf_line_breaks_collapse_to_spaces() {
        // Textarea submissions arrive with CRLF line endings.
        assert_eq!(to_winansi("oil leak\r\nseal replaced"), "oil leak  seal replaced");
        assert!(!to_winansi("line one\r\nline two").contains('?'));
    }

    #[test]
    fn wrap_splits_long_words() {
        let lines = wrap_text("aaaaaaaaaa bb", 4);
        assert_eq!(lines, vec!["aaaa", "aaaa", "aa", "bb"]);
    }

    #[test]
    fn empty_dataset_still_renders_a_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(
            dir.path().join("uploads"),
            dir.path().join("reports"),
            "Willian Ruiz Z".to_string(),
        );
        let path = exporter.export_full(&[]).unwrap();
        let bytes = std::fs::read(path).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn missing_image_is_skipped_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(
            dir.path().join("uploads"),
            dir.path().join("reports"),
            "Willian Ruiz Z".to_string(),
        );
        let mut rep = report("A", "2024-01-01", "00:00:00");
        rep.image = Some("does_not_exist.jpg".to_string());
        let path = exporter.export_full(&[rep]).unwrap();
        assert!(std::fs::read(path).unwrap().starts_with(b"%PDF"));
    }
}
