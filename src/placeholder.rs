//! Unicode placeholder rendering.
//!
//! A virtual placement becomes visible when the terminal sees a rectangle of
//! cells containing the placeholder character, styled so that each cell can
//! be traced back to `(image id, placement id, row, column)`: the foreground
//! color carries the low 24 bits of the image id, and up to three combining
//! marks carry the row index, the column index and the 4th id byte.
//!
//! See <https://sw.kovidgoyal.net/kitty/graphics-protocol/#unicode-placeholders>.

use std::fmt::Write as _;

use crate::errors::{Errors, Result};

/// The default placeholder character.
pub const PLACEHOLDER_CHAR: char = '\u{10EEEE}';

/// How many diacritics a cell carries. Cells after the first column can get
/// away with fewer of them: the terminal infers missing row/column values
/// from the preceding cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiacriticLevel {
    None,
    Row,
    RowColumn,
    RowColumnId4thByte,
    /// Row and column always, the 4th id byte only when it is non-zero.
    #[default]
    RowColumnId4thByteIfNonzero,
}

/// Styling knobs for placeholder emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePlaceholderMode {
    /// Use `38;5;n` instead of `38;2;r;g;b` for image ids that fit a byte.
    pub allow_256colors_for_image_id: bool,
    /// Use `48;5;n` for placement ids that fit a byte.
    pub allow_256colors_for_placement_id: bool,
    /// Do not emit a background color at all for placement id zero.
    pub skip_placement_id_if_zero: bool,
    pub first_column_diacritic_level: DiacriticLevel,
    pub other_columns_diacritic_level: DiacriticLevel,
    pub placeholder_char: char,
}

impl Default for ImagePlaceholderMode {
    fn default() -> Self {
        ImagePlaceholderMode {
            allow_256colors_for_image_id: true,
            allow_256colors_for_placement_id: false,
            skip_placement_id_if_zero: true,
            first_column_diacritic_level: DiacriticLevel::RowColumnId4thByteIfNonzero,
            other_columns_diacritic_level: DiacriticLevel::RowColumnId4thByteIfNonzero,
            placeholder_char: PLACEHOLDER_CHAR,
        }
    }
}

impl ImagePlaceholderMode {
    /// The default mode with all non-first-column diacritics dropped.
    pub fn fewer_diacritics() -> Self {
        ImagePlaceholderMode {
            other_columns_diacritic_level: DiacriticLevel::None,
            ..Default::default()
        }
    }
}

/// A rectangle of placeholder cells for rows `start_row..end_row` and
/// columns `start_col..end_col` of an image placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePlaceholder {
    pub image_id: u32,
    pub placement_id: u32,
    pub start_col: u16,
    pub start_row: u16,
    pub end_col: u16,
    pub end_row: u16,
}

impl ImagePlaceholder {
    /// A whole-image placeholder of `cols` × `rows` cells.
    pub fn new(image_id: u32, cols: u16, rows: u16) -> Self {
        ImagePlaceholder {
            image_id,
            placement_id: 0,
            start_col: 0,
            start_row: 0,
            end_col: cols,
            end_row: rows,
        }
    }

    pub fn cols(&self) -> u16 {
        self.end_col.saturating_sub(self.start_col)
    }

    pub fn rows(&self) -> u16 {
        self.end_row.saturating_sub(self.start_row)
    }

    /// Restricts the rectangle to at most `cols` × `rows` cells.
    pub fn clipped(&self, cols: u16, rows: u16) -> ImagePlaceholder {
        ImagePlaceholder {
            end_col: self.start_col + self.cols().min(cols),
            end_row: self.start_row + self.rows().min(rows),
            ..*self
        }
    }

    /// The SGR prefix shared by all cells of a line: the image id in the
    /// foreground color, the placement id in the background color.
    fn sgr_prelude(&self, mode: &ImagePlaceholderMode) -> String {
        let mut out = String::new();
        let color = self.image_id & 0xFFFFFF;
        if color != 0 {
            if color <= 0xFF && mode.allow_256colors_for_image_id {
                write!(out, "\x1b[38;5;{color}m").unwrap();
            } else {
                let [_, r, g, b] = self.image_id.to_be_bytes();
                write!(out, "\x1b[38;2;{r};{g};{b}m").unwrap();
            }
        }
        if self.placement_id != 0 || !mode.skip_placement_id_if_zero {
            let placement = self.placement_id & 0xFFFFFF;
            if placement <= 0xFF && mode.allow_256colors_for_placement_id {
                write!(out, "\x1b[48;5;{placement}m").unwrap();
            } else {
                let [_, r, g, b] = self.placement_id.to_be_bytes();
                write!(out, "\x1b[48;2;{r};{g};{b}m").unwrap();
            }
        }
        out
    }

    fn write_cell(&self, out: &mut String, mode: &ImagePlaceholderMode, row: u16, col: u16, level: DiacriticLevel) {
        out.push(mode.placeholder_char);
        let byte4 = (self.image_id >> 24) as u8;
        let (with_row, with_col, with_byte4) = match level {
            DiacriticLevel::None => (false, false, false),
            DiacriticLevel::Row => (true, false, false),
            DiacriticLevel::RowColumn => (true, true, false),
            DiacriticLevel::RowColumnId4thByte => (true, true, true),
            DiacriticLevel::RowColumnId4thByteIfNonzero => (true, true, byte4 != 0),
        };
        if with_row {
            out.push(diacritic(row as u8));
        }
        if with_col {
            out.push(diacritic(col as u8));
        }
        if with_byte4 {
            out.push(diacritic(byte4));
        }
    }

    /// Renders the rectangle as one string per line: an optional formatting
    /// prefix, the SGR prelude, the cells, and an SGR reset. Positioning
    /// between lines is the caller's business.
    pub fn render_lines(&self, mode: &ImagePlaceholderMode, formatting: Option<&str>) -> Vec<String> {
        let mut lines = Vec::with_capacity(usize::from(self.rows()));
        let prelude = self.sgr_prelude(mode);
        for row in self.start_row..self.end_row {
            let mut line = String::new();
            if let Some(formatting) = formatting {
                line.push_str(formatting);
            }
            line.push_str(&prelude);
            for col in self.start_col..self.end_col {
                let level = if col == self.start_col {
                    mode.first_column_diacritic_level
                } else {
                    mode.other_columns_diacritic_level
                };
                self.write_cell(&mut line, mode, row, col, level);
            }
            line.push_str("\x1b[0m");
            lines.push(line);
        }
        lines
    }
}

/// The placeholder size in cells for a `width` × `height` pixel image.
///
/// Dimensions given by the caller are used as-is; missing ones are derived
/// from the pixel size, the cell size and the scale factor, clamped to
/// `max_cols`/`max_rows` while preserving the aspect ratio. Rows never
/// exceed 256, the range of the row diacritic.
#[allow(clippy::too_many_arguments)]
pub fn optimal_cols_and_rows(
    width: u32,
    height: u32,
    cols: Option<u16>,
    rows: Option<u16>,
    max_cols: u16,
    max_rows: u16,
    cell_size: (u16, u16),
    scale: f32,
) -> Result<(u16, u16)> {
    if cols == Some(0) || rows == Some(0) {
        return Err(Errors::InvalidGeometry("cols and rows must be positive"));
    }
    if let (Some(cols), Some(rows)) = (cols, rows) {
        return Ok((cols, rows));
    }
    let max_cols = max_cols.max(1);
    let max_rows = max_rows.clamp(1, 256);
    let scale = if scale > 0.0 { f64::from(scale) } else { 1.0 };
    let width = f64::from(width.max(1)) * scale;
    let height = f64::from(height.max(1)) * scale;
    let cell_width = f64::from(cell_size.0.max(1));
    let cell_height = f64::from(cell_size.1.max(1));

    let cols_from_rows = |rows: u16| {
        ceil_to_u16(f64::from(rows) * cell_height * width / (height * cell_width))
    };
    let rows_from_cols = |cols: u16| {
        ceil_to_u16(f64::from(cols) * cell_width * height / (width * cell_height))
    };

    let (mut cols, mut rows, cols_auto, rows_auto) = match (cols, rows) {
        (None, None) => (
            ceil_to_u16(width / cell_width),
            ceil_to_u16(height / cell_height),
            true,
            true,
        ),
        (None, Some(rows)) => (cols_from_rows(rows), rows, true, false),
        (Some(cols), None) => (cols, rows_from_cols(cols), false, true),
        (Some(_), Some(_)) => unreachable!("handled above"),
    };

    // Auto-computed dimensions are clamped to the limits; the other
    // dimension follows to keep the aspect ratio.
    if cols_auto && cols > max_cols {
        cols = max_cols;
        rows = rows_from_cols(cols);
    }
    if rows_auto && rows > max_rows {
        rows = max_rows;
        cols = cols_from_rows(rows);
    }
    Ok((cols.clamp(1, max_cols), rows.clamp(1, max_rows)))
}

fn ceil_to_u16(value: f64) -> u16 {
    value.ceil().clamp(0.0, f64::from(u16::MAX)) as u16
}

#[inline]
pub fn diacritic(index: u8) -> char {
    ROWCOLUMN_DIACRITICS[usize::from(index)]
}

/// From <https://sw.kovidgoyal.net/kitty/_downloads/1792bad15b12979994cd6ecc54c967a6/rowcolumn-diacritics.txt>.
/// Must agree byte-for-byte with the table compiled into the terminal.
pub static ROWCOLUMN_DIACRITICS: [char; 297] = [
    '\u{305}',
    '\u{30D}',
    '\u{30E}',
    '\u{310}',
    '\u{312}',
    '\u{33D}',
    '\u{33E}',
    '\u{33F}',
    '\u{346}',
    '\u{34A}',
    '\u{34B}',
    '\u{34C}',
    '\u{350}',
    '\u{351}',
    '\u{352}',
    '\u{357}',
    '\u{35B}',
    '\u{363}',
    '\u{364}',
    '\u{365}',
    '\u{366}',
    '\u{367}',
    '\u{368}',
    '\u{369}',
    '\u{36A}',
    '\u{36B}',
    '\u{36C}',
    '\u{36D}',
    '\u{36E}',
    '\u{36F}',
    '\u{483}',
    '\u{484}',
    '\u{485}',
    '\u{486}',
    '\u{487}',
    '\u{592}',
    '\u{593}',
    '\u{594}',
    '\u{595}',
    '\u{597}',
    '\u{598}',
    '\u{599}',
    '\u{59C}',
    '\u{59D}',
    '\u{59E}',
    '\u{59F}',
    '\u{5A0}',
    '\u{5A1}',
    '\u{5A8}',
    '\u{5A9}',
    '\u{5AB}',
    '\u{5AC}',
    '\u{5AF}',
    '\u{5C4}',
    '\u{610}',
    '\u{611}',
    '\u{612}',
    '\u{613}',
    '\u{614}',
    '\u{615}',
    '\u{616}',
    '\u{617}',
    '\u{657}',
    '\u{658}',
    '\u{659}',
    '\u{65A}',
    '\u{65B}',
    '\u{65D}',
    '\u{65E}',
    '\u{6D6}',
    '\u{6D7}',
    '\u{6D8}',
    '\u{6D9}',
    '\u{6DA}',
    '\u{6DB}',
    '\u{6DC}',
    '\u{6DF}',
    '\u{6E0}',
    '\u{6E1}',
    '\u{6E2}',
    '\u{6E4}',
    '\u{6E7}',
    '\u{6E8}',
    '\u{6EB}',
    '\u{6EC}',
    '\u{730}',
    '\u{732}',
    '\u{733}',
    '\u{735}',
    '\u{736}',
    '\u{73A}',
    '\u{73D}',
    '\u{73F}',
    '\u{740}',
    '\u{741}',
    '\u{743}',
    '\u{745}',
    '\u{747}',
    '\u{749}',
    '\u{74A}',
    '\u{7EB}',
    '\u{7EC}',
    '\u{7ED}',
    '\u{7EE}',
    '\u{7EF}',
    '\u{7F0}',
    '\u{7F1}',
    '\u{7F3}',
    '\u{816}',
    '\u{817}',
    '\u{818}',
    '\u{819}',
    '\u{81B}',
    '\u{81C}',
    '\u{81D}',
    '\u{81E}',
    '\u{81F}',
    '\u{820}',
    '\u{821}',
    '\u{822}',
    '\u{823}',
    '\u{825}',
    '\u{826}',
    '\u{827}',
    '\u{829}',
    '\u{82A}',
    '\u{82B}',
    '\u{82C}',
    '\u{82D}',
    '\u{951}',
    '\u{953}',
    '\u{954}',
    '\u{F82}',
    '\u{F83}',
    '\u{F86}',
    '\u{F87}',
    '\u{135D}',
    '\u{135E}',
    '\u{135F}',
    '\u{17DD}',
    '\u{193A}',
    '\u{1A17}',
    '\u{1A75}',
    '\u{1A76}',
    '\u{1A77}',
    '\u{1A78}',
    '\u{1A79}',
    '\u{1A7A}',
    '\u{1A7B}',
    '\u{1A7C}',
    '\u{1B6B}',
    '\u{1B6D}',
    '\u{1B6E}',
    '\u{1B6F}',
    '\u{1B70}',
    '\u{1B71}',
    '\u{1B72}',
    '\u{1B73}',
    '\u{1CD0}',
    '\u{1CD1}',
    '\u{1CD2}',
    '\u{1CDA}',
    '\u{1CDB}',
    '\u{1CE0}',
    '\u{1DC0}',
    '\u{1DC1}',
    '\u{1DC3}',
    '\u{1DC4}',
    '\u{1DC5}',
    '\u{1DC6}',
    '\u{1DC7}',
    '\u{1DC8}',
    '\u{1DC9}',
    '\u{1DCB}',
    '\u{1DCC}',
    '\u{1DD1}',
    '\u{1DD2}',
    '\u{1DD3}',
    '\u{1DD4}',
    '\u{1DD5}',
    '\u{1DD6}',
    '\u{1DD7}',
    '\u{1DD8}',
    '\u{1DD9}',
    '\u{1DDA}',
    '\u{1DDB}',
    '\u{1DDC}',
    '\u{1DDD}',
    '\u{1DDE}',
    '\u{1DDF}',
    '\u{1DE0}',
    '\u{1DE1}',
    '\u{1DE2}',
    '\u{1DE3}',
    '\u{1DE4}',
    '\u{1DE5}',
    '\u{1DE6}',
    '\u{1DFE}',
    '\u{20D0}',
    '\u{20D1}',
    '\u{20D4}',
    '\u{20D5}',
    '\u{20D6}',
    '\u{20D7}',
    '\u{20DB}',
    '\u{20DC}',
    '\u{20E1}',
    '\u{20E7}',
    '\u{20E9}',
    '\u{20F0}',
    '\u{2CEF}',
    '\u{2CF0}',
    '\u{2CF1}',
    '\u{2DE0}',
    '\u{2DE1}',
    '\u{2DE2}',
    '\u{2DE3}',
    '\u{2DE4}',
    '\u{2DE5}',
    '\u{2DE6}',
    '\u{2DE7}',
    '\u{2DE8}',
    '\u{2DE9}',
    '\u{2DEA}',
    '\u{2DEB}',
    '\u{2DEC}',
    '\u{2DED}',
    '\u{2DEE}',
    '\u{2DEF}',
    '\u{2DF0}',
    '\u{2DF1}',
    '\u{2DF2}',
    '\u{2DF3}',
    '\u{2DF4}',
    '\u{2DF5}',
    '\u{2DF6}',
    '\u{2DF7}',
    '\u{2DF8}',
    '\u{2DF9}',
    '\u{2DFA}',
    '\u{2DFB}',
    '\u{2DFC}',
    '\u{2DFD}',
    '\u{2DFE}',
    '\u{2DFF}',
    '\u{A66F}',
    '\u{A67C}',
    '\u{A67D}',
    '\u{A6F0}',
    '\u{A6F1}',
    '\u{A8E0}',
    '\u{A8E1}',
    '\u{A8E2}',
    '\u{A8E3}',
    '\u{A8E4}',
    '\u{A8E5}',
    '\u{A8E6}',
    '\u{A8E7}',
    '\u{A8E8}',
    '\u{A8E9}',
    '\u{A8EA}',
    '\u{A8EB}',
    '\u{A8EC}',
    '\u{A8ED}',
    '\u{A8EE}',
    '\u{A8EF}',
    '\u{A8F0}',
    '\u{A8F1}',
    '\u{AAB0}',
    '\u{AAB2}',
    '\u{AAB3}',
    '\u{AAB7}',
    '\u{AAB8}',
    '\u{AABE}',
    '\u{AABF}',
    '\u{AAC1}',
    '\u{FE20}',
    '\u{FE21}',
    '\u{FE22}',
    '\u{FE23}',
    '\u{FE24}',
    '\u{FE25}',
    '\u{FE26}',
    '\u{10A0F}',
    '\u{10A38}',
    '\u{1D185}',
    '\u{1D186}',
    '\u{1D187}',
    '\u{1D188}',
    '\u{1D189}',
    '\u{1D1AA}',
    '\u{1D1AB}',
    '\u{1D1AC}',
    '\u{1D1AD}',
    '\u{1D242}',
    '\u{1D243}',
    '\u{1D244}',
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truecolor_cell_encoding() {
        // 24bit_3rd id: all four channels in use.
        let placeholder = ImagePlaceholder::new(0x02AABBCC, 2, 1);
        let lines = placeholder.render_lines(&ImagePlaceholderMode::default(), None);
        assert_eq!(lines.len(), 1);
        let expected = format!(
            "\x1b[38;2;170;187;204m\u{10EEEE}{}{}{}\u{10EEEE}{}{}{}\x1b[0m",
            diacritic(0),
            diacritic(0),
            diacritic(2),
            diacritic(0),
            diacritic(1),
            diacritic(2),
        );
        assert_eq!(lines[0], expected);
    }

    #[test]
    fn indexed_color_cell_encoding() {
        // 8bit id: color is the low byte, no 4th-byte diacritic.
        let placeholder = ImagePlaceholder::new(0x00000042, 1, 1);
        let lines = placeholder.render_lines(&ImagePlaceholderMode::default(), None);
        let expected = format!(
            "\x1b[38;5;66m\u{10EEEE}{}{}\x1b[0m",
            diacritic(0),
            diacritic(0),
        );
        assert_eq!(lines[0], expected);
    }

    #[test]
    fn colorless_cell_encoding() {
        // 0bit_3rd id: no SGR at all, the id lives in the 4th-byte diacritic.
        let placeholder = ImagePlaceholder::new(0x05000000, 1, 1);
        let lines = placeholder.render_lines(&ImagePlaceholderMode::default(), None);
        let expected = format!(
            "\u{10EEEE}{}{}{}\x1b[0m",
            diacritic(0),
            diacritic(0),
            diacritic(5),
        );
        assert_eq!(lines[0], expected);
    }

    #[test]
    fn fewer_diacritics_mode() {
        let placeholder = ImagePlaceholder::new(0x00000007, 3, 2);
        let lines = placeholder.render_lines(&ImagePlaceholderMode::fewer_diacritics(), None);
        assert_eq!(lines.len(), 2);
        let expected = format!(
            "\x1b[38;5;7m\u{10EEEE}{}{}\u{10EEEE}\u{10EEEE}\x1b[0m",
            diacritic(1),
            diacritic(0),
        );
        assert_eq!(lines[1], expected);
    }

    #[test]
    fn formatting_prefix_and_row_offsets() {
        let placeholder = ImagePlaceholder {
            image_id: 0x00000001,
            placement_id: 0,
            start_col: 2,
            start_row: 3,
            end_col: 4,
            end_row: 5,
        };
        let lines = placeholder.render_lines(
            &ImagePlaceholderMode::default(),
            Some("\x1b[48;2;1;2;3m"),
        );
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("\x1b[48;2;1;2;3m\x1b[38;5;1m"));
        // First cell of the first line carries (row=3, col=2).
        let expected_start = format!(
            "\x1b[48;2;1;2;3m\x1b[38;5;1m\u{10EEEE}{}{}",
            diacritic(3),
            diacritic(2),
        );
        assert!(lines[0].starts_with(&expected_start));
    }

    #[test]
    fn placement_id_background() {
        let mode = ImagePlaceholderMode {
            allow_256colors_for_placement_id: true,
            ..Default::default()
        };
        let mut placeholder = ImagePlaceholder::new(0x00000001, 1, 1);
        placeholder.placement_id = 42;
        let lines = placeholder.render_lines(&mode, None);
        assert!(lines[0].contains("\x1b[48;5;42m"));

        placeholder.placement_id = 0;
        let lines = placeholder.render_lines(&mode, None);
        assert!(!lines[0].contains("\x1b[48;"));
    }

    #[test]
    fn geometry_from_pixels() {
        // 100x50 pixels in 10x20 cells: 10 cols, ceil(50/20) = 3 rows.
        let (cols, rows) =
            optimal_cols_and_rows(100, 50, None, None, 80, 24, (10, 20), 1.0).unwrap();
        assert_eq!((cols, rows), (10, 3));
    }

    #[test]
    fn geometry_explicit_dimensions_win() {
        let (cols, rows) =
            optimal_cols_and_rows(100, 50, Some(4), Some(9), 80, 24, (10, 20), 1.0).unwrap();
        assert_eq!((cols, rows), (4, 9));
    }

    #[test]
    fn geometry_derives_missing_dimension() {
        // cols = 10: rows = ceil(10 * 10 * 50 / (100 * 20)) = ceil(2.5) = 3.
        let (cols, rows) =
            optimal_cols_and_rows(100, 50, Some(10), None, 80, 24, (10, 20), 1.0).unwrap();
        assert_eq!((cols, rows), (10, 3));
        // rows = 3: cols = ceil(3 * 20 * 100 / (50 * 10)) = 12.
        let (cols, rows) =
            optimal_cols_and_rows(100, 50, None, Some(3), 80, 24, (10, 20), 1.0).unwrap();
        assert_eq!((cols, rows), (12, 3));
    }

    #[test]
    fn geometry_clamps_preserving_aspect_ratio() {
        // 1000px wide at 10px cells wants 100 cols; clamped to 20, rows follow.
        let (cols, rows) =
            optimal_cols_and_rows(1000, 500, None, None, 20, 256, (10, 20), 1.0).unwrap();
        assert_eq!(cols, 20);
        assert_eq!(rows, 5);
    }

    #[test]
    fn geometry_scale_factor() {
        let (cols, rows) =
            optimal_cols_and_rows(100, 50, None, None, 80, 24, (10, 20), 2.0).unwrap();
        assert_eq!((cols, rows), (20, 5));
    }

    #[test]
    fn geometry_rows_never_exceed_protocol_cap() {
        let (_, rows) =
            optimal_cols_and_rows(10, 100000, None, None, 500, 500, (10, 20), 1.0).unwrap();
        assert!(rows <= 256);
    }

    #[test]
    fn diacritics_table_is_consistent() {
        assert_eq!(ROWCOLUMN_DIACRITICS.len(), 297);
        assert_eq!(ROWCOLUMN_DIACRITICS[0], '\u{305}');
        assert_eq!(diacritic(255), '\u{1D1AD}');
    }
}
