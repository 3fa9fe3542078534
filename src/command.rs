//! Graphics protocol commands and their serialization.
//!
//! A command serializes to a body of comma-separated single-letter
//! `key=value` attributes, optionally followed by `;` and a base64 payload.
//! The body is what goes between `ESC _ G` and `ESC \`; enveloping and
//! multiplexer wrapping happen in [`crate::terminal`].

use std::fmt::{self, Write as _};

use serde::Deserialize;

/// How image data reaches the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransmissionMedium {
    /// Base64 data inline in the command payload (`t=d`).
    #[default]
    Direct,
    /// A path to a file the terminal reads itself (`t=f`).
    File,
    /// Like [`TransmissionMedium::File`], but the terminal deletes the file
    /// after reading it (`t=t`).
    #[serde(alias = "tempfile")]
    TempFile,
}

impl TransmissionMedium {
    fn letter(self) -> char {
        match self {
            TransmissionMedium::Direct => 'd',
            TransmissionMedium::File => 'f',
            TransmissionMedium::TempFile => 't',
        }
    }
}

/// Pixel format of transmitted data (`f=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    Rgb,
    Rgba,
    #[default]
    Png,
}

impl Format {
    fn value(self) -> u32 {
        match self {
            Format::Rgb => 24,
            Format::Rgba => 32,
            Format::Png => 100,
        }
    }
}

/// How talkative the terminal should be about this command (`q=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quietness {
    /// Respond to both success and failure.
    #[default]
    Verbose,
    /// Respond only on failure.
    QuietUnlessError,
    /// Never respond.
    QuietAlways,
}

impl Quietness {
    fn value(self) -> u32 {
        match self {
            Quietness::Verbose => 0,
            Quietness::QuietUnlessError => 1,
            Quietness::QuietAlways => 2,
        }
    }
}

/// The target of a delete command (`d=`). Uppercase variants (selected with
/// `delete_data`) also free the image data on the terminal side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhatToDelete {
    /// All placements visible on screen.
    #[default]
    VisiblePlacements,
    /// The image (or one placement of it) addressed by `i=`/`p=`.
    ImageOrPlacementById,
    /// The newest image with the number given by `I=`.
    ImageOrPlacementByNumber,
    /// Placements intersecting the cursor cell.
    AtCursor,
    /// Animation frames of the image addressed by `i=`.
    Frames,
    /// Placements intersecting the cell given by `x=`/`y=`.
    AtCell,
    /// Placements intersecting a cell with a specific z-index.
    AtCellWithZ,
    /// Placements intersecting the column given by `x=`.
    Column,
    /// Placements intersecting the row given by `y=`.
    Row,
    /// Placements with the z-index given by `z=`.
    ZIndex,
}

impl WhatToDelete {
    fn letter(self, delete_data: bool) -> char {
        let lower = match self {
            WhatToDelete::VisiblePlacements => 'a',
            WhatToDelete::ImageOrPlacementById => 'i',
            WhatToDelete::ImageOrPlacementByNumber => 'n',
            WhatToDelete::AtCursor => 'c',
            WhatToDelete::Frames => 'f',
            WhatToDelete::AtCell => 'p',
            WhatToDelete::AtCellWithZ => 'q',
            WhatToDelete::Column => 'x',
            WhatToDelete::Row => 'y',
            WhatToDelete::ZIndex => 'z',
        };
        if delete_data {
            lower.to_ascii_uppercase()
        } else {
            lower
        }
    }
}

/// The payload of a transmit command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransmitData {
    #[default]
    None,
    /// Raw image bytes, base64-encoded on serialization.
    Bytes(Vec<u8>),
    /// A file path; also base64-encoded per the protocol.
    Filename(String),
}

impl TransmitData {
    fn to_base64(&self) -> String {
        match self {
            TransmitData::None => String::new(),
            TransmitData::Bytes(bytes) => base64_simd::STANDARD.encode_to_string(bytes),
            TransmitData::Filename(name) => base64_simd::STANDARD.encode_to_string(name.as_bytes()),
        }
    }
}

/// A placement embedded in a transmit command (`a=T`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlacementData {
    pub placement_id: Option<u32>,
    /// `U=1`: the placement is addressed by unicode placeholders instead of
    /// being painted at the cursor.
    pub virtual_placement: bool,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    /// `C=1`: the cursor stays where it was after the placement is painted.
    pub do_not_move_cursor: bool,
}

/// Joins `key=value` attributes with commas.
struct AttrWriter<'a> {
    out: &'a mut String,
    empty: bool,
}

impl<'a> AttrWriter<'a> {
    fn new(out: &'a mut String) -> Self {
        AttrWriter { out, empty: true }
    }

    fn push(&mut self, key: char, value: impl fmt::Display) {
        if !self.empty {
            self.out.push(',');
        }
        write!(self.out, "{key}={value}").unwrap();
        self.empty = false;
    }

    fn push_opt(&mut self, key: char, value: Option<impl fmt::Display>) {
        if let Some(value) = value {
            self.push(key, value);
        }
    }
}

/// Transmits image data, optionally creating a placement (`a=t` / `a=T`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransmitCommand {
    pub image_id: Option<u32>,
    pub image_number: Option<u32>,
    pub medium: TransmissionMedium,
    pub format: Format,
    pub quiet: Quietness,
    pub pix_width: Option<u32>,
    pub pix_height: Option<u32>,
    /// `a=q`: probe support without storing the image.
    pub query: bool,
    pub placement: Option<PlacementData>,
    pub data: TransmitData,
}

impl TransmitCommand {
    pub fn with_image_id(mut self, image_id: u32) -> Self {
        self.image_id = Some(image_id);
        self
    }

    pub fn set_filename(mut self, filename: impl Into<String>) -> Self {
        self.data = TransmitData::Filename(filename.into());
        self
    }

    pub fn set_data(mut self, bytes: Vec<u8>) -> Self {
        self.data = TransmitData::Bytes(bytes);
        self
    }

    pub fn set_placement(mut self, placement: PlacementData) -> Self {
        self.placement = Some(placement);
        self
    }

    /// The put command equivalent to the embedded placement, if any.
    pub fn get_put_command(&self) -> Option<PutCommand> {
        self.placement.map(|placement| PutCommand {
            image_id: self.image_id,
            image_number: self.image_number,
            placement_id: placement.placement_id,
            rows: placement.rows,
            cols: placement.cols,
            virtual_placement: placement.virtual_placement,
            do_not_move_cursor: placement.do_not_move_cursor,
            quiet: self.quiet,
        })
    }

    fn write_attrs(&self, out: &mut String) {
        let mut attrs = AttrWriter::new(out);
        let action = if self.query {
            'q'
        } else if self.placement.is_some() {
            'T'
        } else {
            't'
        };
        attrs.push('a', action);
        if self.quiet != Quietness::Verbose {
            attrs.push('q', self.quiet.value());
        }
        attrs.push_opt('i', self.image_id);
        attrs.push_opt('I', self.image_number);
        attrs.push('f', self.format.value());
        attrs.push('t', self.medium.letter());
        attrs.push_opt('s', self.pix_width);
        attrs.push_opt('v', self.pix_height);
        if let Some(placement) = &self.placement {
            if placement.virtual_placement {
                attrs.push('U', 1);
            }
            attrs.push_opt('p', placement.placement_id);
            attrs.push_opt('c', placement.cols);
            attrs.push_opt('r', placement.rows);
            if placement.do_not_move_cursor {
                attrs.push('C', 1);
            }
        }
    }

    /// Serializes into one or more command bodies. The payload is
    /// base64-encoded first and then split into pieces of at most
    /// `max_chunk` characters; the first chunk carries the full attribute
    /// set, continuations only the quietness and the `m=` flag.
    pub fn to_chunks(&self, max_chunk: usize) -> Vec<String> {
        let payload = self.data.to_base64();
        let max_chunk = max_chunk.max(4);
        if payload.len() <= max_chunk {
            let mut body = String::new();
            self.write_attrs(&mut body);
            if !payload.is_empty() {
                body.push(';');
                body.push_str(&payload);
            }
            return vec![body];
        }
        let mut chunks = Vec::with_capacity(payload.len().div_ceil(max_chunk));
        let mut rest = payload.as_str();
        while !rest.is_empty() {
            let (piece, tail) = rest.split_at(rest.len().min(max_chunk));
            rest = tail;
            let more = u8::from(!rest.is_empty());
            let mut body = String::new();
            if chunks.is_empty() {
                self.write_attrs(&mut body);
                let mut attrs = AttrWriter { out: &mut body, empty: false };
                attrs.push('m', more);
            } else {
                let mut attrs = AttrWriter::new(&mut body);
                if self.quiet != Quietness::Verbose {
                    attrs.push('q', self.quiet.value());
                }
                attrs.push('m', more);
            }
            body.push(';');
            body.push_str(piece);
            chunks.push(body);
        }
        chunks
    }
}

/// Creates a placement for previously transmitted data (`a=p`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutCommand {
    pub image_id: Option<u32>,
    pub image_number: Option<u32>,
    pub placement_id: Option<u32>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub virtual_placement: bool,
    pub do_not_move_cursor: bool,
    pub quiet: Quietness,
}

impl PutCommand {
    fn content(&self) -> String {
        let mut body = String::new();
        let mut attrs = AttrWriter::new(&mut body);
        attrs.push('a', 'p');
        if self.quiet != Quietness::Verbose {
            attrs.push('q', self.quiet.value());
        }
        attrs.push_opt('i', self.image_id);
        attrs.push_opt('I', self.image_number);
        attrs.push_opt('p', self.placement_id);
        attrs.push_opt('c', self.cols);
        attrs.push_opt('r', self.rows);
        if self.virtual_placement {
            attrs.push('U', 1);
        }
        if self.do_not_move_cursor {
            attrs.push('C', 1);
        }
        body
    }
}

/// Deletes placements and optionally the image data behind them (`a=d`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteCommand {
    pub image_id: Option<u32>,
    pub image_number: Option<u32>,
    pub placement_id: Option<u32>,
    pub what: WhatToDelete,
    pub delete_data: bool,
    pub quiet: Quietness,
}

impl DeleteCommand {
    fn content(&self) -> String {
        let mut body = String::new();
        let mut attrs = AttrWriter::new(&mut body);
        attrs.push('a', 'd');
        attrs.push('d', self.what.letter(self.delete_data));
        if self.quiet != Quietness::Verbose {
            attrs.push('q', self.quiet.value());
        }
        attrs.push_opt('i', self.image_id);
        attrs.push_opt('I', self.image_number);
        attrs.push_opt('p', self.placement_id);
        body
    }
}

/// The closed set of protocol commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsCommand {
    Transmit(TransmitCommand),
    Put(PutCommand),
    Delete(DeleteCommand),
}

impl GraphicsCommand {
    /// Serialized command bodies, one per envelope. Only transmit commands
    /// ever produce more than one.
    pub fn to_chunks(&self, max_chunk: usize) -> Vec<String> {
        match self {
            GraphicsCommand::Transmit(cmd) => cmd.to_chunks(max_chunk),
            GraphicsCommand::Put(cmd) => vec![cmd.content()],
            GraphicsCommand::Delete(cmd) => vec![cmd.content()],
        }
    }
}

impl From<TransmitCommand> for GraphicsCommand {
    fn from(cmd: TransmitCommand) -> Self {
        GraphicsCommand::Transmit(cmd)
    }
}

impl From<PutCommand> for GraphicsCommand {
    fn from(cmd: PutCommand) -> Self {
        GraphicsCommand::Put(cmd)
    }
}

impl From<DeleteCommand> for GraphicsCommand {
    fn from(cmd: DeleteCommand) -> Self {
        GraphicsCommand::Delete(cmd)
    }
}
