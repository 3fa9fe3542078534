//! The high-level upload-and-display flow.
//!
//! A [`Session`] ties the pieces together: it canonicalizes an image into a
//! description string, asks the [`IDManager`] for an id, decides through the
//! upload ledger whether the terminal already has fresh data, transmits when
//! needed, and paints the placeholder rectangle.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use serde::{Deserialize, Serialize};

use crate::command::{
    PlacementData, Quietness, TransmissionMedium, TransmitCommand,
};
use crate::config::Config;
use crate::errors::{Errors, Result};
use crate::id_manager::IDManager;
use crate::id_space::{IDSpace, IDSubspace};
use crate::placeholder::{
    ImagePlaceholder, ImagePlaceholderMode, optimal_cols_and_rows,
};
use crate::terminal::{GraphicsTerminal, PlaceholderPrint};

/// Where the cursor ends up relative to the displayed rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalCursorPos {
    TopLeft,
    TopRight,
    /// One line below the bottom-left corner, synthesizing a newline at the
    /// screen bottom if needed.
    #[default]
    BottomLeft,
    BottomRight,
}

/// An image to upload: a path on disk or decoded pixels.
pub enum ImageSource {
    Path(PathBuf),
    Memory(DynamicImage),
}

impl From<&str> for ImageSource {
    fn from(path: &str) -> Self {
        ImageSource::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        ImageSource::Memory(image)
    }
}

/// The canonical description of an image instance: same fields, same order,
/// every time, so that equal instances map to equal database keys.
#[derive(Serialize, Deserialize)]
struct ImageDescription {
    path: String,
    mtime: f64,
    cols: u16,
    rows: u16,
}

/// An image bound to a display geometry and an allocated id.
#[derive(Debug, Clone)]
pub struct ImageInstance {
    pub path: String,
    pub mtime: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
    pub id: u32,
    /// Present for in-memory sources; file sources are re-read at upload
    /// time.
    pub image: Option<DynamicImage>,
}

impl ImageInstance {
    pub fn description(&self) -> String {
        let mtime = self.mtime.timestamp() as f64
            + f64::from(self.mtime.timestamp_subsec_micros()) / 1e6;
        serde_json::to_string(&ImageDescription {
            path: self.path.clone(),
            mtime,
            cols: self.cols,
            rows: self.rows,
        })
        .unwrap_or_default()
    }

    pub fn from_description(description: &str, id: u32) -> Option<ImageInstance> {
        let parsed: ImageDescription = serde_json::from_str(description).ok()?;
        Some(ImageInstance {
            path: parsed.path,
            mtime: DateTime::from_timestamp_micros((parsed.mtime * 1e6).round() as i64)?,
            cols: parsed.cols,
            rows: parsed.rows,
            id,
            image: None,
        })
    }

    /// Whether the file behind this instance still exists with the mtime it
    /// had when the id was assigned.
    pub fn is_file_available(&self) -> bool {
        let Ok(metadata) = std::fs::metadata(&self.path) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        let modified: DateTime<Utc> = modified.into();
        modified.timestamp_micros() == self.mtime.timestamp_micros()
    }

    pub fn placeholder(&self) -> ImagePlaceholder {
        ImagePlaceholder::new(self.id, self.cols, self.rows)
    }
}

/// Per-call overrides for uploading and displaying. `None` falls back to
/// the session config.
#[derive(Debug, Clone, Default)]
pub struct DisplayOptions {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub max_cols: Option<u16>,
    pub max_rows: Option<u16>,
    pub scale: Option<f32>,
    pub id_space: Option<IDSpace>,
    pub id_subspace: Option<IDSubspace>,
    /// Claim exactly this id instead of allocating one.
    pub force_id: Option<u32>,
    pub force_reupload: Option<bool>,
    pub upload_method: Option<TransmissionMedium>,
    pub fewer_diacritics: Option<bool>,
    pub background: Option<(u8, u8, u8)>,
    /// Paint at this zero-based position instead of the cursor.
    pub abs_pos: Option<(u16, u16)>,
    pub final_cursor_pos: Option<FinalCursorPos>,
}

/// Name, per-terminal id and per-session id of the terminal we talk to.
///
/// The terminal id keys the upload ledger (one ledger entry per terminal
/// instance); the session id names the database file, so that ids are
/// shared across processes within a terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TerminalIdentity {
    name: String,
    terminal_id: String,
    session_id: String,
}

fn sanitize_identity(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn tmux_display_message(message: &str) -> Option<String> {
    let output = Command::new("tmux")
        .args(["display-message", "-p", message])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn detect_terminal_identity(num_tmux_layers: usize) -> TerminalIdentity {
    let term = std::env::var("TERM").unwrap_or_else(|_| "unknown-terminal".to_string());
    if num_tmux_layers > 0 {
        if let Some(data) =
            tmux_display_message("#{client_termname}||||#{client_pid}||||#{session_id}")
        {
            let parts: Vec<&str> = data.split("||||").collect();
            if let [name, pid, session] = parts[..] {
                return TerminalIdentity {
                    name: name.to_string(),
                    terminal_id: sanitize_identity(&format!("tmux-client-{name}-{pid}")),
                    session_id: sanitize_identity(&format!("tmux-{session}")),
                };
            }
        }
    }
    let window = std::env::var("WINDOWID").unwrap_or_else(|_| "unknown-window".to_string());
    let terminal_id = sanitize_identity(&format!("{term}-{window}"));
    TerminalIdentity {
        name: term,
        session_id: terminal_id.clone(),
        terminal_id,
    }
}

fn detect_tmux_layers() -> usize {
    let term = std::env::var("TERM").unwrap_or_default();
    if std::env::var_os("TMUX").is_some() && (term.contains("screen") || term.contains("tmux")) {
        1
    } else {
        0
    }
}

fn detect_ssh() -> bool {
    ["SSH_CLIENT", "SSH_TTY", "SSH_CONNECTION"]
        .iter()
        .any(|var| std::env::var_os(var).is_some())
}

fn auto_upload_method(inside_ssh: bool) -> TransmissionMedium {
    if inside_ssh {
        // The terminal sits on the other end of the connection; a local
        // file path means nothing to it.
        TransmissionMedium::Direct
    } else {
        TransmissionMedium::File
    }
}

fn default_database_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("kittypix")
}

fn path_and_mtime(source: &ImageSource) -> (String, DateTime<Utc>) {
    match source {
        ImageSource::Path(path) => {
            if let Some(s) = path.to_str() {
                // Paths starting with ":" are synthetic names, not files.
                if s.starts_with(':') {
                    return (s.to_string(), DateTime::UNIX_EPOCH);
                }
            }
            let path = expand_tilde(path);
            let mtime = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or(DateTime::UNIX_EPOCH);
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            (path.to_string_lossy().into_owned(), mtime)
        }
        ImageSource::Memory(image) => {
            let digest = md5::compute(image.as_bytes());
            (format!(":kittypix:{digest:x}"), DateTime::UNIX_EPOCH)
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

pub struct Session {
    pub term: GraphicsTerminal,
    pub id_manager: IDManager,
    pub final_cursor_pos: FinalCursorPos,
    config: Config,
    identity: TerminalIdentity,
    inside_ssh: bool,
}

impl Session {
    /// Opens `/dev/tty`, detects the terminal and opens the id database at
    /// `<id_database_dir>/<session_id>.sqlite`.
    pub fn new(config: Config) -> Result<Session> {
        let mut term = GraphicsTerminal::open()?;
        term.max_command_size = config.max_command_size;
        let num_tmux_layers = config.num_tmux_layers.unwrap_or_else(detect_tmux_layers);
        term.num_tmux_layers = num_tmux_layers;

        let identity = detect_terminal_identity(num_tmux_layers);
        let database_dir = config
            .id_database_dir
            .clone()
            .unwrap_or_else(default_database_dir);
        std::fs::create_dir_all(&database_dir)?;
        let database_path = database_dir.join(format!("{}.sqlite", identity.session_id));
        let id_manager = IDManager::open_with_limit(
            &database_path.to_string_lossy(),
            config.max_ids_per_subspace,
        );
        Ok(Session {
            term,
            id_manager: id_manager?,
            final_cursor_pos: FinalCursorPos::default(),
            config,
            inside_ssh: detect_ssh(),
            identity,
        })
    }

    /// Builds a session from pre-made parts. Used by tests and by callers
    /// that manage the tty or the database themselves.
    pub fn with_parts(
        term: GraphicsTerminal,
        id_manager: IDManager,
        config: Config,
        terminal_id: &str,
    ) -> Session {
        Session {
            term,
            id_manager,
            final_cursor_pos: FinalCursorPos::default(),
            config,
            inside_ssh: detect_ssh(),
            identity: TerminalIdentity {
                name: terminal_id.to_string(),
                terminal_id: terminal_id.to_string(),
                session_id: terminal_id.to_string(),
            },
        }
    }

    pub fn terminal_id(&self) -> &str {
        &self.identity.terminal_id
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    /// Re-reads the terminal identity from the environment. The database
    /// stays the same; only the upload ledger key may change.
    pub fn redetect_terminal(&mut self) {
        self.identity = detect_terminal_identity(self.term.num_tmux_layers);
    }

    /// Pixels per cell: configured, else queried, else the default.
    pub fn cell_size(&self) -> (u16, u16) {
        if let Some(cell_size) = self.config.cell_size {
            return cell_size;
        }
        match self.term.get_cell_size() {
            Ok(Some(cell_size)) => cell_size,
            _ => self.config.default_cell_size,
        }
    }

    fn max_cols_and_rows(&self, opts: &DisplayOptions) -> (u16, u16) {
        let mut max_cols = opts.max_cols.or(self.config.max_cols);
        let mut max_rows = opts.max_rows.or(self.config.max_rows);
        if max_cols.is_none() || max_rows.is_none() {
            if let Ok((cols, lines)) = self.term.get_size() {
                max_cols.get_or_insert(cols);
                max_rows.get_or_insert(lines.min(256));
            }
        }
        (
            max_cols.unwrap_or(256).max(1),
            max_rows.unwrap_or(256).clamp(1, 256),
        )
    }

    /// The placeholder geometry for a `width`×`height` pixel image under
    /// the session's limits.
    pub fn optimal_cols_and_rows(
        &self,
        width: u32,
        height: u32,
        opts: &DisplayOptions,
    ) -> Result<(u16, u16)> {
        let (max_cols, max_rows) = self.max_cols_and_rows(opts);
        optimal_cols_and_rows(
            width,
            height,
            opts.cols,
            opts.rows,
            max_cols,
            max_rows,
            self.cell_size(),
            opts.scale.unwrap_or(self.config.scale),
        )
    }

    /// Canonicalizes a source into an instance with geometry but no id yet.
    fn build_image_instance(
        &self,
        source: ImageSource,
        opts: &DisplayOptions,
    ) -> Result<ImageInstance> {
        let (path, mtime) = path_and_mtime(&source);
        let (cols, rows) = match (opts.cols, opts.rows) {
            (Some(cols), Some(rows)) => (cols, rows),
            _ => {
                let (width, height) = match &source {
                    ImageSource::Path(p) => image::image_dimensions(expand_tilde(p))?,
                    ImageSource::Memory(image) => (image.width(), image.height()),
                };
                self.optimal_cols_and_rows(width, height, opts)?
            }
        };
        Ok(ImageInstance {
            path,
            mtime,
            cols,
            rows,
            id: 0,
            image: match source {
                ImageSource::Memory(image) => Some(image),
                ImageSource::Path(_) => None,
            },
        })
    }

    /// Computes the geometry and allocates (or forces) an id for the image.
    pub fn assign_id(
        &mut self,
        source: ImageSource,
        opts: &DisplayOptions,
    ) -> Result<ImageInstance> {
        let mut inst = self.build_image_instance(source, opts)?;
        let description = inst.description();
        if let Some(force_id) = opts.force_id {
            self.id_manager.set_id(force_id, &description)?;
            inst.id = force_id;
            return Ok(inst);
        }
        let space = match opts.id_space {
            Some(space) => space,
            None => IDSpace::new(self.config.id_color_bits, self.config.id_use_3rd_diacritic)?,
        };
        let subspace = opts.id_subspace.unwrap_or(self.config.id_subspace);
        inst.id = self.id_manager.get_id(&description, space, subspace)?;
        Ok(inst)
    }

    /// Reconstructs an instance for a previously allocated id, if its
    /// description is one of ours.
    pub fn get_image_instance(&mut self, id: u32) -> Result<Option<ImageInstance>> {
        Ok(self
            .id_manager
            .get_info(id)?
            .and_then(|info| ImageInstance::from_description(&info.description, id)))
    }

    /// Whether the terminal needs (re)transmission of `id` under the
    /// session's freshness policy.
    pub fn needs_uploading(&self, id: u32) -> Result<bool> {
        self.id_manager.needs_uploading(
            id,
            &self.identity.terminal_id,
            Some(self.config.reupload_max_uploads_ago),
            Some(self.config.reupload_max_bytes_ago),
            Some(Duration::from_secs(self.config.reupload_max_seconds_ago)),
        )
    }

    /// Assigns an id and transmits the image data unless the ledger says
    /// the terminal already has it fresh.
    pub fn upload(&mut self, source: ImageSource, opts: &DisplayOptions) -> Result<ImageInstance> {
        let inst = self.assign_id(source, opts)?;
        self.upload_instance(&inst, opts)?;
        Ok(inst)
    }

    /// Like [`Session::upload`], for an instance that already has an id.
    pub fn upload_instance(&mut self, inst: &ImageInstance, opts: &DisplayOptions) -> Result<()> {
        if self.config.redetect_terminal {
            self.redetect_terminal();
        }
        let force = opts.force_reupload.unwrap_or(self.config.force_reupload);
        if force || self.needs_uploading(inst.id)? {
            let size = self.transmit(inst, opts)?;
            self.id_manager
                .mark_uploaded(inst.id, &self.identity.terminal_id, size)?;
            log::debug!(
                "uploaded {} ({size} bytes) as id {:#010x} to {}",
                inst.path,
                inst.id,
                self.identity.terminal_id
            );
        } else {
            log::debug!("id {:#010x} is fresh on {}", inst.id, self.identity.terminal_id);
        }
        Ok(())
    }

    fn supported_formats(&self) -> Vec<String> {
        match &self.config.supported_formats {
            Some(formats) => formats.iter().map(|f| f.to_ascii_lowercase()).collect(),
            None => {
                let mut formats = vec!["png".to_string()];
                // st and its forks decode jpeg natively.
                if self.identity.name.starts_with("st") {
                    formats.push("jpeg".to_string());
                }
                formats
            }
        }
    }

    fn format_supported(&self, format: ImageFormat) -> bool {
        let supported = self.supported_formats();
        format
            .extensions_str()
            .iter()
            .any(|ext| supported.iter().any(|s| s == ext))
    }

    fn upload_method(&self, opts: &DisplayOptions) -> TransmissionMedium {
        opts.upload_method
            .or(self.config.upload_method)
            .unwrap_or_else(|| auto_upload_method(self.inside_ssh))
    }

    fn max_upload_size(&self, method: TransmissionMedium) -> u64 {
        match method {
            TransmissionMedium::Direct => self.config.stream_max_size,
            TransmissionMedium::File | TransmissionMedium::TempFile => self.config.file_max_size,
        }
    }

    fn upload_quietness(&self) -> Quietness {
        if self.config.check_response {
            Quietness::Verbose
        } else {
            Quietness::QuietAlways
        }
    }

    /// Sends the image data, returning the transmitted byte count.
    fn transmit(&mut self, inst: &ImageInstance, opts: &DisplayOptions) -> Result<u64> {
        let method = self.upload_method(opts);
        let max_upload = self.max_upload_size(method);

        let image = match &inst.image {
            Some(image) => image.clone(),
            None => {
                if !inst.is_file_available() {
                    return Err(Errors::AssetChanged {
                        path: inst.path.clone(),
                    });
                }
                let reader = image::ImageReader::open(&inst.path)?.with_guessed_format()?;
                let format = reader.format();
                // Never ship the original file as a temp file: the terminal
                // would delete it after reading.
                if format.is_some_and(|f| self.format_supported(f))
                    && method != TransmissionMedium::TempFile
                {
                    let size = std::fs::metadata(&inst.path)?.len();
                    if size <= max_upload {
                        // The terminal decodes this format itself; ship the
                        // file as-is.
                        self.transmit_file(&inst.path, inst, method)?;
                        self.check_response()?;
                        return Ok(size);
                    }
                }
                reader.decode()?
            }
        };

        // Downsample until the decoded transmission fits the size cap.
        let mut image = image;
        let bytes_per_pixel = u64::from(image.color().bytes_per_pixel());
        let estimated = u64::from(image.width()) * u64::from(image.height()) * bytes_per_pixel;
        if estimated > max_upload {
            let ratio = (max_upload as f64 / estimated as f64).sqrt();
            let width = ((f64::from(image.width()) * ratio) as u32).max(1);
            let height = ((f64::from(image.height()) * ratio) as u32).max(1);
            log::debug!(
                "downsampling {} from {}x{} to {width}x{height}",
                inst.path,
                image.width(),
                image.height()
            );
            image = image.resize_exact(width, height, FilterType::Triangle);
        }

        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        let size = png.len() as u64;

        match method {
            TransmissionMedium::File | TransmissionMedium::TempFile => {
                // The prefix is part of the protocol: terminals delete temp
                // files whose path contains "tty-graphics-protocol".
                let file = tempfile::Builder::new()
                    .prefix("tty-graphics-protocol-")
                    .suffix(".png")
                    .tempfile()?;
                let (_, path) = file.keep().map_err(|e| Errors::Io(e.error))?;
                std::fs::write(&path, &png)?;
                self.transmit_file(&path.to_string_lossy(), inst, TransmissionMedium::TempFile)?;
            }
            TransmissionMedium::Direct => {
                self.term.send_command(
                    TransmitCommand {
                        image_id: Some(inst.id),
                        medium: TransmissionMedium::Direct,
                        quiet: self.upload_quietness(),
                        pix_width: Some(image.width()),
                        pix_height: Some(image.height()),
                        ..Default::default()
                    }
                    .set_placement(PlacementData {
                        virtual_placement: true,
                        rows: Some(inst.rows),
                        cols: Some(inst.cols),
                        ..Default::default()
                    })
                    .set_data(png),
                )?;
            }
        }
        self.check_response()?;
        Ok(size)
    }

    fn transmit_file(
        &mut self,
        filename: &str,
        inst: &ImageInstance,
        method: TransmissionMedium,
    ) -> Result<()> {
        match method {
            TransmissionMedium::File | TransmissionMedium::TempFile => {
                self.term.send_command(
                    TransmitCommand {
                        image_id: Some(inst.id),
                        medium: method,
                        quiet: self.upload_quietness(),
                        ..Default::default()
                    }
                    .set_placement(PlacementData {
                        virtual_placement: true,
                        rows: Some(inst.rows),
                        cols: Some(inst.cols),
                        ..Default::default()
                    })
                    .set_filename(filename),
                )?;
            }
            TransmissionMedium::Direct => {
                let bytes = std::fs::read(filename)?;
                self.term.send_command(
                    TransmitCommand {
                        image_id: Some(inst.id),
                        medium: TransmissionMedium::Direct,
                        quiet: self.upload_quietness(),
                        ..Default::default()
                    }
                    .set_placement(PlacementData {
                        virtual_placement: true,
                        rows: Some(inst.rows),
                        cols: Some(inst.cols),
                        ..Default::default()
                    })
                    .set_data(bytes),
                )?;
            }
        }
        Ok(())
    }

    /// When response checking is on, waits for the terminal's answer and
    /// surfaces non-OK messages as errors.
    fn check_response(&mut self) -> Result<()> {
        if !self.config.check_response {
            return Ok(());
        }
        let timeout = Duration::from_secs_f32(self.config.check_response_timeout.max(0.0));
        let response = self.term.receive_response(timeout)?;
        if !response.is_valid {
            return Err(Errors::Terminal(
                "no response to the upload command".to_string(),
            ));
        }
        if !response.is_ok {
            return Err(Errors::Terminal(response.message));
        }
        Ok(())
    }

    fn placeholder_mode(&self, fewer_diacritics: Option<bool>) -> ImagePlaceholderMode {
        let fewer = fewer_diacritics.unwrap_or(self.config.fewer_diacritics);
        let mut mode = if fewer {
            ImagePlaceholderMode::fewer_diacritics()
        } else {
            ImagePlaceholderMode::default()
        };
        mode.placeholder_char = self.config.placeholder_char;
        mode
    }

    fn background_formatting(&self, background: Option<(u8, u8, u8)>) -> Option<String> {
        let (r, g, b) = background.or(self.config.background)?;
        Some(format!("\x1b[48;2;{r};{g};{b}m"))
    }

    /// Paints the placeholder for an already uploaded instance and moves
    /// the cursor to its final position.
    pub fn display_only(
        &mut self,
        inst: &ImageInstance,
        opts: &DisplayOptions,
    ) -> Result<ImagePlaceholder> {
        self.display_placeholder(inst.placeholder(), opts)
    }

    pub fn display_placeholder(
        &mut self,
        placeholder: ImagePlaceholder,
        opts: &DisplayOptions,
    ) -> Result<ImagePlaceholder> {
        self.term.print_placeholder(
            &placeholder,
            &PlaceholderPrint {
                mode: self.placeholder_mode(opts.fewer_diacritics),
                formatting: self.background_formatting(opts.background),
                pos: opts.abs_pos,
                ..Default::default()
            },
        )?;
        self.move_cursor_to_final_position(
            placeholder.cols(),
            placeholder.rows(),
            opts.final_cursor_pos.unwrap_or(self.final_cursor_pos),
        )?;
        Ok(placeholder)
    }

    /// The whole flow: canonicalize, allocate an id, upload when stale,
    /// paint the placeholder.
    pub fn upload_and_display(
        &mut self,
        source: ImageSource,
        opts: &DisplayOptions,
    ) -> Result<ImagePlaceholder> {
        let inst = self.upload(source, opts)?;
        self.display_only(&inst, opts)
    }

    fn move_cursor_to_final_position(
        &mut self,
        cols: u16,
        rows: u16,
        pos: FinalCursorPos,
    ) -> Result<()> {
        let up = i32::from(rows.max(1)) - 1;
        match pos {
            FinalCursorPos::BottomRight => Ok(()),
            FinalCursorPos::TopRight => self.term.move_cursor_by(0, -up),
            FinalCursorPos::TopLeft => self.term.move_cursor_by(-i32::from(cols), -up),
            FinalCursorPos::BottomLeft => {
                self.term.move_cursor_by(-i32::from(cols), 0)?;
                // IND moves down one line, scrolling at the bottom, which a
                // plain cursor-down cannot do.
                self.term.write(b"\x1bD")
            }
        }
    }
}
