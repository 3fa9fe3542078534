//! The graphics terminal: a byte sink speaking the kitty graphics protocol.
//!
//! Owns the tty, frames command bodies in `ESC _ G … ESC \` envelopes
//! (wrapped in tmux passthrough when multiplexers sit in between), reads
//! responses back, and keeps a best-effort cache of the cursor position so
//! that placeholder rectangles can be painted without a round-trip.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use rand::Rng;
use rustix::event::{PollFd, PollFlags, poll};
use rustix::termios::{self, LocalModes, OptionalActions, Termios};

use crate::command::{GraphicsCommand, PutCommand};
use crate::errors::{Errors, Result};
use crate::placeholder::{ImagePlaceholder, ImagePlaceholderMode};

pub const DEFAULT_MAX_COMMAND_SIZE: usize = 4096;

/// Timeout for cursor position probes issued on behalf of placeholder
/// printing.
const CURSOR_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A parsed `ESC _ G <attrs> ; <message> ESC \` response.
///
/// Bytes that arrived before the response header are preserved in
/// `non_response`; they may be user input the caller wants to replay.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GraphicsResponse {
    pub is_valid: bool,
    pub image_id: Option<u32>,
    pub image_number: Option<u32>,
    pub placement_id: Option<u32>,
    pub message: String,
    pub is_ok: bool,
    pub non_response: Vec<u8>,
}

impl GraphicsResponse {
    fn invalid(non_response: Vec<u8>) -> Self {
        GraphicsResponse {
            non_response,
            ..Default::default()
        }
    }

    /// Parses a buffer ending in a complete response envelope.
    pub fn parse(buffer: &[u8]) -> GraphicsResponse {
        let Some(start) = buffer.windows(3).position(|w| w == b"\x1b_G") else {
            return GraphicsResponse::invalid(buffer.to_vec());
        };
        let body = &buffer[start + 3..buffer.len().saturating_sub(2)];
        let mut response = GraphicsResponse {
            is_valid: true,
            non_response: buffer[..start].to_vec(),
            ..Default::default()
        };
        let (attrs, message) = match body.iter().position(|b| *b == b';') {
            Some(i) => (&body[..i], Some(&body[i + 1..])),
            None => (body, None),
        };
        if let Some(message) = message {
            response.message = String::from_utf8_lossy(message).into_owned();
            response.is_ok = message == b"OK";
        }
        for part in attrs.split(|b| *b == b',') {
            let Some((key, value)) = part.split_first() else {
                continue;
            };
            let Some(value) = value.strip_prefix(b"=") else {
                continue;
            };
            let Ok(value) = std::str::from_utf8(value) else {
                continue;
            };
            let Ok(value) = value.parse::<u32>() else {
                continue;
            };
            match *key {
                b'i' => response.image_id = Some(value),
                b'I' => response.image_number = Some(value),
                b'p' => response.placement_id = Some(value),
                _ => {}
            }
        }
        response
    }

    /// Whether this is an error response starting with the given tag
    /// (e.g. `"ENOENT"`).
    pub fn is_err(&self, code: &str) -> bool {
        self.is_valid && !self.is_ok && self.message.starts_with(code)
    }
}

/// A relative cursor movement. Opposite directions conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorMove {
    pub right: Option<u16>,
    pub left: Option<u16>,
    pub down: Option<u16>,
    pub up: Option<u16>,
}

/// How to paint a placeholder rectangle.
#[derive(Debug, Clone)]
pub struct PlaceholderPrint {
    pub mode: ImagePlaceholderMode,
    /// Prefixed to every line (e.g. a background SGR); SGR state is reset
    /// after each line regardless.
    pub formatting: Option<String>,
    /// Absolute zero-based position instead of the cursor.
    pub pos: Option<(u16, u16)>,
    /// Leave the cursor where it started.
    pub do_not_move_cursor: bool,
    /// `ESC 7`/`ESC 8` between lines; otherwise relative movement.
    pub use_save_cursor: bool,
}

impl Default for PlaceholderPrint {
    fn default() -> Self {
        PlaceholderPrint {
            mode: ImagePlaceholderMode::default(),
            formatting: None,
            pos: None,
            do_not_move_cursor: false,
            use_save_cursor: true,
        }
    }
}

/// Restores the termios settings saved at construction when dropped, so
/// raw-mode scopes unwind correctly on every exit path. Guards nest: each
/// one restores what it saw.
struct TtyModeGuard {
    fd: OwnedFd,
    saved: Termios,
}

impl TtyModeGuard {
    fn raw(fd: &OwnedFd) -> Result<TtyModeGuard> {
        let saved = termios::tcgetattr(fd)?;
        let mut raw = saved.clone();
        raw.local_modes &= !(LocalModes::ICANON | LocalModes::ECHO);
        termios::tcsetattr(fd, OptionalActions::Drain, &raw)?;
        Ok(TtyModeGuard {
            fd: fd.try_clone()?,
            saved,
        })
    }
}

impl Drop for TtyModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(&self.fd, OptionalActions::Now, &self.saved);
    }
}

fn poll_readable(fd: &OwnedFd, timeout: Duration) -> Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::IN)];
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    Ok(poll(&mut fds, millis)? > 0)
}

/// Where and how large a placeholder rectangle ends up on screen, given the
/// cursor position and the terminal size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlacementPlan {
    /// Lines to scroll up (and move the cursor up by) before printing.
    scroll_up: u16,
    start: (u16, u16),
    cols: u16,
    rows: u16,
    /// `None`: the cursor returns to `start` after printing.
    final_cursor: Option<(u16, u16)>,
    /// Emit `ESC E` instead of ending at the right edge.
    emit_next_line: bool,
}

fn plan_placement(
    cursor: (u16, u16),
    size: (u16, u16),
    cols: u16,
    rows: u16,
    do_not_move_cursor: bool,
) -> PlacementPlan {
    let (col, mut row) = cursor;
    let (term_cols, term_lines) = size;
    let cols = cols.min(term_cols.saturating_sub(col));
    let mut rows = rows;
    let mut scroll_up = 0;
    if do_not_move_cursor {
        // C=1 placements must not introduce new lines; clip instead.
        rows = rows.min(term_lines.saturating_sub(row));
    } else {
        // Scroll so that the rectangle and the line below it fit.
        let overflow = (u32::from(row) + u32::from(rows) + 1).saturating_sub(u32::from(term_lines));
        if overflow > 0 {
            scroll_up = (overflow.min(u32::from(row))) as u16;
            row -= scroll_up;
        }
        rows = rows.min(term_lines.saturating_sub(row));
    }
    let (final_cursor, emit_next_line) = if do_not_move_cursor {
        (None, false)
    } else if col + cols >= term_cols {
        (
            Some((0, (row + rows).min(term_lines.saturating_sub(1)))),
            true,
        )
    } else {
        (Some((col + cols, row + rows.max(1) - 1)), false)
    };
    PlacementPlan {
        scroll_up,
        start: (col, row),
        cols,
        rows,
        final_cursor,
        emit_next_line,
    }
}

pub struct GraphicsTerminal {
    out: Box<dyn Write + Send>,
    tty: Option<OwnedFd>,
    /// Mirrors every write as an escaped `printf` line, for turning a
    /// session into a reproducible shell script.
    script: Option<Box<dyn Write + Send>>,
    pub max_command_size: usize,
    pub num_tmux_layers: usize,
    /// Rewrite incoming placements to virtual ones and paint placeholders
    /// for them.
    pub force_placeholders: bool,
    tracked_cursor: Option<(u16, u16)>,
}

impl GraphicsTerminal {
    /// Opens `/dev/tty` for both output and responses.
    pub fn open() -> Result<GraphicsTerminal> {
        use rustix::fs::{Mode, OFlags, open};
        let fd = open("/dev/tty", OFlags::RDWR | OFlags::NOCTTY, Mode::empty())?;
        let out = fd.try_clone()?;
        Ok(GraphicsTerminal::build(Box::new(File::from(out)), Some(fd)))
    }

    /// Wraps an arbitrary sink. Reading responses and querying sizes is
    /// unavailable; placeholder printing falls back to relative positioning.
    pub fn from_writer(out: Box<dyn Write + Send>) -> GraphicsTerminal {
        GraphicsTerminal::build(out, None)
    }

    fn build(out: Box<dyn Write + Send>, tty: Option<OwnedFd>) -> GraphicsTerminal {
        GraphicsTerminal {
            out,
            tty,
            script: None,
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            num_tmux_layers: 0,
            force_placeholders: false,
            tracked_cursor: None,
        }
    }

    pub fn set_script_output(&mut self, sink: Box<dyn Write + Send>) {
        self.script = Some(sink);
    }

    /// Detects tmux from the environment and adjusts the passthrough layer
    /// count.
    pub fn detect_tmux(&mut self) {
        let term = std::env::var("TERM").unwrap_or_default();
        if std::env::var_os("TMUX").is_some() && (term.contains("screen") || term.contains("tmux"))
        {
            self.num_tmux_layers = self.num_tmux_layers.max(1);
        } else {
            self.num_tmux_layers = 0;
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        if let Some(script) = self.script.as_mut() {
            writeln!(script, "printf '{}'", printf_escape(bytes))?;
        }
        Ok(())
    }

    /// Raw write. The cursor position can no longer be predicted afterwards.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        self.tracked_cursor = None;
        self.write_bytes(data.as_ref())?;
        self.out.flush()?;
        Ok(())
    }

    /// The cached cursor position, if movement since the last probe was
    /// predictable.
    pub fn tracked_cursor(&self) -> Option<(u16, u16)> {
        self.tracked_cursor
    }

    /// Tells the terminal where the cursor is, e.g. when the caller already
    /// probed it or fully controls the screen. Spares a tty round-trip.
    pub fn assume_cursor_position(&mut self, col: u16, row: u16) {
        self.tracked_cursor = Some((col, row));
    }

    fn send_body(&mut self, body: &str) -> Result<()> {
        let mut data = format!("\x1b_G{body}\x1b\\").into_bytes();
        for _ in 0..self.num_tmux_layers {
            data = wrap_tmux_passthrough(&data);
        }
        self.write_bytes(&data)?;
        self.out.flush()?;
        Ok(())
    }

    /// Serializes, chunks, envelopes and writes a command, flushing after
    /// each envelope. With `force_placeholders` on, placements are rewritten
    /// to virtual ones before serialization and a placeholder rectangle is
    /// painted for them afterwards.
    pub fn send_command(&mut self, command: impl Into<GraphicsCommand>) -> Result<()> {
        let mut command = command.into();
        if self.force_placeholders {
            force_virtual(&mut command);
        }
        for body in command.to_chunks(self.max_command_size) {
            self.send_body(&body)?;
        }
        if self.force_placeholders {
            let put = match &command {
                GraphicsCommand::Transmit(cmd) => cmd.get_put_command(),
                GraphicsCommand::Put(cmd) => Some(*cmd),
                GraphicsCommand::Delete(_) => None,
            };
            if let Some(put) = put {
                self.print_placeholder_for_put(&put)?;
            }
        }
        Ok(())
    }

    fn print_placeholder_for_put(&mut self, put: &PutCommand) -> Result<()> {
        let (Some(cols), Some(rows)) = (put.cols, put.rows) else {
            // Without explicit geometry the terminal would derive the cell
            // count from the image size, which we do not know here.
            return Ok(());
        };
        let mut placeholder = ImagePlaceholder::new(put.image_id.unwrap_or(0), cols, rows);
        placeholder.placement_id = put.placement_id.unwrap_or(0);
        self.print_placeholder(
            &placeholder,
            &PlaceholderPrint {
                do_not_move_cursor: put.do_not_move_cursor,
                ..Default::default()
            },
        )
    }

    /// Paints a placeholder rectangle.
    ///
    /// With `opts.pos`, each line is absolutely positioned at
    /// `(pos.0, pos.1 + line)`. Otherwise the rectangle starts at the
    /// cursor: columns are clipped to the right edge and, when the
    /// rectangle would extend past the last line, either the rows are
    /// clipped (`do_not_move_cursor`) or the view is scrolled up so the
    /// rectangle keeps its height.
    pub fn print_placeholder(
        &mut self,
        placeholder: &ImagePlaceholder,
        opts: &PlaceholderPrint,
    ) -> Result<()> {
        let mode = &opts.mode;
        let formatting = opts.formatting.as_deref();
        let pos = opts.pos;
        let do_not_move_cursor = opts.do_not_move_cursor;
        if placeholder.cols() == 0 || placeholder.rows() == 0 {
            return Ok(());
        }
        if let Some((x, y)) = pos {
            return self.print_placeholder_abs(placeholder, mode, formatting, (x, y));
        }

        let geometry = self.current_geometry()?;
        let (clipped, plan) = match geometry {
            Some((cursor, size)) => {
                let plan = plan_placement(
                    cursor,
                    size,
                    placeholder.cols(),
                    placeholder.rows(),
                    do_not_move_cursor,
                );
                (placeholder.clipped(plan.cols, plan.rows), Some(plan))
            }
            None => (*placeholder, None),
        };
        if clipped.cols() == 0 || clipped.rows() == 0 {
            return Ok(());
        }

        let mut data = String::new();
        if let Some(plan) = &plan {
            if plan.scroll_up > 0 {
                write!(data, "\x1b[{0}S\x1b[{0}A", plan.scroll_up).unwrap();
            }
        }
        let lines = clipped.render_lines(mode, formatting);
        let last = lines.len() - 1;
        for (i, line) in lines.iter().enumerate() {
            if i < last {
                if opts.use_save_cursor {
                    // Print through a save/restore pair, then step down.
                    data.push_str("\x1b7");
                    data.push_str(line);
                    data.push_str("\x1b8\x1b[1B");
                } else {
                    data.push_str(line);
                    write!(data, "\x1b[1B\x1b[{}D", clipped.cols()).unwrap();
                }
            } else {
                data.push_str(line);
            }
        }
        // The cursor now sits just right of the last cell.
        match &plan {
            Some(plan) => match plan.final_cursor {
                None => {
                    write!(data, "\x1b[{}D", clipped.cols()).unwrap();
                    if clipped.rows() > 1 {
                        write!(data, "\x1b[{}A", clipped.rows() - 1).unwrap();
                    }
                    self.tracked_cursor = Some(plan.start);
                }
                Some(target) => {
                    if plan.emit_next_line {
                        data.push_str("\x1bE");
                    }
                    self.tracked_cursor = Some(target);
                }
            },
            None => {
                if do_not_move_cursor {
                    write!(data, "\x1b[{}D", clipped.cols()).unwrap();
                    if clipped.rows() > 1 {
                        write!(data, "\x1b[{}A", clipped.rows() - 1).unwrap();
                    }
                }
                self.tracked_cursor = None;
            }
        }
        self.write_bytes(data.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn print_placeholder_abs(
        &mut self,
        placeholder: &ImagePlaceholder,
        mode: &ImagePlaceholderMode,
        formatting: Option<&str>,
        (x, y): (u16, u16),
    ) -> Result<()> {
        let mut data = String::new();
        for (i, line) in placeholder.render_lines(mode, formatting).iter().enumerate() {
            write!(data, "\x1b[{};{}H", u32::from(y) + 1 + i as u32, x + 1).unwrap();
            data.push_str(line);
        }
        self.write_bytes(data.as_bytes())?;
        self.out.flush()?;
        self.tracked_cursor = Some((
            x.saturating_add(placeholder.cols()),
            y.saturating_add(placeholder.rows() - 1),
        ));
        Ok(())
    }

    fn current_geometry(&mut self) -> Result<Option<((u16, u16), (u16, u16))>> {
        if self.tty.is_none() {
            return Ok(None);
        }
        let Ok(size) = self.get_size() else {
            return Ok(None);
        };
        let cursor = self.get_cursor_position_tracked(CURSOR_PROBE_TIMEOUT)?;
        Ok(Some((cursor, size)))
    }

    /// Reads until a graphics response envelope is complete or the timeout
    /// expires. A timeout yields `is_valid = false` with the buffered bytes
    /// preserved, not an error.
    pub fn receive_response(&mut self, timeout: Duration) -> Result<GraphicsResponse> {
        let Some(fd) = self.tty.as_ref() else {
            return Err(Errors::NoTty);
        };
        let _guard = TtyModeGuard::raw(fd)?;
        let fd = fd.try_clone()?;
        let deadline = Instant::now() + timeout;
        let mut buffer: Vec<u8> = Vec::new();
        let mut in_response = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !poll_readable(&fd, remaining)? {
                self.tracked_cursor = None;
                return Ok(GraphicsResponse::invalid(buffer));
            }
            let mut byte = [0u8; 1];
            if rustix::io::read(&fd, &mut byte)? == 0 {
                self.tracked_cursor = None;
                return Ok(GraphicsResponse::invalid(buffer));
            }
            buffer.push(byte[0]);
            if in_response {
                if buffer.ends_with(b"\x1b\\") {
                    break;
                }
            } else if buffer.ends_with(b"\x1b_G") {
                in_response = true;
            }
        }
        Ok(GraphicsResponse::parse(&buffer))
    }

    /// Probes the cursor position with `ESC [6n`. Zero-based `(col, row)`.
    /// A timeout is fatal to the call.
    pub fn get_cursor_position(&mut self, timeout: Duration) -> Result<(u16, u16)> {
        let Some(fd) = self.tty.as_ref() else {
            return Err(Errors::NoTty);
        };
        let _guard = TtyModeGuard::raw(fd)?;
        let fd = fd.try_clone()?;
        self.write_bytes(b"\x1b[6n")?;
        self.out.flush()?;
        let deadline = Instant::now() + timeout;
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !poll_readable(&fd, remaining)? {
                return Err(Errors::CursorResponseTimeout);
            }
            let mut byte = [0u8; 1];
            if rustix::io::read(&fd, &mut byte)? == 0 {
                return Err(Errors::CursorResponseTimeout);
            }
            buffer.push(byte[0]);
            if byte[0] == b'R' {
                if let Some(pos) = parse_cursor_report(&buffer) {
                    self.tracked_cursor = Some(pos);
                    return Ok(pos);
                }
            }
        }
    }

    /// The tracked cursor if it is known, probing the terminal otherwise.
    pub fn get_cursor_position_tracked(&mut self, timeout: Duration) -> Result<(u16, u16)> {
        match self.tracked_cursor {
            Some(pos) => Ok(pos),
            None => self.get_cursor_position(timeout),
        }
    }

    /// `(columns, lines)` from the window-size ioctl.
    pub fn get_size(&self) -> Result<(u16, u16)> {
        let fd = self.tty.as_ref().ok_or(Errors::NoTerminalSize)?;
        let winsize = termios::tcgetwinsize(fd)?;
        if winsize.ws_col == 0 || winsize.ws_row == 0 {
            return Err(Errors::NoTerminalSize);
        }
        Ok((winsize.ws_col, winsize.ws_row))
    }

    /// Pixels per cell, when the terminal reports its pixel size.
    pub fn get_cell_size(&self) -> Result<Option<(u16, u16)>> {
        let fd = self.tty.as_ref().ok_or(Errors::NoTerminalSize)?;
        let winsize = termios::tcgetwinsize(fd)?;
        if winsize.ws_col == 0
            || winsize.ws_row == 0
            || winsize.ws_xpixel == 0
            || winsize.ws_ypixel == 0
        {
            return Ok(None);
        }
        Ok(Some((
            winsize.ws_xpixel / winsize.ws_col,
            winsize.ws_ypixel / winsize.ws_row,
        )))
    }

    /// Relative cursor movement; opposite directions conflict.
    pub fn move_cursor(&mut self, movement: CursorMove) -> Result<()> {
        if movement.up.is_some() && movement.down.is_some() {
            return Err(Errors::ConflictingArguments("both up and down"));
        }
        if movement.left.is_some() && movement.right.is_some() {
            return Err(Errors::ConflictingArguments("both left and right"));
        }
        let dx = i32::from(movement.right.unwrap_or(0)) - i32::from(movement.left.unwrap_or(0));
        let dy = i32::from(movement.down.unwrap_or(0)) - i32::from(movement.up.unwrap_or(0));
        self.move_cursor_by(dx, dy)
    }

    pub fn move_cursor_by(&mut self, dx: i32, dy: i32) -> Result<()> {
        let mut seq = String::new();
        if dy > 0 {
            write!(seq, "\x1b[{dy}B").unwrap();
        } else if dy < 0 {
            write!(seq, "\x1b[{}A", -dy).unwrap();
        }
        if dx > 0 {
            write!(seq, "\x1b[{dx}C").unwrap();
        } else if dx < 0 {
            write!(seq, "\x1b[{}D", -dx).unwrap();
        }
        if seq.is_empty() {
            return Ok(());
        }
        self.write_bytes(seq.as_bytes())?;
        self.out.flush()?;
        if let Some((col, row)) = self.tracked_cursor {
            let col = (i32::from(col) + dx).clamp(0, i32::from(u16::MAX)) as u16;
            let row = (i32::from(row) + dy).clamp(0, i32::from(u16::MAX)) as u16;
            self.tracked_cursor = Some((col, row));
        }
        Ok(())
    }

    /// Absolute cursor movement, zero-based.
    pub fn move_cursor_abs(&mut self, col: Option<u16>, row: Option<u16>) -> Result<()> {
        let mut seq = String::new();
        if let Some(row) = row {
            write!(seq, "\x1b[{}d", row + 1).unwrap();
        }
        if let Some(col) = col {
            write!(seq, "\x1b[{}G", col + 1).unwrap();
        }
        if seq.is_empty() {
            return Ok(());
        }
        self.write_bytes(seq.as_bytes())?;
        self.out.flush()?;
        self.tracked_cursor = match (col, row, self.tracked_cursor) {
            (Some(col), Some(row), _) => Some((col, row)),
            (Some(col), None, Some((_, row))) => Some((col, row)),
            (None, Some(row), Some((col, _))) => Some((col, row)),
            _ => None,
        };
        Ok(())
    }

    /// Sets the scrolling margins (zero-based, inclusive).
    pub fn set_margins(&mut self, top: u16, bottom: u16) -> Result<()> {
        self.tracked_cursor = None;
        let seq = format!("\x1b[{};{}r", top + 1, bottom + 1);
        self.write_bytes(seq.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    pub fn scroll_up(&mut self, lines: u16) -> Result<()> {
        self.tracked_cursor = None;
        let seq = format!("\x1b[{lines}S");
        self.write_bytes(seq.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    pub fn scroll_down(&mut self, lines: u16) -> Result<()> {
        self.tracked_cursor = None;
        let seq = format!("\x1b[{lines}T");
        self.write_bytes(seq.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    /// Full terminal reset (`ESC c`).
    pub fn reset(&mut self) -> Result<()> {
        self.tracked_cursor = None;
        self.write_bytes(b"\x1bc")?;
        self.out.flush()?;
        Ok(())
    }

    /// Waits for a keypress with echo off, then drains whatever arrives
    /// without a pause (escape sequences come in bursts). At most 256 bytes.
    pub fn wait_keypress(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let Some(fd) = self.tty.as_ref() else {
            return Err(Errors::NoTty);
        };
        let _guard = TtyModeGuard::raw(fd)?;
        let fd = fd.try_clone()?;
        let mut result = Vec::new();
        if !poll_readable(&fd, timeout)? {
            return Ok(result);
        }
        while result.len() < 256 {
            let mut byte = [0u8; 1];
            if rustix::io::read(&fd, &mut byte)? == 0 {
                break;
            }
            result.push(byte[0]);
            if !poll_readable(&fd, Duration::ZERO)? {
                break;
            }
        }
        Ok(result)
    }
}

fn force_virtual(command: &mut GraphicsCommand) {
    let mut rng = rand::thread_rng();
    match command {
        GraphicsCommand::Transmit(cmd) => {
            if let Some(placement) = cmd.placement.as_mut() {
                if !placement.virtual_placement {
                    placement.virtual_placement = true;
                    if placement.placement_id.is_none() {
                        placement.placement_id = Some(rng.gen_range(1..=0xFFFFFF));
                    }
                }
            }
        }
        GraphicsCommand::Put(cmd) => {
            if !cmd.virtual_placement {
                cmd.virtual_placement = true;
                if cmd.placement_id.is_none() {
                    cmd.placement_id = Some(rng.gen_range(1..=0xFFFFFF));
                }
            }
        }
        GraphicsCommand::Delete(_) => {}
    }
}

/// Wraps a byte sequence in one tmux passthrough envelope, doubling every
/// contained ESC.
fn wrap_tmux_passthrough(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(b"\x1bPtmux;");
    for &b in data {
        if b == 0x1b {
            out.push(0x1b);
        }
        out.push(b);
    }
    out.extend_from_slice(b"\x1b\\");
    out
}

/// Parses the trailing `ESC [ row ; col R` report. Zero-based `(col, row)`.
fn parse_cursor_report(buffer: &[u8]) -> Option<(u16, u16)> {
    let start = buffer
        .windows(2)
        .rposition(|w| w == b"\x1b[")?;
    let body = &buffer[start + 2..buffer.len() - 1];
    let body = std::str::from_utf8(body).ok()?;
    let (row, col) = body.split_once(';')?;
    let row: u16 = row.parse().ok()?;
    let col: u16 = col.parse().ok()?;
    Some((col.checked_sub(1)?, row.checked_sub(1)?))
}

/// Escapes bytes for a single-quoted POSIX `printf` format string.
fn printf_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'%' => out.push_str("%%"),
            b'\'' => out.push_str("'\\''"),
            0x20..=0x7E => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\{b:03o}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::command::{
        DeleteCommand, PlacementData, Quietness, TransmissionMedium, TransmitCommand,
    };

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sink_terminal() -> (GraphicsTerminal, SharedSink) {
        let sink = SharedSink::default();
        let term = GraphicsTerminal::from_writer(Box::new(sink.clone()));
        (term, sink)
    }

    #[test]
    fn envelope_framing() {
        let (mut term, sink) = sink_terminal();
        term.send_command(PutCommand {
            image_id: Some(1),
            rows: Some(1),
            cols: Some(2),
            quiet: Quietness::QuietUnlessError,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            sink.contents(),
            b"\x1b_Ga=p,q=1,i=1,c=2,r=1\x1b\\".to_vec()
        );
    }

    #[test]
    fn tmux_wrapping_doubles_escapes() {
        let (mut term, sink) = sink_terminal();
        term.num_tmux_layers = 1;
        term.send_command(PutCommand {
            image_id: Some(1),
            rows: Some(1),
            cols: Some(2),
            quiet: Quietness::QuietUnlessError,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            sink.contents(),
            b"\x1bPtmux;\x1b\x1b_Ga=p,q=1,i=1,c=2,r=1\x1b\x1b\\\x1b\\".to_vec()
        );
    }

    #[test]
    fn two_tmux_layers_double_twice() {
        let inner = b"\x1b_Gx\x1b\\";
        let once = wrap_tmux_passthrough(inner);
        let twice = wrap_tmux_passthrough(&once);
        assert!(twice.starts_with(b"\x1bPtmux;\x1b\x1bPtmux;\x1b\x1b\x1b\x1b_Gx"));
        assert!(twice.ends_with(b"\x1b\\"));
    }

    #[test]
    fn chunked_transmit_produces_one_envelope_per_chunk() {
        let (mut term, sink) = sink_terminal();
        term.max_command_size = 1024;
        let bytes = vec![0u8; 1536]; // 2048 base64 chars, two chunks
        term.send_command(
            TransmitCommand {
                image_id: Some(3),
                quiet: Quietness::QuietAlways,
                ..Default::default()
            }
            .set_data(bytes),
        )
        .unwrap();
        let contents = sink.contents();
        let envelopes = contents
            .windows(3)
            .filter(|w| *w == b"\x1b_G")
            .count();
        assert_eq!(envelopes, 2);
        let text = String::from_utf8(contents).unwrap();
        assert!(text.contains("m=1;"));
        assert!(text.contains("m=0;"));
    }

    #[test]
    fn force_placeholders_rewrites_to_virtual() {
        let mut command = GraphicsCommand::Put(PutCommand {
            image_id: Some(9),
            rows: Some(2),
            cols: Some(2),
            ..Default::default()
        });
        force_virtual(&mut command);
        let GraphicsCommand::Put(put) = &command else {
            unreachable!();
        };
        assert!(put.virtual_placement);
        let id = put.placement_id.unwrap();
        assert!(id >= 1 && id <= 0xFFFFFF);

        let mut transmit = GraphicsCommand::Transmit(
            TransmitCommand {
                image_id: Some(9),
                medium: TransmissionMedium::File,
                ..Default::default()
            }
            .set_placement(PlacementData {
                rows: Some(2),
                cols: Some(2),
                ..Default::default()
            }),
        );
        force_virtual(&mut transmit);
        let GraphicsCommand::Transmit(cmd) = &transmit else {
            unreachable!();
        };
        let placement = cmd.placement.unwrap();
        assert!(placement.virtual_placement);
        assert!(placement.placement_id.is_some());
    }

    #[test]
    fn response_parse_round_trip() {
        let response =
            GraphicsResponse::parse(b"junk\x1b_Gi=42,I=7,p=3;OK\x1b\\");
        assert!(response.is_valid);
        assert!(response.is_ok);
        assert_eq!(response.image_id, Some(42));
        assert_eq!(response.image_number, Some(7));
        assert_eq!(response.placement_id, Some(3));
        assert_eq!(response.message, "OK");
        assert_eq!(response.non_response, b"junk".to_vec());
    }

    #[test]
    fn response_parse_error_message() {
        let response =
            GraphicsResponse::parse(b"\x1b_Gi=12345;ENOENT: no such image\x1b\\");
        assert!(response.is_valid);
        assert!(!response.is_ok);
        assert!(response.is_err("ENOENT"));
        assert_eq!(response.image_id, Some(12345));
    }

    #[test]
    fn cursor_report_parsing() {
        assert_eq!(parse_cursor_report(b"\x1b[21;71R"), Some((70, 20)));
        assert_eq!(parse_cursor_report(b"garbage\x1b[1;1R"), Some((0, 0)));
        assert_eq!(parse_cursor_report(b"\x1b[xR"), None);
    }

    #[test]
    fn placement_plan_scrolls_at_bottom() {
        // 80x24 terminal, cursor at (70, 20), 20x10 placeholder.
        let plan = plan_placement((70, 20), (80, 24), 20, 10, false);
        assert_eq!(plan.cols, 10); // clipped to the right edge
        assert_eq!(plan.scroll_up, 7);
        assert_eq!(plan.start, (70, 13));
        assert_eq!(plan.rows, 10);
        assert!(plan.emit_next_line);
        assert_eq!(plan.final_cursor, Some((0, 23)));
    }

    #[test]
    fn placement_plan_clips_for_do_not_move() {
        let plan = plan_placement((70, 20), (80, 24), 20, 10, true);
        assert_eq!(plan.cols, 10);
        assert_eq!(plan.rows, 4); // clipped to the bottom
        assert_eq!(plan.scroll_up, 0);
        assert_eq!(plan.final_cursor, None);
    }

    #[test]
    fn placement_plan_fits_without_adjustment() {
        let plan = plan_placement((0, 0), (80, 24), 20, 10, false);
        assert_eq!(plan.scroll_up, 0);
        assert_eq!(plan.cols, 20);
        assert_eq!(plan.rows, 10);
        assert!(!plan.emit_next_line);
        assert_eq!(plan.final_cursor, Some((20, 9)));
    }

    #[test]
    fn printing_placeholder_without_tty_uses_relative_positioning() {
        let (mut term, sink) = sink_terminal();
        let placeholder = ImagePlaceholder::new(0x00000001, 2, 2);
        term.print_placeholder(&placeholder, &PlaceholderPrint::default())
            .unwrap();
        let text = String::from_utf8(sink.contents()).unwrap();
        // Save/restore around the first line, step down, then the last line.
        assert!(text.starts_with("\x1b7"));
        assert!(text.contains("\x1b8\x1b[1B"));
        assert_eq!(term.tracked_cursor(), None);
    }

    #[test]
    fn printing_placeholder_without_save_cursor_moves_relatively() {
        let (mut term, sink) = sink_terminal();
        let placeholder = ImagePlaceholder::new(0x00000001, 3, 2);
        term.print_placeholder(
            &placeholder,
            &PlaceholderPrint {
                use_save_cursor: false,
                ..Default::default()
            },
        )
        .unwrap();
        let text = String::from_utf8(sink.contents()).unwrap();
        assert!(!text.contains("\x1b7"));
        // Down one line, back to the start column.
        assert!(text.contains("\x1b[1B\x1b[3D"));
    }

    #[test]
    fn printing_placeholder_abs_updates_tracked_cursor() {
        let (mut term, sink) = sink_terminal();
        let placeholder = ImagePlaceholder::new(0x00000001, 3, 2);
        term.print_placeholder(
            &placeholder,
            &PlaceholderPrint {
                pos: Some((5, 7)),
                ..Default::default()
            },
        )
        .unwrap();
        let text = String::from_utf8(sink.contents()).unwrap();
        assert!(text.contains("\x1b[8;6H")); // first line at row 8, col 6 (1-based)
        assert!(text.contains("\x1b[9;6H"));
        assert_eq!(term.tracked_cursor(), Some((8, 8)));
    }

    #[test]
    fn raw_write_invalidates_tracked_cursor() {
        let (mut term, _sink) = sink_terminal();
        term.assume_cursor_position(3, 4);
        assert_eq!(term.tracked_cursor(), Some((3, 4)));
        term.write(b"hello").unwrap();
        assert_eq!(term.tracked_cursor(), None);
    }

    #[test]
    fn movement_updates_tracked_cursor() {
        let (mut term, sink) = sink_terminal();
        term.assume_cursor_position(10, 10);
        term.move_cursor(CursorMove {
            left: Some(4),
            down: Some(2),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(term.tracked_cursor(), Some((6, 12)));
        let text = String::from_utf8(sink.contents()).unwrap();
        assert_eq!(text, "\x1b[2B\x1b[4D");

        let err = term.move_cursor(CursorMove {
            up: Some(1),
            down: Some(1),
            ..Default::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn margins_and_scroll_invalidate_tracked_cursor() {
        let (mut term, sink) = sink_terminal();
        term.assume_cursor_position(0, 0);
        term.scroll_up(3).unwrap();
        assert_eq!(term.tracked_cursor(), None);
        term.assume_cursor_position(0, 0);
        term.set_margins(1, 10).unwrap();
        assert_eq!(term.tracked_cursor(), None);
        let text = String::from_utf8(sink.contents()).unwrap();
        assert!(text.contains("\x1b[3S"));
        assert!(text.contains("\x1b[2;11r"));
    }

    #[test]
    fn script_mirror_escapes_writes() {
        let (mut term, _sink) = sink_terminal();
        let script = SharedSink::default();
        term.set_script_output(Box::new(script.clone()));
        term.send_command(DeleteCommand::default()).unwrap();
        let line = String::from_utf8(script.contents()).unwrap();
        assert!(line.starts_with("printf '\\033_G"));
        assert!(line.trim_end().ends_with("\\033\\\\'"));
    }
}
