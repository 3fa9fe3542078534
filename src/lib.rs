//! # Inline images for kitty-protocol terminals
//!
//! kittypix does three things:
//!
//! 1. **Transmits image data to the terminal** over the [kitty graphics
//!    protocol]: `ESC _ G key=value,… ; payload ESC \` envelopes, with large
//!    payloads split into chunks and everything optionally wrapped in tmux
//!    passthrough sequences when multiplexers sit between us and the
//!    terminal.
//!
//! 2. **Addresses images through persistent 32-bit ids.** An id is encoded
//!    into placeholder cells via the foreground color and Unicode combining
//!    marks, which partitions the id space into five disjoint classes
//!    ([`IDSpace`]) that can be further restricted to byte ranges
//!    ([`IDSubspace`]). The [`IDManager`] keeps the description → id mapping
//!    in SQLite so that the same image resolves to the same id across
//!    processes, recycling old ids under LRU pressure, and remembers what
//!    was uploaded to which terminal.
//!
//! 3. **Paints placeholder rectangles.** A virtual placement appears where
//!    a grid of [`ImagePlaceholder`] cells is printed; the
//!    [`GraphicsTerminal`] handles cursor tracking, clipping at the screen
//!    edges and scrolling at the bottom.
//!
//! # Quick start
//!
//! ```no_run
//! use kittypix::{Config, DisplayOptions, Session};
//!
//! fn main() -> kittypix::Result<()> {
//!     let mut session = Session::new(Config::default())?;
//!     session.upload_and_display("tux.png".into(), &DisplayOptions::default())?;
//!     Ok(())
//! }
//! ```
//!
//! The lower layers are usable on their own: [`GraphicsTerminal`] for
//! sending hand-built [`GraphicsCommand`]s, [`IDManager`] for id
//! bookkeeping without a tty.
//!
//! [kitty graphics protocol]: https://sw.kovidgoyal.net/kitty/graphics-protocol/

pub mod command;
pub mod config;
pub mod errors;
pub mod id_manager;
pub mod id_space;
pub mod placeholder;
#[cfg(unix)]
pub mod session;
#[cfg(unix)]
pub mod terminal;

pub use command::{
    DeleteCommand, Format, GraphicsCommand, PlacementData, PutCommand, Quietness,
    TransmissionMedium, TransmitCommand, WhatToDelete,
};
pub use config::Config;
pub use errors::{Errors, Result};
pub use id_manager::{IDInfo, IDManager, UploadInfo};
pub use id_space::{IDSpace, IDSubspace};
pub use placeholder::{
    DiacriticLevel, ImagePlaceholder, ImagePlaceholderMode, PLACEHOLDER_CHAR,
    ROWCOLUMN_DIACRITICS, optimal_cols_and_rows,
};
#[cfg(unix)]
pub use session::{DisplayOptions, FinalCursorPos, ImageInstance, ImageSource, Session};
#[cfg(unix)]
pub use terminal::{CursorMove, GraphicsResponse, GraphicsTerminal, PlaceholderPrint};
