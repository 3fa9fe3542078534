#[derive(Debug, thiserror::Error)]
pub enum Errors {
    #[error("Invalid id subspace: {0}")]
    InvalidSubspace(String),
    #[error("Invalid id space: color_bits={0}, use_3rd_diacritic={1}")]
    InvalidIdSpace(u8, bool),
    #[error("Id {0:#010x} does not belong to any id space")]
    UnknownIdSpace(u32),
    #[error("Id {0:#010x} is not allocated")]
    UnknownId(u32),
    #[error("No free id left in {space} {subspace}")]
    SubspaceExhausted {
        space: &'static str,
        subspace: String,
    },
    #[error("Conflicting arguments: {0}")]
    ConflictingArguments(&'static str),
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("No response to the cursor position query")]
    CursorResponseTimeout,
    #[error("Could not detect the terminal size")]
    NoTerminalSize,
    #[error("No tty to read the response from")]
    NoTty,
    #[error("Terminal error: {0}")]
    Terminal(String),
    #[error("File {path} does not exist or was modified since its id was assigned")]
    AssetChanged { path: String },
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::error::ImageError),
}

#[cfg(not(windows))]
impl From<rustix::io::Errno> for Errors {
    fn from(errno: rustix::io::Errno) -> Self {
        Errors::Io(std::io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, Errors>;
