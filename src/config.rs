//! The configuration surface.
//!
//! Plain data with serde derives; reading a config file and deciding its
//! format is the caller's business.

use std::path::PathBuf;

use serde::Deserialize;

use crate::command::TransmissionMedium;
use crate::id_space::IDSubspace;
use crate::placeholder::PLACEHOLDER_CHAR;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // Id allocation.
    /// Subspace to allocate ids from, as `"begin:end"` (empty = all).
    pub id_subspace: IDSubspace,
    /// How many id bits live in the foreground color: 0, 8 or 24.
    pub id_color_bits: u8,
    /// Whether the 4th id byte is carried by a third diacritic.
    pub id_use_3rd_diacritic: bool,
    pub max_ids_per_subspace: u64,
    /// Directory for the id database; `None` picks a per-user state dir.
    pub id_database_dir: Option<PathBuf>,

    // Geometry.
    /// Pixels per cell; `None` queries the terminal.
    pub cell_size: Option<(u16, u16)>,
    /// Used when neither the config nor the terminal knows the cell size.
    pub default_cell_size: (u16, u16),
    pub scale: f32,
    /// `None` = terminal height (capped at 256 by the row diacritic).
    pub max_rows: Option<u16>,
    /// `None` = terminal width.
    pub max_cols: Option<u16>,

    // Uploading.
    pub max_command_size: usize,
    /// `None` = detect from `$TMUX`/`$TERM`.
    pub num_tmux_layers: Option<usize>,
    pub reupload_max_uploads_ago: u64,
    pub reupload_max_bytes_ago: u64,
    pub reupload_max_seconds_ago: u64,
    pub force_reupload: bool,
    /// Formats the terminal decodes natively; `None` = guess from the
    /// terminal name.
    pub supported_formats: Option<Vec<String>>,
    /// `None` = direct over ssh, file locally.
    pub upload_method: Option<TransmissionMedium>,
    pub check_response: bool,
    /// Seconds to wait for the upload response when `check_response` is on.
    pub check_response_timeout: f32,
    pub redetect_terminal: bool,
    /// Size cap for direct (inline base64) transmissions.
    pub stream_max_size: u64,
    /// Size cap for file and temp-file transmissions.
    pub file_max_size: u64,

    // Display.
    pub fewer_diacritics: bool,
    pub placeholder_char: char,
    /// Background color behind placeholder cells; `None` leaves the
    /// terminal background alone.
    pub background: Option<(u8, u8, u8)>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            id_subspace: IDSubspace::default(),
            id_color_bits: 24,
            id_use_3rd_diacritic: true,
            max_ids_per_subspace: 1024,
            id_database_dir: None,
            cell_size: None,
            default_cell_size: (8, 16),
            scale: 1.0,
            max_rows: None,
            max_cols: None,
            max_command_size: 4096,
            num_tmux_layers: None,
            reupload_max_uploads_ago: 1024,
            reupload_max_bytes_ago: 20 * 1024 * 1024,
            reupload_max_seconds_ago: 3600,
            force_reupload: false,
            supported_formats: None,
            upload_method: None,
            check_response: false,
            check_response_timeout: 3.0,
            redetect_terminal: true,
            stream_max_size: 1024 * 1024,
            file_max_size: 2 * 1024 * 1024,
            fewer_diacritics: false,
            placeholder_char: PLACEHOLDER_CHAR,
            background: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.id_subspace, IDSubspace::default());
        assert_eq!(config.id_color_bits, 24);
        assert!(config.id_use_3rd_diacritic);
        assert_eq!(config.max_ids_per_subspace, 1024);
        assert_eq!(config.max_command_size, 4096);
        assert_eq!(config.reupload_max_bytes_ago, 20 * 1024 * 1024);
        assert_eq!(config.placeholder_char, '\u{10EEEE}');
    }

    #[test]
    fn deserializes_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "id_subspace": "16:32",
                "id_color_bits": 8,
                "upload_method": "temp-file",
                "max_rows": 20,
                "background": [0, 0, 0]
            }"#,
        )
        .unwrap();
        assert_eq!(config.id_subspace, IDSubspace::new(16, 32).unwrap());
        assert_eq!(config.id_color_bits, 8);
        assert_eq!(config.upload_method, Some(TransmissionMedium::TempFile));
        assert_eq!(config.max_rows, Some(20));
        assert_eq!(config.background, Some((0, 0, 0)));
        assert!(serde_json::from_str::<Config>(r#"{"bogus": 1}"#).is_err());
    }
}
