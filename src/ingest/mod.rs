//! Upload intake: storage layout, validation and normalization.

mod converter;
mod file_handler;
mod media_ingest;

pub use converter::{AudioConverter, FfmpegConverter, MP3_BITRATE_KBPS, PASSTHROUGH_CEILING_DB};
pub use file_handler::{sanitize_filename, FileHandler, FileHandlerError};
pub use media_ingest::{
    is_supported_extension, IngestError, IngestLimits, MediaIngest, NormalizedAudio, UploadRole,
    SUPPORTED_EXTENSIONS,
};

pub(crate) use converter::{db_to_linear, export_codec_args};
