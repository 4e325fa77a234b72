//! Helpers for classifying return values from the native codec library's
//! send/receive boundary into the crate's typed error taxonomy (spec §7).
//!
//! Grounded on the `Err(ffmpeg_next::Error::Eof | ffmpeg_next::Error::Exit)`
//! sentinel-matching idiom used throughout the wider retrieval pack's
//! FFmpeg-backed pipelines.

use avforge_core::Error;
use ffmpeg_the_third as ffmpeg;

/// Maps a `ffmpeg_the_third::Error` returned from a send/receive call into
/// this crate's error taxonomy. `operation` names the native call that
/// failed, used only for `NativeError`'s diagnostic message.
pub fn classify(err: ffmpeg::Error, operation: &'static str) -> Error {
    match err {
        ffmpeg::Error::Eof => Error::EndOfStream,
        ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => Error::TryAgain,
        ffmpeg::Error::Other { errno } => Error::native(operation, -errno),
        _ => Error::native(operation, -1),
    }
}

pub fn is_eof(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Eof)
}

pub fn is_try_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}
