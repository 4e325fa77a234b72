//! Job-description structs handed to `Decoder::create`, `Encoder::create`,
//! and `MuxedOutput::open`/`add_stream` (SPEC_FULL.md "Configuration").
//!
//! Each is a plain struct with a `Default` impl, matching the teacher's
//! `EncodeSpec`/`ClipSpec` style of "one struct describes the whole job"
//! rather than a builder with chained setters.

use ffmpeg_the_third::Rational;

/// Options accepted by `Decoder::create` (spec §4.1).
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// Request a hardware-accelerated decoder; silently falls back to
    /// software if none is available for the stream's codec.
    pub hardware: bool,
    /// If set, every output video frame is stamped with a synthetic,
    /// evenly-spaced PTS at this framerate instead of the decoded PTS.
    pub forced_framerate: Option<Rational>,
    /// If set, hardware-resident frames are transferred into system memory
    /// in this pixel format before being handed to the caller.
    pub sw_transfer_format: Option<ffmpeg_the_third::format::Pixel>,
    /// Override the sample aspect ratio on every output video frame.
    pub sample_aspect_ratio: Option<Rational>,
    /// Continue past non-fatal errors instead of propagating them.
    pub exit_on_error: bool,
    /// Additional codec-open options (`-x264opts`-style key/value pairs).
    pub codec_options: Vec<(String, String)>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        DecoderOptions {
            hardware: false,
            forced_framerate: None,
            sw_transfer_format: None,
            sample_aspect_ratio: None,
            exit_on_error: true,
            codec_options: Vec::new(),
        }
    }
}

/// Options accepted by `Encoder::create` (spec §4.2).
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    pub bit_rate: Option<i64>,
    pub rc_min_rate: Option<i64>,
    pub rc_max_rate: Option<i64>,
    pub rc_buffer_size: Option<i32>,
    pub gop_size: Option<i32>,
    pub max_b_frames: Option<i32>,
    pub codec_options: Vec<(String, String)>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            bit_rate: None,
            rc_min_rate: None,
            rc_max_rate: None,
            rc_buffer_size: None,
            gop_size: None,
            max_b_frames: None,
            codec_options: Vec::new(),
        }
    }
}

pub const DEFAULT_VIDEO_BIT_RATE: i64 = 1_000_000;
pub const DEFAULT_AUDIO_BIT_RATE: i64 = 128_000;

/// Options accepted by `MuxedOutput::open` (spec §4.3).
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Below this many buffered bytes for a not-yet-initialized stream, the
    /// pending packet count is unbounded; above it, `max_muxing_queue_size`
    /// is enforced.
    pub muxing_queue_data_threshold: usize,
    pub max_muxing_queue_size: usize,
    pub exit_on_error: bool,
}

impl Default for MuxOptions {
    fn default() -> Self {
        MuxOptions {
            muxing_queue_data_threshold: 50 * 1024 * 1024,
            max_muxing_queue_size: 128,
            exit_on_error: true,
        }
    }
}

/// Options accepted by `MuxedOutput::add_stream` for a stream-copy source
/// (spec §4.3.1).
#[derive(Debug, Clone, Default)]
pub struct StreamCopyOptions {
    pub copy_initial_nonkeyframes: bool,
    /// See spec §9 Open Questions: only `1` means "always copy regardless of
    /// start-time threshold"; `0` and `-1` both mean "use the threshold".
    pub copy_prior_start: i32,
    pub start_time_us: Option<i64>,
}
