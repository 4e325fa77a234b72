//! FFmpeg-backed wrapper layer: `Decoder`, `Encoder`, `AudioFrameBuffer`,
//! `SyncQueue`, and `MuxedOutput` (spec §4).

pub mod audio_buffer;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod mux;
pub mod native;
pub mod options;
pub mod stream_copy;
pub mod sync_queue;

pub use audio_buffer::AudioFrameBuffer;
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use frame::Frame;
pub use mux::MuxedOutput;
pub use options::{DecoderOptions, EncoderOptions, MuxOptions, StreamCopyOptions};
pub use sync_queue::SyncQueue;
