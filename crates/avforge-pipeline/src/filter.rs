//! The `Filter` stage sitting between a `Decoder` and an `Encoder` (spec
//! §4.6: "zero or more Filters"). The orchestration layer itself doesn't
//! specify filter graph semantics (that's the native library's filtergraph,
//! out of scope per spec §1 Non-goals) — this trait is the seam a caller
//! plugs a concrete filter implementation into.

use avforge_core::Result;
use avforge_media::Frame;

pub trait Filter: Send {
    /// Processes one frame, producing zero or more output frames (a filter
    /// may buffer internally, e.g. a frame-rate converter).
    fn process(&mut self, frame: Frame) -> Result<Vec<Frame>>;

    /// Drains any frames buffered internally once the upstream stage closes.
    fn flush(&mut self) -> Result<Vec<Frame>> {
        Ok(Vec::new())
    }
}

/// The identity filter: every frame passes through unchanged. Used as the
/// default when a `StreamPipeline` has no filtering requirement.
pub struct Passthrough;

impl Filter for Passthrough {
    fn process(&mut self, frame: Frame) -> Result<Vec<Frame>> {
        Ok(vec![frame])
    }
}
