//! Bounded-queue scheduler composing Decoder → Filter → Encoder stages into
//! a cooperative pipeline (spec §4.6).

pub mod filter;
pub mod scheduler;

pub use filter::{Filter, Passthrough};
pub use scheduler::{Pipeline, PipelineBuilder, StreamPipeline};
