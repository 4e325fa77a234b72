//! Routes packets from a single demuxer to the per-stream channels each
//! `StreamPipeline` consumes as its `PacketSource` (spec §2: the source
//! feeding a `Decoder` is an external collaborator with no further contract
//! than "yields packets belonging to one stream").
//!
//! Grounded on the teacher's own pattern of opening a second `Input` context
//! dedicated to one concern while another context already holds stream
//! parameters (`velocut-media::decode::LiveDecoder::open`'s "Second context
//! for decoder params (avoids borrow conflict)") — here the first context
//! (in `main.rs`) is used only to read stream metadata before building the
//! pipeline, and this dispatcher opens its own for the actual demux loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::input;
use tracing::warn;

const CHANNEL_BOUND: usize = 64;

pub struct Dispatcher {
    path: PathBuf,
    duration_limit: Option<f64>,
    senders: HashMap<usize, Sender<ffmpeg::Packet>>,
}

impl Dispatcher {
    pub fn new(path: PathBuf, duration_limit: Option<f64>) -> Self {
        Dispatcher { path, duration_limit, senders: HashMap::new() }
    }

    /// Registers interest in `stream_index`, returning the iterator its
    /// `StreamPipeline` pulls packets from.
    pub fn register(
        &mut self,
        stream_index: usize,
    ) -> impl Iterator<Item = avforge_core::Result<ffmpeg::Packet>> + Send + 'static {
        let (tx, rx) = crossbeam_channel::bounded(CHANNEL_BOUND);
        self.senders.insert(stream_index, tx);
        rx.into_iter().map(Ok)
    }

    /// Spawns the demux thread, which owns the dispatcher from here on.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        thread::spawn(move || {
            let mut ictx = input(&self.path)
                .with_context(|| format!("reopening '{}' for demuxing", self.path.display()))?;

            for (stream, packet) in ictx.packets().flatten() {
                let index = stream.index();
                let Some(sender) = self.senders.get(&index) else { continue };

                if let Some(limit) = self.duration_limit {
                    if let Some(pts) = packet.pts() {
                        let tb = stream.time_base();
                        let seconds = pts as f64 * tb.numerator() as f64 / tb.denominator() as f64;
                        if seconds > limit {
                            break;
                        }
                    }
                }

                if let Err(e) = sender.send(packet) {
                    warn!(stream = index, error = %e, "stream pipeline gone, dropping packet");
                }
            }

            Ok(())
        })
    }
}
