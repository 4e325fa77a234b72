//! `avforge` — the example command-line driver (spec §6: "the CLI is out of
//! scope; implementers may reimplement any subset").
//!
//! Opens `input`, builds one `StreamPipeline` per best video/audio stream,
//! transcodes through `avforge-media`/`avforge-pipeline`, and muxes into
//! `output`. `--segment`/`--frag` are accepted for surface compatibility but
//! left unimplemented: container fragmentation and box layout are explicit
//! non-goals of the orchestration layer this binary drives.

mod demux;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use avforge_media::encoder::CodecSelector;
use avforge_media::mux::{AddStreamSource, MuxTarget, SourceStreamMeta};
use avforge_media::{Decoder, DecoderOptions, Encoder, EncoderOptions, MuxOptions, MuxedOutput};
use avforge_pipeline::{PipelineBuilder, StreamPipeline};
use clap::Parser;
use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::input;
use ffmpeg::media::Type as MediaType;
use tracing::{info, warn};

use crate::demux::Dispatcher;

/// Transcode `input` to `output` through the avforge pipeline.
#[derive(Parser, Debug)]
#[command(name = "avforge", author, version, about, long_about = None)]
struct Args {
    /// Source media file.
    input: PathBuf,
    /// Destination media file.
    output: PathBuf,

    /// Stop after this many seconds of source content.
    #[arg(long, value_name = "SEC")]
    duration: Option<f64>,

    /// Segment length for fragmented output. Unimplemented: box layout is
    /// out of scope for this orchestration layer.
    #[arg(long, value_name = "SEC")]
    segment: Option<f64>,

    /// Bounded-queue capacity for the sink edge (spec §4.6).
    #[arg(long, value_name = "N")]
    window_size: Option<usize>,

    /// Target bit rate in bits/sec, applied to every encoded stream.
    #[arg(long, value_name = "RATE")]
    bitrate: Option<i64>,

    /// Encoder preset hint, passed through as a codec-open option.
    #[arg(long, value_name = "NAME")]
    preset: Option<String>,

    /// Comma-separated encoder names in stream order, e.g. "libx264,aac".
    /// Defaults to re-encoding with the source codec of each stream.
    #[arg(long, value_name = "LIST")]
    codecs: Option<String>,

    /// Fragment duration in microseconds. Unimplemented for the same reason
    /// as `--segment`.
    #[arg(long, value_name = "USEC")]
    frag: Option<i64>,

    /// Request hardware-accelerated decoding where available.
    #[arg(long)]
    hw: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    ffmpeg::init().context("FFmpeg init failed")?;

    if args.segment.is_some() || args.frag.is_some() {
        warn!("--segment/--frag accepted but not implemented; writing a single unfragmented output");
    }

    run(args)
}

struct PlannedStream {
    stream_index: usize,
    media_type: MediaType,
    parameters: ffmpeg::codec::Parameters,
    time_base: ffmpeg::Rational,
    avg_frame_rate: Option<ffmpeg::Rational>,
    duration: Option<i64>,
    metadata: Vec<(String, String)>,
}

fn run(args: Args) -> Result<()> {
    let probe = input(&args.input).with_context(|| format!("opening '{}'", args.input.display()))?;

    let mut planned = Vec::new();
    for media_type in [MediaType::Video, MediaType::Audio] {
        let Some(stream) = probe.streams().best(media_type) else { continue };
        planned.push(PlannedStream {
            stream_index: stream.index(),
            media_type,
            parameters: stream.parameters(),
            time_base: stream.time_base(),
            avg_frame_rate: Some(stream.avg_frame_rate()).filter(|r| r.numerator() != 0),
            duration: Some(stream.duration()).filter(|d| *d > 0),
            metadata: stream.metadata().iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        });
    }

    if planned.is_empty() {
        bail!("no video or audio stream found in '{}'", args.input.display());
    }

    let upstream_metadata: Vec<(String, String)> =
        probe.metadata().iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    drop(probe);

    let codec_names: Vec<String> = args
        .codecs
        .as_deref()
        .map(|s| s.split(',').map(|n| n.trim().to_string()).collect())
        .unwrap_or_default();

    let mut mux = MuxedOutput::open(
        MuxTarget::Path { path: args.output.clone(), format_name: None },
        MuxOptions::default(),
        upstream_metadata,
    )
    .with_context(|| format!("opening '{}' for writing", args.output.display()))?;

    let mut dispatcher = Dispatcher::new(args.input.clone(), args.duration);
    let mut stream_pipelines = Vec::new();

    for (i, plan) in planned.into_iter().enumerate() {
        let decoder = Decoder::create(
            plan.parameters.clone(),
            plan.stream_index,
            plan.time_base,
            plan.avg_frame_rate,
            DecoderOptions { hardware: args.hw, ..Default::default() },
        )
        .with_context(|| format!("opening decoder for stream {}", plan.stream_index))?;

        let selector = match codec_names.get(i) {
            Some(name) => CodecSelector::Name(name.clone()),
            None => CodecSelector::Id(plan.parameters.id()),
        };

        let mut encoder_options = EncoderOptions { bit_rate: args.bitrate, ..Default::default() };
        if let Some(preset) = &args.preset {
            encoder_options.codec_options.push(("preset".to_string(), preset.clone()));
        }

        let encoder = Encoder::create(selector, encoder_options)
            .with_context(|| format!("opening encoder for stream {}", plan.stream_index))?;
        let encoder = Arc::new(Mutex::new(encoder));

        let source_meta = SourceStreamMeta {
            metadata: plan.metadata,
            disposition: 0,
            duration_hint: plan.duration,
        };
        let out_index = mux
            .add_stream(AddStreamSource::Encoder { encoder: Arc::clone(&encoder), source_meta }, Default::default())
            .context("registering output stream")?;

        let source = dispatcher.register(plan.stream_index);
        let pipeline = StreamPipeline::new(source, decoder, encoder).for_mux_stream(out_index);
        stream_pipelines.push(pipeline);

        info!(stream = plan.stream_index, ?plan.media_type, out_index, "stream registered");
    }

    let demux_handle = dispatcher.spawn();

    let mut builder = PipelineBuilder::new(mux);
    if let Some(window) = args.window_size {
        builder = builder.packet_queue_bound(window);
    }
    for pipeline in stream_pipelines {
        builder = builder.add_stream(pipeline);
    }

    let pipeline = builder.build();
    let result = pipeline.wait();

    if let Err(e) = demux_handle.join().expect("demux thread panicked") {
        warn!(error = ?e, "demuxer ended with an error");
    }

    result.context("pipeline failed")?;
    info!(output = %args.output.display(), "done");
    Ok(())
}
