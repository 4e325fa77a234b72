//! P10: `Pipeline::stop()` must unblock every in-flight stage cooperatively,
//! and `wait()` must resolve without error instead of running the source to
//! completion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use avforge_core::Result;
use avforge_media::encoder::CodecSelector;
use avforge_media::mux::{AddStreamSource, MuxTarget, SourceStreamMeta};
use avforge_media::{Decoder, DecoderOptions, Encoder, EncoderOptions, Frame, MuxOptions, MuxedOutput, StreamCopyOptions};
use avforge_pipeline::{Passthrough, PipelineBuilder, StreamPipeline};
use ffmpeg_the_third as ffmpeg;
use ffmpeg_the_third::Packet;

fn video_frame(pts: i64) -> Frame {
    let mut f = ffmpeg::util::frame::video::Video::new(ffmpeg::format::Pixel::YUV420P, 64, 48);
    f.set_pts(Some(pts));
    unsafe {
        (*f.as_mut_ptr()).time_base = ffmpeg::ffi::AVRational { num: 1, den: 25 };
    }
    Frame::Video(f)
}

/// A long run of real encoded packets for a single elementary stream, plus
/// the codec parameters needed to open a matching `Decoder` for them.
fn encoded_source(frame_count: i64) -> (ffmpeg::codec::Parameters, ffmpeg::Rational, Vec<Packet>) {
    let mut encoder = Encoder::create(CodecSelector::Name("mpeg4".into()), EncoderOptions::default())
        .expect("mpeg4 encoder should be available in a standard ffmpeg build");

    let mut packets = Vec::new();
    for pts in 0..frame_count {
        packets.extend(encoder.encode_all(Some(video_frame(pts))).expect("encode_all"));
    }
    packets.extend(encoder.flush().expect("flush"));

    for p in &mut packets {
        p.set_stream(0);
    }

    let params = encoder.parameters().expect("encoder initialized after the first frame");
    let time_base = ffmpeg::Rational::new(encoder.time_base().unwrap().num() as i32, encoder.time_base().unwrap().den() as i32);
    (params, time_base, packets)
}

/// Sleeps before yielding each item, so a pipeline driven by this source
/// takes far longer to drain than the cancellation window below unless
/// `stop()` actually cuts it short.
struct Throttled<I> {
    inner: I,
    delay: Duration,
}

impl<I: Iterator> Iterator for Throttled<I> {
    type Item = I::Item;
    fn next(&mut self) -> Option<Self::Item> {
        std::thread::sleep(self.delay);
        self.inner.next()
    }
}

#[test]
fn stop_unblocks_a_pipeline_before_its_source_is_exhausted() {
    ffmpeg::init().expect("ffmpeg init");

    const TOTAL_FRAMES: i64 = 1000;

    let (params, time_base, packets) = encoded_source(TOTAL_FRAMES);
    let decoder = Decoder::create(params, 0, time_base, None, DecoderOptions::default()).expect("open decoder");

    let packets: Vec<Result<Packet>> = packets.into_iter().map(Ok).collect();
    let source = Throttled { inner: packets.into_iter(), delay: Duration::from_millis(15) };

    let out_encoder = Arc::new(Mutex::new(
        Encoder::create(CodecSelector::Name("mpeg4".into()), EncoderOptions::default()).expect("output encoder"),
    ));

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.mkv");
    let mut mux = MuxedOutput::open(
        MuxTarget::Path { path, format_name: Some("matroska".into()) },
        MuxOptions::default(),
        Vec::new(),
    )
    .expect("open mux");
    let mux_index = mux
        .add_stream(
            AddStreamSource::Encoder { encoder: Arc::clone(&out_encoder), source_meta: SourceStreamMeta::default() },
            StreamCopyOptions::default(),
        )
        .expect("add output stream");

    let stream = StreamPipeline::new(source.into_iter(), decoder, out_encoder)
        .with_filters(vec![Box::new(Passthrough)])
        .for_mux_stream(mux_index);

    let pipeline = PipelineBuilder::new(mux).packet_queue_bound(2).add_stream(stream).build();

    // At 15ms/packet, draining all 1000 packets would take ~15s. Let only a
    // handful flow before cancelling.
    std::thread::sleep(Duration::from_millis(100));
    pipeline.stop();

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(pipeline.wait());
    });

    // A cooperatively cancelled pipeline should resolve in well under a
    // second; 5s leaves generous scheduling slack while still failing loudly
    // (rather than hanging for ~15s) if `stop()` stopped doing its job.
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pipeline.wait() must resolve promptly after stop(), not run the whole source to completion");
    result.expect("a cooperatively cancelled pipeline should shut down without surfacing an error");
}
