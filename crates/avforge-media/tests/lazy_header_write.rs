//! P4 / E3: the container header must not be written until every registered
//! stream has initialized, and packets buffered while waiting must be
//! flushed to the container in the order they arrived.

use std::sync::{Arc, Mutex};

use avforge_media::encoder::CodecSelector;
use avforge_media::mux::{AddStreamSource, MuxTarget, SourceStreamMeta};
use avforge_media::{Encoder, EncoderOptions, Frame, MuxOptions, MuxedOutput, StreamCopyOptions};
use ffmpeg_the_third as ffmpeg;

fn mpeg4_encoder() -> Arc<Mutex<Encoder>> {
    Arc::new(Mutex::new(
        Encoder::create(CodecSelector::Name("mpeg4".into()), EncoderOptions::default())
            .expect("mpeg4 encoder should be available in a standard ffmpeg build"),
    ))
}

fn video_frame(pts: i64) -> Frame {
    let mut f = ffmpeg::util::frame::video::Video::new(ffmpeg::format::Pixel::YUV420P, 64, 48);
    f.set_pts(Some(pts));
    unsafe {
        (*f.as_mut_ptr()).time_base = ffmpeg::ffi::AVRational { num: 1, den: 25 };
    }
    Frame::Video(f)
}

/// Feeds frames until the encoder yields a packet (also initializing the
/// encoder on the very first call, since `ensure_initialized` runs
/// unconditionally regardless of whether a packet comes out immediately).
fn next_packet(enc: &Arc<Mutex<Encoder>>) -> ffmpeg::Packet {
    for pts in 0..8i64 {
        let packets = enc.lock().unwrap().encode_all(Some(video_frame(pts))).expect("encode_all");
        if let Some(p) = packets.into_iter().next() {
            return p;
        }
    }
    panic!("encoder produced no packet within 8 frames");
}

#[test]
fn header_is_deferred_until_every_stream_initializes() {
    ffmpeg::init().expect("ffmpeg init");

    let enc_a = mpeg4_encoder();
    let enc_b = mpeg4_encoder();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.mkv");

    let mut mux = MuxedOutput::open(
        MuxTarget::Path { path: path.clone(), format_name: Some("matroska".into()) },
        MuxOptions::default(),
        Vec::new(),
    )
    .expect("open mux");

    let idx_a = mux
        .add_stream(
            AddStreamSource::Encoder { encoder: Arc::clone(&enc_a), source_meta: SourceStreamMeta::default() },
            StreamCopyOptions::default(),
        )
        .expect("add stream a");
    let idx_b = mux
        .add_stream(
            AddStreamSource::Encoder { encoder: Arc::clone(&enc_b), source_meta: SourceStreamMeta::default() },
            StreamCopyOptions::default(),
        )
        .expect("add stream b");

    assert!(!mux.header_written());

    let pkt_a = next_packet(&enc_a);
    mux.write_packet(pkt_a, idx_a).expect("buffer stream a's first packet");
    assert!(!mux.header_written(), "header must stay unwritten while stream b has not initialized yet");

    let pkt_b = next_packet(&enc_b);
    mux.write_packet(pkt_b, idx_b).expect("write stream b's first packet");
    assert!(mux.header_written(), "header must be written once every stream has initialized");

    mux.close().expect("close");
    drop(mux);

    let input = ffmpeg::format::input(&path).expect("reopen the muxed file");
    let stream_order: Vec<usize> = input.packets().map(|(s, _)| s.index()).collect();
    assert!(stream_order.len() >= 2, "both buffered packets must have been written");
    assert_eq!(stream_order[0], idx_a, "the packet deferred while waiting for stream b must come first");
    assert_eq!(stream_order[1], idx_b);
}
