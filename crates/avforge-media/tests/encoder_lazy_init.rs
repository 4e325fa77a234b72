//! P9: an `Encoder` derives its codec context (time base, dimensions) from
//! the first frame it sees and opens the native codec exactly once.

use avforge_media::encoder::CodecSelector;
use avforge_media::{Encoder, EncoderOptions, Frame};
use ffmpeg_the_third as ffmpeg;

fn video_frame(pts: i64, width: u32, height: u32, fps_den: i32) -> Frame {
    let mut f = ffmpeg::util::frame::video::Video::new(ffmpeg::format::Pixel::YUV420P, width, height);
    f.set_pts(Some(pts));
    unsafe {
        (*f.as_mut_ptr()).time_base = ffmpeg::ffi::AVRational { num: 1, den: fps_den };
    }
    Frame::Video(f)
}

#[test]
fn first_frame_derives_time_base_and_dimensions_and_opens_once() {
    ffmpeg::init().expect("ffmpeg init");

    let mut encoder = Encoder::create(CodecSelector::Name("mpeg4".into()), EncoderOptions::default())
        .expect("mpeg4 encoder should be available in a standard ffmpeg build");
    assert!(!encoder.is_initialized());
    assert!(encoder.time_base().is_err(), "time base unavailable before the first frame");
    assert!(encoder.parameters().is_err(), "parameters unavailable before the first frame");

    encoder
        .encode_all(Some(video_frame(0, 1920, 1080, 30)))
        .expect("first frame should initialize and open the encoder");
    assert!(encoder.is_initialized());

    let time_base = encoder.time_base().expect("time base available once initialized");
    assert_eq!((time_base.num(), time_base.den()), (1, 30));

    let params = encoder.parameters().expect("parameters available once initialized");
    assert_eq!(params.id(), ffmpeg::codec::Id::MPEG4);
    unsafe {
        assert_eq!((*params.as_ptr()).width, 1920);
        assert_eq!((*params.as_ptr()).height, 1080);
    }

    // A second frame must not reopen the codec or re-derive parameters.
    encoder
        .encode_all(Some(video_frame(1, 1920, 1080, 30)))
        .expect("second frame should be encoded against the already-open codec");
    let time_base_after = encoder.time_base().expect("still initialized");
    assert_eq!((time_base_after.num(), time_base_after.den()), (1, 30), "time base stays pinned to the first frame's");
}
