//! Frame → packet state machine (spec §4.2).
//!
//! Unlike `Decoder`, an `Encoder` is allocated but not opened at `create`
//! time — its parameters (resolution, sample format, time base) are derived
//! from the first frame it receives, because the native library requires
//! those to be fixed before `avcodec_open2`.

use avforge_core::{Error, Rational as R, Result, Rounding, TimebaseMath};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::media::Type as MediaType;
use ffmpeg::Rational;
use tracing::{debug, warn};

use crate::audio_buffer::AudioFrameBuffer;
use crate::frame::Frame;
use crate::native::classify;
use crate::options::{EncoderOptions, DEFAULT_AUDIO_BIT_RATE, DEFAULT_VIDEO_BIT_RATE};

fn to_r(r: Rational) -> R {
    R::new(r.numerator() as i64, r.denominator() as i64)
}

fn to_ffmpeg_r(r: R) -> Rational {
    Rational::new(r.num() as i32, r.den() as i32)
}

/// Codec selector accepted by `Encoder::create` — id, name, or an already
/// resolved `Codec` object (spec §4.2).
pub enum CodecSelector {
    Id(ffmpeg::codec::Id),
    Name(String),
    Codec(ffmpeg::Codec),
}

/// Hints carried over from a bound Decoder, applied during first-frame
/// initialization (spec §4.2 step 1–2).
#[derive(Default, Clone, Copy)]
pub struct DecoderHint {
    pub bits_per_raw_sample: Option<i32>,
    pub framerate: Option<R>,
}

enum Native {
    Video(ffmpeg::encoder::video::Video),
    Audio(ffmpeg::encoder::audio::Audio),
}

enum State {
    Deferred,
    Ready {
        native: Native,
        time_base: R,
        audio_buffer: Option<AudioFrameBuffer>,
    },
}

pub struct Encoder {
    codec: ffmpeg::Codec,
    media_type: MediaType,
    options: EncoderOptions,
    bit_rate: i64,
    hint: DecoderHint,
    state: State,
    flushed: bool,
}

impl Encoder {
    /// `create(codec_selector, options)` (spec §4.2). Allocates but does not
    /// open the codec; rate-control and GOP settings are recorded now and
    /// applied to the codec context once it exists.
    pub fn create(selector: CodecSelector, options: EncoderOptions) -> Result<Self> {
        let codec = match selector {
            CodecSelector::Id(id) => ffmpeg::encoder::find(id),
            CodecSelector::Name(name) => ffmpeg::encoder::find_by_name(&name),
            CodecSelector::Codec(c) => Some(c),
        }
        .ok_or_else(|| Error::NotFound("no such encoder".into()))?;

        let media_type = codec.medium();
        if media_type != MediaType::Video && media_type != MediaType::Audio {
            return Err(Error::invalid_argument("encoder codec must be video or audio"));
        }

        let bit_rate = options.bit_rate.unwrap_or(if media_type == MediaType::Video {
            DEFAULT_VIDEO_BIT_RATE
        } else {
            DEFAULT_AUDIO_BIT_RATE
        });

        Ok(Encoder {
            codec,
            media_type,
            options,
            bit_rate,
            hint: DecoderHint::default(),
            state: State::Deferred,
            flushed: false,
        })
    }

    /// Attaches hints from an upstream Decoder, consumed at first-frame
    /// initialization (spec §4.2 step 1–2). No-op once the encoder is open.
    pub fn bind_decoder_hint(&mut self, hint: DecoderHint) {
        if matches!(self.state, State::Deferred) {
            self.hint = hint;
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Ready { .. })
    }

    /// `parameters()` — codec parameters pulled from the (initialized)
    /// native context, for `MuxedOutput::add_stream`/header-write gating.
    pub fn parameters(&self) -> Result<ffmpeg::codec::Parameters> {
        match &self.state {
            State::Deferred => Err(Error::pipeline_state("encoder not yet initialized from a first frame")),
            State::Ready { native, .. } => {
                let mut params = ffmpeg::codec::Parameters::new();
                let ctx_ptr = match native {
                    Native::Video(v) => v.as_ptr() as *mut ffi::AVCodecContext,
                    Native::Audio(a) => a.as_ptr() as *mut ffi::AVCodecContext,
                };
                unsafe {
                    let ret = ffi::avcodec_parameters_from_context(params.as_mut_ptr(), ctx_ptr);
                    if ret < 0 {
                        return Err(Error::native("avcodec_parameters_from_context", ret));
                    }
                }
                Ok(params)
            }
        }
    }

    pub fn time_base(&self) -> Result<R> {
        match &self.state {
            State::Deferred => Err(Error::pipeline_state("encoder not yet initialized")),
            State::Ready { time_base, .. } => Ok(*time_base),
        }
    }

    fn ensure_initialized(&mut self, frame: &Frame) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        match frame {
            Frame::Video(f) => self.init_video(f),
            Frame::Audio(f) => self.init_audio(f),
        }
    }

    fn apply_rate_control(ctx_ptr: *mut ffi::AVCodecContext, bit_rate: i64, opts: &EncoderOptions) {
        unsafe {
            (*ctx_ptr).bit_rate = bit_rate;
            if let Some(v) = opts.rc_min_rate {
                (*ctx_ptr).rc_min_rate = v;
            }
            if let Some(v) = opts.rc_max_rate {
                (*ctx_ptr).rc_max_rate = v;
            }
            if let Some(v) = opts.rc_buffer_size {
                (*ctx_ptr).rc_buffer_size = v;
            }
            if let Some(v) = opts.gop_size {
                (*ctx_ptr).gop_size = v;
            }
            if let Some(v) = opts.max_b_frames {
                (*ctx_ptr).max_b_frames = v;
            }
        }
    }

    fn init_video(&mut self, frame: &ffmpeg::util::frame::video::Video) -> Result<()> {
        // spec §4.2 step 2: prefer a filter-supplied hint, else the decoder's
        // own framerate, else leave unset (falls back to the frame's time
        // base for the encoder's own time base below).
        let framerate = self.hint.framerate;
        let time_base = match framerate {
            Some(fr) if fr.num() > 0 => fr.inv(),
            _ => to_r(unsafe { (*frame.as_ptr()).time_base }),
        };

        let ctx = ffmpeg::codec::context::Context::new_with_codec(self.codec);
        let mut enc = ctx
            .encoder()
            .video()
            .map_err(|e| classify(e, "avcodec_alloc_context3"))?;

        enc.set_width(frame.width());
        enc.set_height(frame.height());
        enc.set_format(frame.format());
        enc.set_time_base(to_ffmpeg_r(time_base));
        if let Some(fr) = framerate.filter(|fr| fr.num() > 0) {
            enc.set_frame_rate(Some(to_ffmpeg_r(fr)));
        }
        enc.set_aspect_ratio(frame.aspect_ratio());

        unsafe {
            let raw = enc.as_mut_ptr();
            (*raw).color_primaries = (*frame.as_ptr()).color_primaries;
            (*raw).color_range = (*frame.as_ptr()).color_range;
            (*raw).color_trc = (*frame.as_ptr()).color_trc;
            (*raw).colorspace = (*frame.as_ptr()).colorspace;
            if (*raw).chroma_sample_location == ffi::AVChromaLocation::AVCHROMA_LOC_UNSPECIFIED {
                (*raw).chroma_sample_location = (*frame.as_ptr()).chroma_location;
            }
            if let Some(bprs) = self.hint.bits_per_raw_sample {
                (*raw).bits_per_raw_sample = bprs;
            }
            Self::apply_rate_control(raw, self.bit_rate, &self.options);
        }

        self.wire_hardware_video(&mut enc, frame);

        unsafe {
            let raw = enc.as_mut_ptr();
            // spec §4.2 step 5: always enable the flag indicating frame
            // duration is meaningful.
            (*raw).flags |= ffi::AV_CODEC_FLAG_FRAME_DURATION as i32;
            if codec_has_reordered_opaque(self.codec) {
                (*raw).flags |= ffi::AV_CODEC_FLAG_COPY_OPAQUE as i32;
            }
        }

        let mut dict = ffmpeg::Dictionary::new();
        for (k, v) in &self.options.codec_options {
            dict.set(k, v);
        }

        let opened = enc
            .open_as_with(self.codec, dict)
            .map_err(|e| classify(e, "avcodec_open2"))?;

        debug!(width = frame.width(), height = frame.height(), time_base = %time_base, "video encoder initialized from first frame");

        self.state = State::Ready {
            native: Native::Video(opened),
            time_base,
            audio_buffer: None,
        };
        Ok(())
    }

    fn wire_hardware_video(&self, enc: &mut ffmpeg::encoder::video::Video, frame: &ffmpeg::util::frame::video::Video) {
        let hw_frames_ctx = unsafe { (*frame.as_ptr()).hw_frames_ctx };
        if hw_frames_ctx.is_null() {
            return; // software encoding
        }

        let encoder_pix_fmt = frame.format();
        let frames_ctx_pix_fmt = unsafe {
            let hwfc = (*hw_frames_ctx).data as *mut ffi::AVHWFramesContext;
            (*hwfc).format
        };

        unsafe {
            let raw = enc.as_mut_ptr();
            if frames_ctx_pix_fmt != encoder_pix_fmt {
                let hwfc = (*hw_frames_ctx).data as *mut ffi::AVHWFramesContext;
                (*raw).hw_device_ctx = ffi::av_buffer_ref((*hwfc).device_ref);
                (*raw).hw_frames_ctx = std::ptr::null_mut();
                return;
            }

            let mut index = 0;
            loop {
                let config = ffi::avcodec_get_hw_config(self.codec.as_ptr(), index);
                if config.is_null() {
                    break;
                }
                let cfg = &*config;
                if cfg.methods & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_FRAMES_CTX as i32 != 0
                    && (cfg.pix_fmt == ffi::AVPixelFormat::AV_PIX_FMT_NONE || cfg.pix_fmt as i32 == encoder_pix_fmt as i32)
                {
                    (*raw).hw_frames_ctx = ffi::av_buffer_ref(hw_frames_ctx);
                    return;
                }
                index += 1;
            }

            index = 0;
            loop {
                let config = ffi::avcodec_get_hw_config(self.codec.as_ptr(), index);
                if config.is_null() {
                    break;
                }
                let cfg = &*config;
                if cfg.methods & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32 != 0 {
                    let hwfc = (*hw_frames_ctx).data as *mut ffi::AVHWFramesContext;
                    (*raw).hw_device_ctx = ffi::av_buffer_ref((*hwfc).device_ref);
                    return;
                }
                index += 1;
            }

            (*raw).hw_frames_ctx = std::ptr::null_mut();
            (*raw).hw_device_ctx = std::ptr::null_mut();
        }
    }

    fn init_audio(&mut self, frame: &ffmpeg::util::frame::audio::Audio) -> Result<()> {
        let time_base = to_r(unsafe { (*frame.as_ptr()).time_base });
        let time_base = if time_base.num() == 0 { R::new(1, frame.rate() as i64) } else { time_base };

        let ctx = ffmpeg::codec::context::Context::new_with_codec(self.codec);
        let mut enc = ctx
            .encoder()
            .audio()
            .map_err(|e| classify(e, "avcodec_alloc_context3"))?;

        enc.set_rate(frame.rate() as i32);
        enc.set_format(frame.format());
        enc.set_ch_layout(frame.ch_layout());
        enc.set_time_base(to_ffmpeg_r(time_base));

        unsafe {
            let raw = enc.as_mut_ptr();
            if let Some(bprs) = self.hint.bits_per_raw_sample {
                (*raw).bits_per_raw_sample = bprs;
            }
            Self::apply_rate_control(raw, self.bit_rate, &self.options);
            // spec §4.2 step 5: always enable the flag indicating frame
            // duration is meaningful.
            (*raw).flags |= ffi::AV_CODEC_FLAG_FRAME_DURATION as i32;
            if codec_has_reordered_opaque(self.codec) {
                (*raw).flags |= ffi::AV_CODEC_FLAG_COPY_OPAQUE as i32;
            }
        }

        let mut dict = ffmpeg::Dictionary::new();
        for (k, v) in &self.options.codec_options {
            dict.set(k, v);
        }

        let opened = enc
            .open_as_with(self.codec, dict)
            .map_err(|e| classify(e, "avcodec_open2"))?;

        let required_frame_size = opened.frame_size();
        let audio_buffer = if required_frame_size > 0 {
            Some(AudioFrameBuffer::create(
                required_frame_size as usize,
                frame.format(),
                frame.rate(),
                frame.ch_layout().into(),
                frame.ch_layout().channels() as u16,
            )?)
        } else {
            None
        };

        debug!(rate = frame.rate(), frame_size = required_frame_size, "audio encoder initialized from first frame");

        self.state = State::Ready {
            native: Native::Audio(opened),
            time_base,
            audio_buffer,
        };
        Ok(())
    }

    /// Per-frame pre-encoding adjustment (spec §4.2): rescale PTS/duration
    /// into the encoder's time base and overwrite `frame.time_base`.
    fn adjust_frame(&self, mut frame: Frame, time_base: R) -> Result<Frame> {
        let src_tb = frame.time_base();
        let src_tb_r = if to_r(src_tb).num() == 0 { time_base } else { to_r(src_tb) };

        let duration = if frame.duration() > 0 {
            TimebaseMath::rescale(frame.duration(), src_tb_r, time_base, Rounding::Nearest)
        } else {
            1
        };

        if let Some(pts) = frame.pts() {
            let rescaled = TimebaseMath::rescale(pts, src_tb_r, time_base, Rounding::Nearest);
            frame.set_pts(Some(rescaled));
        }
        frame.set_time_base(to_ffmpeg_r(time_base));
        frame.set_duration(duration);

        if let Frame::Audio(ref f) = frame {
            if let State::Ready { native: Native::Audio(enc), .. } = &self.state {
                let can_change = codec_supports_param_change(self.codec);
                if !can_change && f.ch_layout().channels() != enc.ch_layout().channels() {
                    return Err(Error::invalid_argument(
                        "audio frame channel count differs from encoder and codec cannot change parameters",
                    ));
                }
            }
        }

        Ok(frame)
    }

    fn send_native(&mut self, frame: Option<&Frame>) -> std::result::Result<(), ffmpeg::Error> {
        let native = match &mut self.state {
            State::Ready { native, .. } => native,
            State::Deferred => unreachable!("send_native called before initialization"),
        };
        match (native, frame) {
            (Native::Video(e), Some(Frame::Video(f))) => e.send_frame(f),
            (Native::Video(e), None) => e.send_eof(),
            (Native::Audio(e), Some(Frame::Audio(f))) => e.send_frame(f),
            (Native::Audio(e), None) => e.send_eof(),
            _ => panic!("frame kind does not match encoder kind"),
        }
    }

    fn receive_native(&mut self) -> std::result::Result<ffmpeg::Packet, ffmpeg::Error> {
        let native = match &mut self.state {
            State::Ready { native, .. } => native,
            State::Deferred => unreachable!("receive_native called before initialization"),
        };
        let mut pkt = ffmpeg::Packet::empty();
        match native {
            Native::Video(e) => e.receive_packet(&mut pkt)?,
            Native::Audio(e) => e.receive_packet(&mut pkt)?,
        }
        Ok(pkt)
    }

    /// `encode(frame)` (spec §4.2): mirrors `Decoder::decode` — send, then
    /// attempt one receive, looping through `TryAgain` once on send.
    pub fn encode(&mut self, frame: Frame) -> Result<ffmpeg::Packet> {
        self.ensure_initialized(&frame)?;
        let time_base = self.time_base()?;
        let frame = self.adjust_frame(frame, time_base)?;

        if let Some(buffered) = self.push_through_audio_buffer(frame)? {
            return self.send_then_receive(Some(buffered));
        }
        Err(Error::TryAgain)
    }

    /// Routes a frame through the active `AudioFrameBuffer` if one exists;
    /// returns the next full-sized chunk ready to send, if any. Video frames
    /// and audio frames with no buffer configured pass straight through.
    fn push_through_audio_buffer(&mut self, frame: Frame) -> Result<Option<Frame>> {
        match frame {
            Frame::Video(f) => Ok(Some(Frame::Video(f))),
            Frame::Audio(f) => {
                let buffer = match &mut self.state {
                    State::Ready { audio_buffer: Some(b), .. } => b,
                    _ => return Ok(Some(Frame::Audio(f))),
                };
                buffer.push(&f);
                Ok(buffer.pull().map(Frame::Audio))
            }
        }
    }

    fn send_then_receive(&mut self, frame: Option<Frame>) -> Result<ffmpeg::Packet> {
        match self.send_native(frame.as_ref()) {
            Ok(()) => match self.receive_native() {
                Ok(pkt) => Ok(pkt),
                Err(e) => Err(classify(e, "avcodec_receive_packet")),
            },
            Err(e) if crate::native::is_try_again(&e) => match self.receive_native() {
                Ok(pkt) => Ok(pkt),
                Err(_) => Err(Error::native("avcodec_send_frame", -1)),
            },
            Err(e) => Err(classify(e, "avcodec_send_frame")),
        }
    }

    /// `encode_all(frame_or_null)` (spec §4.2): `None` flushes.
    pub fn encode_all(&mut self, frame: Option<Frame>) -> Result<Vec<ffmpeg::Packet>> {
        match frame {
            None => self.flush(),
            Some(frame) => {
                self.ensure_initialized(&frame)?;
                let time_base = self.time_base()?;
                let frame = self.adjust_frame(frame, time_base)?;

                let mut to_send = Vec::new();
                match frame {
                    Frame::Video(f) => to_send.push(Frame::Video(f)),
                    Frame::Audio(f) => {
                        if let State::Ready { audio_buffer: Some(buf), .. } = &mut self.state {
                            buf.push(&f);
                            while let Some(chunk) = buf.pull() {
                                to_send.push(Frame::Audio(chunk));
                            }
                        } else {
                            to_send.push(Frame::Audio(f));
                        }
                    }
                }

                let mut out = Vec::new();
                for f in to_send {
                    if let Err(e) = self.send_native(Some(&f)) {
                        let classified = classify(e, "avcodec_send_frame");
                        if classified.is_control_flow() {
                            continue;
                        }
                        return Err(classified);
                    }
                    loop {
                        match self.receive_native() {
                            Ok(pkt) => out.push(pkt),
                            Err(e) if crate::native::is_try_again(&e) => break,
                            Err(e) => return Err(classify(e, "avcodec_receive_packet")),
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// `flush()` (spec §4.2): drains any partial audio buffer first, then
    /// sends the end-of-stream sentinel and collects trailing packets.
    pub fn flush(&mut self) -> Result<Vec<ffmpeg::Packet>> {
        if self.flushed {
            return Ok(Vec::new());
        }
        self.flushed = true;

        if !self.is_initialized() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if let State::Ready { audio_buffer: Some(buf), .. } = &mut self.state {
            if let Some(tail) = buf.drain() {
                if let Err(e) = self.send_native(Some(&Frame::Audio(tail))) {
                    warn!(error = ?e, "failed to send final partial audio chunk");
                } else {
                    loop {
                        match self.receive_native() {
                            Ok(pkt) => out.push(pkt),
                            Err(e) if crate::native::is_try_again(&e) => break,
                            Err(e) => return Err(classify(e, "avcodec_receive_packet")),
                        }
                    }
                }
            }
        }

        if let Err(e) = self.send_native(None) {
            if !crate::native::is_eof(&e) {
                return Err(classify(e, "avcodec_send_frame(eof)"));
            }
        }
        loop {
            match self.receive_native() {
                Ok(pkt) => out.push(pkt),
                Err(e) if crate::native::is_eof(&e) || crate::native::is_try_again(&e) => break,
                Err(e) => return Err(classify(e, "avcodec_receive_packet")),
            }
        }
        Ok(out)
    }

    /// `close()` (spec §4.2): idempotent.
    pub fn close(&mut self) {
        self.flushed = true;
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.close();
    }
}

fn codec_has_reordered_opaque(codec: ffmpeg::Codec) -> bool {
    unsafe { (*codec.as_ptr()).capabilities & ffi::AV_CODEC_CAP_ENCODER_REORDERED_OPAQUE as i32 != 0 }
}

fn codec_supports_param_change(codec: ffmpeg::Codec) -> bool {
    unsafe { (*codec.as_ptr()).capabilities & ffi::AV_CODEC_CAP_PARAM_CHANGE as i32 != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bit_rate_differs_by_media_kind() {
        assert_eq!(DEFAULT_VIDEO_BIT_RATE, 1_000_000);
        assert_eq!(DEFAULT_AUDIO_BIT_RATE, 128_000);
    }
}
