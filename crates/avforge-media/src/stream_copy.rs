//! Stream-copy pre-filter (spec §4.3.1): decides whether a remuxed packet
//! may pass through to the muxer, and applies the start-time offset once
//! copying begins.

use avforge_core::{Rational as R, Rounding, TimebaseMath};
use ffmpeg_the_third::Packet;

use crate::options::StreamCopyOptions;

/// Canonical microsecond time base used for the start-time comparisons in
/// this filter (spec §6: "canonical microsecond time base 1/1,000,000").
pub fn microsecond_tb() -> R {
    R::new(1, 1_000_000)
}

/// Per-stream state carried across `evaluate` calls, separate from the rest
/// of a stream descriptor so this filter can be unit-tested in isolation.
#[derive(Default)]
pub struct StreamCopyState {
    pub streamcopy_started: bool,
}

pub enum Decision {
    Reject,
    Accept,
}

/// Runs the pre-filter against `packet`, mutating it in place when accepted
/// (applying the start-time offset, fabricating a missing DTS, and for audio
/// streams setting `pts = dts`).
pub fn evaluate(
    state: &mut StreamCopyState,
    packet: &mut Packet,
    packet_time_base: R,
    options: &StreamCopyOptions,
    is_audio: bool,
) -> Decision {
    let dts_us = packet.dts().map(|dts| TimebaseMath::rescale(dts, packet_time_base, microsecond_tb(), Rounding::Down));

    if !state.streamcopy_started && !packet.is_key() && !options.copy_initial_nonkeyframes {
        return Decision::Reject;
    }

    if !state.streamcopy_started {
        let start_us = options.start_time_us.unwrap_or(0);
        if options.copy_prior_start != 1 {
            let compare_us = match packet.pts() {
                Some(pts) => TimebaseMath::rescale(pts, packet_time_base, microsecond_tb(), Rounding::Down),
                None => dts_us.unwrap_or(i64::MIN),
            };
            if compare_us < start_us {
                return Decision::Reject;
            }
        }
    }

    if let Some(start_us) = options.start_time_us {
        if let Some(dts_us) = dts_us {
            if dts_us < start_us {
                return Decision::Reject;
            }
        }
    }

    state.streamcopy_started = true;

    let start_us = options.start_time_us.unwrap_or(0);
    let offset = TimebaseMath::rescale(start_us, microsecond_tb(), packet_time_base, Rounding::Down);

    let dts = match packet.dts() {
        Some(dts) => dts - offset,
        None => dts_us
            .map(|us| TimebaseMath::rescale(us, microsecond_tb(), packet_time_base, Rounding::Nearest) - offset)
            .unwrap_or(0),
    };
    packet.set_dts(Some(dts));

    let pts = if is_audio {
        dts
    } else {
        packet.pts().map(|pts| pts - offset).unwrap_or(dts)
    };
    packet.set_pts(Some(pts));

    Decision::Accept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_keyframe_before_copy_starts() {
        let mut packet = Packet::empty();
        packet.set_pts(Some(100));
        packet.set_dts(Some(100));
        let mut state = StreamCopyState::default();
        let opts = StreamCopyOptions::default();
        // packet.is_key() defaults false on an empty packet with no flags set.
        match evaluate(&mut state, &mut packet, R::new(1, 90_000), &opts, false) {
            Decision::Reject => {}
            Decision::Accept => panic!("non-keyframe before start must be rejected"),
        }
    }
}
