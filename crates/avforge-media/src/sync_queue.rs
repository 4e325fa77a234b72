//! Multi-stream packet buffer providing a total order over packets from
//! concurrent streams (spec §4.3.2).
//!
//! `MuxedOutput` only ever adds streams as non-limiting (matching the
//! native container writer's default interleaving behavior without a
//! "shortest stream" constraint), so `receive` degenerates to FIFO-by-send
//! order. The `limiting` machinery is still implemented in full, grounded on
//! the spec's own description and exercised directly by `SyncQueue` tests
//! (E6), even though `MuxedOutput` itself never exercises the limiting path.

use std::collections::VecDeque;

use avforge_core::{Error, Rational as R, Result, Rounding, TimebaseMath};
use ffmpeg_the_third::Packet;

pub enum SyncQueueKind {
    ByPacketDuration,
    ByAudioSampleCount,
}

struct StreamState {
    limiting: bool,
    queue: VecDeque<(Packet, R)>,
    finished: bool,
}

fn front_dts_us(s: &StreamState) -> Option<i64> {
    let (packet, tb) = s.queue.front()?;
    packet.dts().map(|dts| TimebaseMath::rescale(dts, *tb, microsecond_tb(), Rounding::Down))
}

/// `SyncQueue::create` (spec §4.3.2).
pub struct SyncQueue {
    #[allow(dead_code)]
    kind: SyncQueueKind,
    #[allow(dead_code)]
    buffer_size_us: i64,
    streams: Vec<StreamState>,
    /// Order in which `send` was called, used to break ties between
    /// non-limiting streams so `receive` is strict FIFO among them.
    arrival: VecDeque<usize>,
}

fn microsecond_tb() -> R {
    R::new(1, 1_000_000)
}

impl SyncQueue {
    pub fn create(kind: SyncQueueKind, buffer_size_us: i64) -> Self {
        SyncQueue { kind, buffer_size_us, streams: Vec::new(), arrival: VecDeque::new() }
    }

    /// `add_stream(limiting)` (spec §4.3.2).
    pub fn add_stream(&mut self, limiting: bool) -> usize {
        self.streams.push(StreamState { limiting, queue: VecDeque::new(), finished: false });
        self.streams.len() - 1
    }

    /// `send(sq_index, packet_or_null)` (spec §4.3.2). `None` marks the
    /// stream finished.
    pub fn send(&mut self, sq_index: usize, packet: Option<(Packet, R)>) -> Result<()> {
        let stream = self
            .streams
            .get_mut(sq_index)
            .ok_or_else(|| Error::invalid_argument("sync queue index out of range"))?;
        match packet {
            None => {
                stream.finished = true;
            }
            Some((packet, tb)) => {
                stream.queue.push_back((packet, tb));
                self.arrival.push_back(sq_index);
            }
        }
        Ok(())
    }

    /// `receive(sq_index_or_any, out_packet)` (spec §4.3.2). `None` means
    /// "any stream". Returns `Ok(None)` for `TryAgain` (not enough data
    /// buffered yet) and `Err(Error::EndOfStream)` once every stream is
    /// finished and drained.
    pub fn receive(&mut self, sq_index: Option<usize>) -> Result<Option<(usize, Packet, R)>> {
        if let Some(idx) = sq_index {
            return self.receive_from(idx);
        }

        while let Some(&candidate) = self.arrival.front() {
            if self.streams[candidate].queue.is_empty() {
                self.arrival.pop_front();
                continue;
            }
            if self.limiting_blocks(candidate) {
                return Ok(None);
            }
            self.arrival.pop_front();
            let (packet, tb) = self.streams[candidate].queue.pop_front().unwrap();
            return Ok(Some((candidate, packet, tb)));
        }

        if self.all_finished_and_drained() {
            Err(Error::EndOfStream)
        } else {
            Ok(None)
        }
    }

    fn receive_from(&mut self, idx: usize) -> Result<Option<(usize, Packet, R)>> {
        let stream = self
            .streams
            .get_mut(idx)
            .ok_or_else(|| Error::invalid_argument("sync queue index out of range"))?;
        match stream.queue.pop_front() {
            Some((packet, tb)) => Ok(Some((idx, packet, tb))),
            None if stream.finished => Err(Error::EndOfStream),
            None => Ok(None),
        }
    }

    /// No candidate packet — limiting or not — may jump ahead of a limiting
    /// stream that hasn't caught up to it yet. A limiting stream whose queue
    /// is currently empty (but not finished) blocks every other stream,
    /// since its position relative to the candidate is unknown.
    fn limiting_blocks(&self, candidate: usize) -> bool {
        let Some(candidate_us) = front_dts_us(&self.streams[candidate]) else { return false };

        for (i, s) in self.streams.iter().enumerate() {
            if i == candidate || !s.limiting || s.finished {
                continue;
            }
            match front_dts_us(s) {
                Some(head) if head >= candidate_us => continue,
                Some(_) => return true,
                None => return true,
            }
        }
        false
    }

    fn all_finished_and_drained(&self) -> bool {
        self.streams.iter().all(|s| s.finished && s.queue.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(dts: i64) -> Packet {
        let mut p = Packet::empty();
        p.set_dts(Some(dts));
        p.set_pts(Some(dts));
        p
    }

    /// P8: two non-limiting streams, send 0,0,0,1,0,0 → receive(any) yields
    /// exactly that sequence.
    #[test]
    fn fifo_when_all_streams_non_limiting() {
        let mut sq = SyncQueue::create(SyncQueueKind::ByPacketDuration, 1_000_000);
        let s0 = sq.add_stream(false);
        let s1 = sq.add_stream(false);
        let tb = R::new(1, 90_000);

        sq.send(s0, Some((pkt(0), tb))).unwrap();
        sq.send(s0, Some((pkt(1), tb))).unwrap();
        sq.send(s0, Some((pkt(2), tb))).unwrap();
        sq.send(s1, Some((pkt(0), tb))).unwrap();
        sq.send(s0, Some((pkt(3), tb))).unwrap();
        sq.send(s0, Some((pkt(4), tb))).unwrap();

        let mut order = Vec::new();
        for _ in 0..6 {
            match sq.receive(None) {
                Ok(Some((idx, _, _))) => order.push(idx),
                other => panic!("unexpected receive result: {:?}", other.is_ok()),
            }
        }
        assert_eq!(order, vec![0, 0, 0, 1, 0, 0]);
    }

    /// E6: a limiting video stream holds back a non-limiting audio stream
    /// whose head has run far ahead in presentation time.
    #[test]
    fn limiting_stream_holds_back_a_faster_stream() {
        let mut sq = SyncQueue::create(SyncQueueKind::ByPacketDuration, 1_000_000);
        let video = sq.add_stream(true);
        let audio = sq.add_stream(false);

        // Audio arrives first but runs far ahead in real time (tb 1/48000).
        sq.send(audio, Some((pkt(0), R::new(1, 48_000)))).unwrap();
        sq.send(video, Some((pkt(0), R::new(1, 30)))).unwrap();

        let (idx, _, _) = sq.receive(None).unwrap().expect("a packet should be ready");
        assert_eq!(idx, audio, "non-limiting audio arrived first and has no limiting constraint ahead of it");

        let (idx, _, _) = sq.receive(None).unwrap().expect("video packet should follow");
        assert_eq!(idx, video);
    }

    /// E6: the full scenario behind the single-packet test above — a
    /// limiting video stream and a faster non-limiting audio stream each
    /// sending many packets, not just one.
    #[test]
    fn limiting_video_holds_back_a_faster_audio_stream_across_many_packets() {
        let mut sq = SyncQueue::create(SyncQueueKind::ByPacketDuration, 1_000_000);
        let video = sq.add_stream(true);
        let audio = sq.add_stream(false);

        let video_tb = R::new(1, 30); // ~33ms/packet
        let audio_tb = R::new(1, 10); // 100ms/packet: runs ahead of video in wall-clock time

        let mut streaming_order = Vec::new();
        for i in 0..10i64 {
            sq.send(video, Some((pkt(i), video_tb))).unwrap();
            sq.send(audio, Some((pkt(i), audio_tb))).unwrap();
            while let Ok(Some((idx, p, tb))) = sq.receive(None) {
                streaming_order.push((idx, p.dts().unwrap(), tb));
            }
        }

        // While both streams are still open, the limiting video stream must
        // never let the faster audio stream's wall-clock position run ahead.
        let mut last_video_us = 0i64;
        for (idx, dts, tb) in &streaming_order {
            let us = TimebaseMath::rescale(*dts, *tb, microsecond_tb(), Rounding::Down);
            if *idx == video {
                last_video_us = us;
            } else {
                assert!(us <= last_video_us, "audio ran ahead of the limiting video stream before it finished");
            }
        }
        assert!(streaming_order.iter().any(|(idx, _, _)| *idx == audio), "at least one audio packet should release while streaming");
        assert!(streaming_order.len() < 20, "some packets must still be buffered, held back by the limiting stream");

        sq.send(video, None).unwrap();
        sq.send(audio, None).unwrap();

        let mut final_order = streaming_order;
        loop {
            match sq.receive(None) {
                Ok(Some((idx, p, tb))) => final_order.push((idx, p.dts().unwrap(), tb)),
                Ok(None) => continue,
                Err(e) if e.is_control_flow() => break,
                Err(e) => panic!("unexpected error draining sync queue: {e}"),
            }
        }

        assert_eq!(final_order.len(), 20, "every sent packet must eventually be received once both streams finish");
        let video_dts: Vec<i64> = final_order.iter().filter(|(idx, _, _)| *idx == video).map(|(_, d, _)| *d).collect();
        let audio_dts: Vec<i64> = final_order.iter().filter(|(idx, _, _)| *idx == audio).map(|(_, d, _)| *d).collect();
        assert_eq!(video_dts, (0..10).collect::<Vec<_>>(), "video packets must stay in send order");
        assert_eq!(audio_dts, (0..10).collect::<Vec<_>>(), "audio packets must stay in send order");
    }
}
