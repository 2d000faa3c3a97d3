use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::{MediaKind, Packet, PipelineError, Result, StreamDescriptor};

/// 录制输出（写入容器/网络等，由调用方实现）
pub trait RecordingSink: Send {
    /// 包以借用方式传入，实现方需要保留时自行复制
    fn write_packet(&mut self, packet: &Packet, stream: &StreamDescriptor) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 内存录制输出：收集包的副本，克隆共享同一份记录
#[derive(Clone, Default)]
pub struct MemorySink {
    packets: Arc<Mutex<Vec<Packet>>>,
    finished: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }
}

impl RecordingSink for MemorySink {
    fn write_packet(&mut self, packet: &Packet, stream: &StreamDescriptor) -> Result<()> {
        if self.is_finished() {
            return Err(PipelineError::RecordingError(format!(
                "录制已结束，拒绝流 #{} 的包",
                stream.index
            )));
        }
        self.packets.lock().push(packet.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        *self.finished.lock() = true;
        Ok(())
    }
}

/// 录制透传：门限满足之前丢弃，之后把每个音视频包复制一份给输出
pub(crate) struct Recorder {
    sink: Box<dyn RecordingSink>,
    start_time: Option<i64>,
    gate_kind: MediaKind,
    open: bool,
    written: u64,
}

impl Recorder {
    pub(crate) fn new(sink: Box<dyn RecordingSink>, start_time: Option<i64>, gate_kind: MediaKind) -> Self {
        Self {
            sink,
            start_time,
            gate_kind,
            open: false,
            written: 0,
        }
    }

    /// `relative_ts` 为相对容器起点的微秒时间
    pub(crate) fn offer(&mut self, packet: &Packet, stream: &StreamDescriptor, relative_ts: Option<i64>) {
        if !matches!(stream.kind, MediaKind::Audio | MediaKind::Video) {
            return;
        }
        if !self.open {
            self.open = match self.start_time {
                Some(start) => relative_ts.is_some_and(|ts| ts >= start),
                None => stream.kind == self.gate_kind && packet.keyframe,
            };
            if !self.open {
                return;
            }
            info!("⏺ 录制开始 (流 #{} @ {:?}us)", stream.index, relative_ts);
        }
        match self.sink.write_packet(packet, stream) {
            Ok(()) => self.written += 1,
            Err(e) => warn!("⚠ 录制写入失败: {}", e),
        }
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        info!("⏹ 录制结束，共写入 {} 个包", self.written);
        self.sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Rational;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<(MediaKind, bool)>>>);

    impl RecordingSink for Collect {
        fn write_packet(&mut self, packet: &Packet, _stream: &StreamDescriptor) -> Result<()> {
            self.0.lock().push((packet.kind, packet.keyframe));
            Ok(())
        }
    }

    fn stream(kind: MediaKind, index: usize) -> StreamDescriptor {
        StreamDescriptor {
            index,
            kind,
            time_base: Rational::new(1, 1000),
            start_time: Some(0),
            duration: None,
            codec_name: "test".into(),
            audio: None,
            video: None,
        }
    }

    #[test]
    fn test_gate_opens_on_first_video_keyframe() {
        let sink = Collect::default();
        let mut recorder = Recorder::new(Box::new(sink.clone()), None, MediaKind::Video);
        let video = stream(MediaKind::Video, 0);
        let audio = stream(MediaKind::Audio, 1);

        let tb = Rational::new(1, 1000);
        let delta = Packet::new(MediaKind::Video, 0, tb, vec![1]).with_pts(0);
        let sound = Packet::new(MediaKind::Audio, 1, tb, vec![2]).with_pts(0).with_keyframe(true);
        let key = Packet::new(MediaKind::Video, 0, tb, vec![3]).with_pts(40).with_keyframe(true);

        recorder.offer(&delta, &video, Some(0));
        recorder.offer(&sound, &audio, Some(0));
        recorder.offer(&key, &video, Some(40_000));
        recorder.offer(&sound, &audio, Some(40_000));
        recorder.offer(&delta, &video, Some(80_000));

        let written = sink.0.lock().clone();
        assert_eq!(
            written,
            vec![
                (MediaKind::Video, true),
                (MediaKind::Audio, true),
                (MediaKind::Video, false)
            ]
        );
    }

    #[test]
    fn test_gate_opens_at_start_time() {
        let sink = Collect::default();
        let mut recorder = Recorder::new(Box::new(sink.clone()), Some(1_000_000), MediaKind::Video);
        let audio = stream(MediaKind::Audio, 1);
        let tb = Rational::new(1, 1000);
        for ms in [0, 500, 1_000, 1_500] {
            let packet = Packet::new(MediaKind::Audio, 1, tb, vec![0]).with_pts(ms);
            recorder.offer(&packet, &audio, Some(ms * 1_000));
        }
        assert_eq!(sink.0.lock().len(), 2);
        assert!(recorder.finish().is_ok());
    }

    #[test]
    fn test_memory_sink_finish() {
        let sink = MemorySink::new();
        let mut recorder = Recorder::new(Box::new(sink.clone()), Some(0), MediaKind::Video);
        let video = stream(MediaKind::Video, 0);
        let packet = Packet::new(MediaKind::Video, 0, Rational::new(1, 1000), vec![9]).with_pts(0);
        recorder.offer(&packet, &video, Some(0));
        assert_eq!(sink.len(), 1);
        assert!(!sink.is_finished());
        recorder.finish().unwrap();
        assert!(sink.is_finished());

        // 结束后的写入被拒绝
        let mut closed = sink.clone();
        let result = closed.write_packet(&packet, &video);
        assert!(matches!(result, Err(PipelineError::RecordingError(_))));
        assert_eq!(sink.len(), 1);
    }
}
