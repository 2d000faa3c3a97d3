// 合成媒体引擎：按参数确定性地生成音视频字幕包，带故障注入与调用计数
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::frame::{DecodedAudio, DecodedFrame, DecodedPicture, DecodedSubtitle};
use crate::core::{
    AudioSpec, EngineError, EngineResult, MediaKind, MediaSource, Packet, PipelineError, PixelFormat, Rational, Result,
    SampleFormat, StreamDescriptor, VideoSpec, MICROS_PER_SECOND,
};
use crate::player::engine::{CodecContext, Container, MediaEngine, SeekDirection};
use crate::player::interrupter::Interrupter;

const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);
const SUBTITLE_TIME_BASE: Rational = Rational::new(1, 1_000);
/// 阻塞等待时轮询中断的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticVideo {
    pub fps: u32,
    /// 每多少帧一个关键帧
    pub keyframe_interval: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            fps: 25,
            keyframe_interval: 50,
            width: 64,
            height: 36,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_packet: u32,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            samples_per_packet: 1024,
        }
    }
}

/// 从某一时刻起改变音频声道数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSwitch {
    pub at_us: i64,
    pub channels: u16,
}

/// 合成媒体的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticMedia {
    /// 时长（微秒）；直播源忽略
    pub duration_us: i64,
    /// 容器起始时间（绝对微秒）
    pub start_time_us: i64,
    pub video: Option<SyntheticVideo>,
    pub audio: Option<SyntheticAudio>,
    /// 每隔多少微秒一条字幕；None 表示无字幕流
    pub subtitle_interval_us: Option<i64>,
    pub live: bool,
    /// 每次读包的模拟延迟
    pub read_latency_ms: u64,
    pub channel_switch: Option<ChannelSwitch>,
    /// seek 精确落在目标帧上，而不是关键帧
    pub seek_exact: bool,
    pub fail_open: bool,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self {
            duration_us: 60 * MICROS_PER_SECOND,
            start_time_us: 0,
            video: Some(SyntheticVideo::default()),
            audio: Some(SyntheticAudio::default()),
            subtitle_interval_us: None,
            live: false,
            read_latency_ms: 0,
            channel_switch: None,
            seek_exact: false,
            fail_open: false,
        }
    }
}

impl SyntheticMedia {
    /// 纯音频
    pub fn audio_only(duration_us: i64) -> Self {
        Self {
            duration_us,
            video: None,
            ..Self::default()
        }
    }

    fn video_frame_us(&self) -> Option<f64> {
        self.video.map(|v| MICROS_PER_SECOND as f64 / v.fps.max(1) as f64)
    }
}

/// 引擎调用计数与故障注入（测试观察用）
#[derive(Debug, Default)]
pub struct SyntheticProbe {
    opens: AtomicUsize,
    reads: AtomicUsize,
    seeks: AtomicUsize,
    flushes: AtomicUsize,
    /// 之后 N 次读包失败
    failing_reads: AtomicU32,
    /// 之后 N 次 seek 失败
    failing_seeks: AtomicU32,
    /// 读包阻塞，直到被中断或解除
    block_reads: AtomicBool,
}

impl SyntheticProbe {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    pub fn seeks(&self) -> usize {
        self.seeks.load(Ordering::Acquire)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::Release);
    }

    pub fn fail_next_seeks(&self, count: u32) {
        self.failing_seeks.store(count, Ordering::Release);
    }

    pub fn set_block_reads(&self, block: bool) {
        self.block_reads.store(block, Ordering::Release);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct SyntheticEngine {
    media: SyntheticMedia,
    probe: Arc<SyntheticProbe>,
}

impl SyntheticEngine {
    pub fn new(media: SyntheticMedia) -> Self {
        Self {
            media,
            probe: Arc::new(SyntheticProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<SyntheticProbe> {
        self.probe.clone()
    }

    pub fn media(&self) -> &SyntheticMedia {
        &self.media
    }
}

impl MediaEngine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open_container(&self, source: &MediaSource, interrupter: Arc<Interrupter>) -> Result<Box<dyn Container>> {
        self.probe.opens.fetch_add(1, Ordering::AcqRel);
        if self.media.fail_open {
            return Err(PipelineError::OpenError(format!("无法打开合成源: {}", source.location())));
        }
        let container = SyntheticContainer::new(self.media.clone(), source, self.probe.clone(), interrupter);
        info!("🧪 合成源已打开: {}", container.description());
        Ok(Box::new(container))
    }
}

/// 单个流的生成游标
#[derive(Debug, Clone)]
struct Track {
    kind: MediaKind,
    index: usize,
    /// 下一个包的序号
    next: i64,
    discard: bool,
}

pub struct SyntheticContainer {
    media: SyntheticMedia,
    streams: Vec<StreamDescriptor>,
    tracks: Vec<Track>,
    probe: Arc<SyntheticProbe>,
    interrupter: Arc<Interrupter>,
    location: String,
}

impl SyntheticContainer {
    fn new(media: SyntheticMedia, source: &MediaSource, probe: Arc<SyntheticProbe>, interrupter: Arc<Interrupter>) -> Self {
        let mut streams = Vec::new();
        let duration = (!media.live).then_some(media.duration_us);

        if let Some(video) = media.video {
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Video,
                time_base: VIDEO_TIME_BASE,
                start_time: Some(VIDEO_TIME_BASE.from_micros(media.start_time_us)),
                duration: duration.map(|d| VIDEO_TIME_BASE.from_micros(d)),
                codec_name: "synthetic-video".to_string(),
                audio: None,
                video: Some(VideoSpec {
                    width: video.width,
                    height: video.height,
                    pixel_format: PixelFormat::RGBA,
                    frame_rate: Rational::new(video.fps.max(1) as i32, 1),
                }),
            });
        }
        if let Some(audio) = media.audio {
            let tb = Rational::new(1, audio.sample_rate.max(1) as i32);
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Audio,
                time_base: tb,
                start_time: Some(tb.from_micros(media.start_time_us)),
                duration: duration.map(|d| tb.from_micros(d)),
                codec_name: "synthetic-pcm".to_string(),
                audio: Some(AudioSpec {
                    sample_format: SampleFormat::F32,
                    sample_rate: audio.sample_rate,
                    channels: audio.channels,
                }),
                video: None,
            });
        }
        if media.subtitle_interval_us.is_some() {
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Subtitle,
                time_base: SUBTITLE_TIME_BASE,
                start_time: Some(SUBTITLE_TIME_BASE.from_micros(media.start_time_us)),
                duration: duration.map(|d| SUBTITLE_TIME_BASE.from_micros(d)),
                codec_name: "synthetic-text".to_string(),
                audio: None,
                video: None,
            });
        }

        let tracks = streams
            .iter()
            .map(|s| Track {
                kind: s.kind,
                index: s.index,
                next: 0,
                discard: false,
            })
            .collect();

        Self {
            media,
            streams,
            tracks,
            probe,
            interrupter,
            location: source.location(),
        }
    }

    /// 第 n 个包的相对时间（微秒）
    fn packet_time(&self, kind: MediaKind, n: i64) -> i64 {
        match kind {
            MediaKind::Video => {
                let frame_us = self.media.video_frame_us().unwrap_or(40_000.0);
                (n as f64 * frame_us).round() as i64
            }
            MediaKind::Audio => {
                let audio = self.media.audio.unwrap_or_default();
                n * audio.samples_per_packet as i64 * MICROS_PER_SECOND / audio.sample_rate.max(1) as i64
            }
            MediaKind::Subtitle => n * self.media.subtitle_interval_us.unwrap_or(MICROS_PER_SECOND),
        }
    }

    /// 相对时间落在哪个包里
    fn packet_at(&self, kind: MediaKind, relative_us: i64) -> i64 {
        let relative_us = relative_us.max(0);
        match kind {
            MediaKind::Video => {
                let frame_us = self.media.video_frame_us().unwrap_or(40_000.0);
                (relative_us as f64 / frame_us).floor() as i64
            }
            MediaKind::Audio => {
                let audio = self.media.audio.unwrap_or_default();
                relative_us * audio.sample_rate.max(1) as i64
                    / (audio.samples_per_packet.max(1) as i64 * MICROS_PER_SECOND)
            }
            MediaKind::Subtitle => relative_us / self.media.subtitle_interval_us.unwrap_or(MICROS_PER_SECOND).max(1),
        }
    }

    fn exhausted(&self, relative_us: i64) -> bool {
        !self.media.live && relative_us >= self.media.duration_us
    }

    fn make_packet(&self, track: &Track) -> Packet {
        let n = track.next;
        let relative = self.packet_time(track.kind, n);
        let absolute = self.media.start_time_us + relative;
        let stream = &self.streams[track.index];
        let tb = stream.time_base;

        match track.kind {
            MediaKind::Video => {
                let video = self.media.video.unwrap_or_default();
                let end = self.packet_time(MediaKind::Video, n + 1);
                let keyframe = n % video.keyframe_interval.max(1) as i64 == 0;
                let mut data = BytesMut::with_capacity(8);
                data.put_u32_le(video.width);
                data.put_u32_le(video.height);
                Packet::new(MediaKind::Video, track.index, tb, data.freeze())
                    .with_pts(tb.from_micros(absolute))
                    .with_duration(tb.from_micros(end - relative))
                    .with_keyframe(keyframe)
            }
            MediaKind::Audio => {
                let audio = self.media.audio.unwrap_or_default();
                let channels = match self.media.channel_switch {
                    Some(switch) if relative >= switch.at_us => switch.channels,
                    _ => audio.channels,
                };
                let mut data = BytesMut::with_capacity(12);
                data.put_u16_le(channels);
                data.put_u32_le(audio.sample_rate);
                data.put_u32_le(audio.samples_per_packet);
                let start = n * audio.samples_per_packet as i64;
                Packet::new(MediaKind::Audio, track.index, tb, data.freeze())
                    .with_pts(tb.from_micros(self.media.start_time_us) + start)
                    .with_duration(audio.samples_per_packet as i64)
                    .with_keyframe(true)
            }
            MediaKind::Subtitle => {
                let interval = self.media.subtitle_interval_us.unwrap_or(MICROS_PER_SECOND);
                let text = format!("字幕 #{}", n);
                Packet::new(MediaKind::Subtitle, track.index, tb, Bytes::from(text))
                    .with_pts(tb.from_micros(absolute))
                    .with_duration(tb.from_micros(interval / 2))
                    .with_keyframe(true)
            }
        }
    }

    /// 可中断的等待；被中断返回 false
    fn interruptible_wait(&self, mut still_waiting: impl FnMut() -> bool) -> bool {
        while still_waiting() {
            if self.interrupter.should_abort() {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
        true
    }

    /// seek 落点（相对微秒）
    fn landing(&self, relative_us: i64, direction: SeekDirection) -> Option<i64> {
        let Some(video) = self.media.video else {
            let n = self.packet_at(MediaKind::Audio, relative_us);
            let n = match direction {
                SeekDirection::Backward => n,
                SeekDirection::Forward if self.packet_time(MediaKind::Audio, n) < relative_us => n + 1,
                SeekDirection::Forward => n,
            };
            return Some(self.packet_time(MediaKind::Audio, n));
        };

        let frame = self.packet_at(MediaKind::Video, relative_us);
        if self.media.seek_exact {
            return Some(self.packet_time(MediaKind::Video, frame));
        }
        let gop = video.keyframe_interval.max(1) as i64;
        let keyframe = match direction {
            SeekDirection::Backward => frame / gop * gop,
            SeekDirection::Forward => {
                let time = self.packet_time(MediaKind::Video, frame);
                if frame % gop == 0 && time >= relative_us {
                    frame
                } else {
                    (frame / gop + 1) * gop
                }
            }
        };
        Some(self.packet_time(MediaKind::Video, keyframe))
    }
}

impl Container for SyntheticContainer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn start_time_us(&self) -> i64 {
        self.media.start_time_us
    }

    fn duration_us(&self) -> Option<i64> {
        (!self.media.live).then_some(self.media.duration_us)
    }

    fn is_live(&self) -> bool {
        self.media.live
    }

    fn read_packet(&mut self) -> EngineResult<Packet> {
        self.probe.reads.fetch_add(1, Ordering::AcqRel);

        let probe = self.probe.clone();
        if !self.interruptible_wait(|| probe.block_reads.load(Ordering::Acquire)) {
            return Err(EngineError::Interrupted);
        }
        if self.media.read_latency_ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(self.media.read_latency_ms);
            if !self.interruptible_wait(|| Instant::now() < deadline) {
                return Err(EngineError::Interrupted);
            }
        }
        if SyntheticProbe::take_failure(&self.probe.failing_reads) {
            return Err(EngineError::Failed("注入的读取错误".to_string()));
        }

        // 取时间最早的未耗尽流，保证交错输出
        let next = self
            .tracks
            .iter()
            .filter(|t| !t.discard)
            .map(|t| (t.index, self.packet_time(t.kind, t.next)))
            .filter(|(_, time)| !self.exhausted(*time))
            .min_by_key(|(index, time)| (*time, *index));

        let Some((index, _)) = next else {
            return Err(EngineError::EndOfStream);
        };
        let packet = self.make_packet(&self.tracks[index]);
        self.tracks[index].next += 1;
        Ok(packet)
    }

    fn seek(&mut self, timestamp_us: i64, direction: SeekDirection) -> EngineResult<()> {
        self.probe.seeks.fetch_add(1, Ordering::AcqRel);
        if self.media.live {
            return Err(EngineError::Failed("直播源不支持 seek".to_string()));
        }
        if SyntheticProbe::take_failure(&self.probe.failing_seeks) {
            return Err(EngineError::Failed("注入的 seek 错误".to_string()));
        }
        let relative = timestamp_us - self.media.start_time_us;
        if relative < 0 || relative > self.media.duration_us {
            return Err(EngineError::Failed(format!("seek 超出范围: {}us", relative)));
        }
        let landing = self
            .landing(relative, direction)
            .filter(|landing| *landing < self.media.duration_us || direction == SeekDirection::Backward)
            .ok_or_else(|| EngineError::Failed("seek 目标后没有关键帧".to_string()))?;

        let positions: Vec<i64> = self.tracks.iter().map(|t| self.packet_at(t.kind, landing)).collect();
        for (track, next) in self.tracks.iter_mut().zip(positions) {
            track.next = next;
        }
        debug!("🧪 合成源 seek {:?}: {}us → {}us", direction, relative, landing);
        Ok(())
    }

    fn flush(&mut self) {
        self.probe.flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn set_discard(&mut self, index: usize, discard: bool) {
        if let Some(track) = self.tracks.get_mut(index) {
            track.discard = discard;
        }
    }

    fn open_codec(&self, index: usize) -> Result<Box<dyn CodecContext>> {
        let stream = self.streams.get(index).ok_or(PipelineError::InvalidStream(index))?;
        Ok(Box::new(SyntheticCodec::new(stream.kind)))
    }

    fn description(&self) -> String {
        let kinds: Vec<&str> = self.streams.iter().map(|s| s.kind.as_str()).collect();
        format!(
            "synthetic:{} [{}] {}",
            self.location,
            kinds.join("+"),
            if self.media.live {
                "live".to_string()
            } else {
                format!("{}s", self.media.duration_us / MICROS_PER_SECOND)
            }
        )
    }
}

/// 一包一帧的合成解码器
pub struct SyntheticCodec {
    kind: MediaKind,
    ready: VecDeque<DecodedFrame>,
    eof: bool,
}

impl SyntheticCodec {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            ready: VecDeque::new(),
            eof: false,
        }
    }

    fn decode(&self, packet: &Packet) -> EngineResult<DecodedFrame> {
        let mut data = packet.data.clone();
        let frame = match self.kind {
            MediaKind::Video => {
                if data.remaining() < 8 {
                    return Err(EngineError::Failed("视频包头不完整".to_string()));
                }
                let width = data.get_u32_le();
                let height = data.get_u32_le();
                let shade = packet.pts.unwrap_or(0) as u8;
                DecodedFrame::Video(DecodedPicture {
                    best_effort_timestamp: packet.pts,
                    keyframe: packet.keyframe,
                    width,
                    height,
                    format: PixelFormat::RGBA,
                    data: Bytes::from(vec![shade; PixelFormat::RGBA.frame_size(width, height)]),
                })
            }
            MediaKind::Audio => {
                if data.remaining() < 10 {
                    return Err(EngineError::Failed("音频包头不完整".to_string()));
                }
                let channels = data.get_u16_le();
                let sample_rate = data.get_u32_le();
                let nb_samples = data.get_u32_le() as usize;
                let start = packet.pts.unwrap_or(0);
                let samples = (0..nb_samples * channels as usize)
                    .map(|i| {
                        let t = (start + (i / channels.max(1) as usize) as i64) as f32 / sample_rate.max(1) as f32;
                        (t * 440.0 * std::f32::consts::TAU).sin() * 0.1
                    })
                    .collect();
                DecodedFrame::Audio(DecodedAudio {
                    best_effort_timestamp: packet.pts,
                    spec: AudioSpec {
                        sample_format: SampleFormat::F32,
                        sample_rate,
                        channels,
                    },
                    nb_samples,
                    samples,
                })
            }
            MediaKind::Subtitle => DecodedFrame::Subtitle(DecodedSubtitle {
                best_effort_timestamp: packet.pts,
                duration: Some(packet.duration_us()),
                text: String::from_utf8_lossy(&packet.data).into_owned(),
            }),
        };
        Ok(frame)
    }
}

impl CodecContext for SyntheticCodec {
    fn send_packet(&mut self, packet: &Packet) -> EngineResult<()> {
        if self.eof {
            return Err(EngineError::EndOfStream);
        }
        let frame = self.decode(packet)?;
        self.ready.push_back(frame);
        Ok(())
    }

    fn send_eof(&mut self) -> EngineResult<()> {
        self.eof = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> EngineResult<DecodedFrame> {
        match self.ready.pop_front() {
            Some(frame) => Ok(frame),
            None if self.eof => Err(EngineError::EndOfStream),
            None => Err(EngineError::Again),
        }
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.eof = false;
    }
}
