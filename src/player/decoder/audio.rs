use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::frame::{DecodedAudio, DecodedFrame};
use crate::core::{
    AudioConfig, AudioSpec, Component, EventBus, MediaKind, OutputFormat, Packet, PipelineError, PipelineEvent,
    Rational, Result, StatusCell,
};
use crate::player::decoder::audio_queue::AudioFrameQueue;
use crate::player::decoder::resample::AudioResampler;
use crate::player::decoder::sync::AvSync;
use crate::player::decoder::{
    drain_codec, feed_packet, open_codec_for, wait_for_space, DecodeBody, Decoder,
};
use crate::player::demuxer::Demuxer;
use crate::player::engine::CodecContext;

/// 速率状态
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedState {
    pub current: f64,
    pub previous: f64,
    /// 锚点时间戳（微秒），第一帧输出时确定
    pub first_output_timestamp: Option<i64>,
    /// 自锚点以来输出的采样帧数
    pub output_samples: usize,
}

impl Default for SpeedState {
    fn default() -> Self {
        Self {
            current: 1.0,
            previous: 1.0,
            first_output_timestamp: None,
            output_samples: 0,
        }
    }
}

/// 速率锁保护的输出级：转换器 + 速率状态
struct AudioStage {
    resampler: Option<AudioResampler>,
    speed: SpeedState,
}

#[derive(Debug, Default)]
struct AudioTiming {
    /// 无时间戳帧使用的递推时间（微秒）
    next_timestamp: Option<i64>,
    /// seek 后丢弃在此之前（含）结束的帧
    seek_target: Option<i64>,
    /// 音视频起点门限是否已放行
    gate_released: bool,
    source_spec: Option<AudioSpec>,
}

pub struct AudioBody {
    codec: Mutex<Option<Box<dyn CodecContext>>>,
    time_base: Rational,
    container_start_us: i64,
    stream_start_us: i64,
    timing: Mutex<AudioTiming>,
    stage: Mutex<AudioStage>,
    queue: Arc<AudioFrameQueue>,
    av_sync: Arc<AvSync>,
    output: OutputFormat,
    resync_threshold_us: i64,
    events: EventBus,
}

impl AudioBody {
    fn frame_timestamp(&self, audio: &DecodedAudio, timing: &AudioTiming) -> i64 {
        match audio.best_effort_timestamp {
            Some(ts) => self.time_base.to_micros(ts) - self.container_start_us,
            None => timing.next_timestamp.unwrap_or(self.stream_start_us),
        }
    }

    /// 源格式变化时重建转换器
    fn check_format(&self, spec: AudioSpec) {
        let previous = {
            let mut timing = self.timing.lock();
            if timing.source_spec == Some(spec) {
                return;
            }
            timing.source_spec.replace(spec)
        };

        // 旧转换器的积压按旧格式排布，直接丢弃
        {
            let mut stage = self.stage.lock();
            let speed = stage.speed.current;
            stage.resampler = Some(AudioResampler::new(spec, self.output, speed));
        }

        if let Some(from) = previous {
            info!("🔄 音频格式变化: {} → {}，重建输出管线", from, spec);
            self.events.emit(PipelineEvent::AudioFormatChanged { from, to: spec });
        }
    }

    /// 音视频起点门限：视频起点未知或帧在视频起点之前结束时丢弃
    ///
    /// 不在这里等待视频：音频包不被取走会让 Demuxer 停在 QueueFull，视频关键帧永远读不到
    fn pass_av_gate(&self, end: i64) -> bool {
        let mut timing = self.timing.lock();
        if timing.gate_released {
            return true;
        }
        if self.av_sync.has_video() {
            match self.av_sync.video_start() {
                Some(video_start) if end >= video_start => {
                    debug!("🔓 音频门限放行: 视频起点 {}us", video_start);
                }
                _ => return false,
            }
        }
        timing.gate_released = true;
        true
    }

    /// 转换后写入输出队列（持速率锁）
    fn emit(&self, stage: &mut AudioStage, input_ts: Option<i64>, samples: Vec<f32>) -> bool {
        let channels = self.output.channels as usize;
        let frames = samples.len() / channels;
        if frames == 0 {
            return true;
        }
        let period = self.output.sample_period_us();
        let speed = stage.speed.current;

        let first = *stage
            .speed
            .first_output_timestamp
            .get_or_insert(input_ts.unwrap_or(0));
        let mut timestamp = first + (stage.speed.output_samples as f64 * period * speed).round() as i64;
        if let Some(input_ts) = input_ts {
            if (timestamp - input_ts).abs() > self.resync_threshold_us {
                debug!("音频时间戳重新锚定: {}us → {}us", timestamp, input_ts);
                stage.speed.first_output_timestamp = Some(input_ts);
                stage.speed.output_samples = 0;
                timestamp = input_ts;
            }
        }
        stage.speed.output_samples += frames;

        let bytes = self.output.encode(&samples);
        let pushed = self.queue.push_samples(timestamp, &bytes);
        if !pushed {
            warn!("⚠ 音频帧入队失败 @{}us", timestamp);
        }
        pushed
    }

    /// 改变播放速率并重排已排队的帧
    pub fn set_speed(&self, speed: f64) {
        let mut stage = self.stage.lock();
        let old = stage.speed.current;
        if old == speed {
            return;
        }
        let first = stage
            .speed
            .first_output_timestamp
            .or_else(|| self.queue.front_timestamp())
            .unwrap_or(0);
        self.queue.retime(old, speed, first);

        stage.speed.output_samples = (stage.speed.output_samples as f64 * old / speed).round() as usize;
        stage.speed.previous = old;
        stage.speed.current = speed;
        if let Some(resampler) = stage.resampler.as_mut() {
            resampler.set_speed(speed);
        }
        drop(stage);

        info!("⏩ 播放速率: ×{} → ×{}", old, speed);
        self.events.emit(PipelineEvent::SpeedChanged { from: old, to: speed });
    }

    pub fn speed(&self) -> SpeedState {
        self.stage.lock().speed
    }

    /// seek 后丢弃在目标（含）之前结束的帧
    pub fn set_seek_target(&self, target: Option<i64>) {
        self.timing.lock().seek_target = target;
    }

    pub fn frame_queue(&self) -> &Arc<AudioFrameQueue> {
        &self.queue
    }
}

impl DecodeBody for AudioBody {
    fn component(&self) -> Component {
        Component::AudioDecoder
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn send(&self, packet: &Packet, out: &mut VecDeque<DecodedFrame>) -> Result<()> {
        let mut codec = self.codec.lock();
        let codec = codec.as_mut().ok_or(PipelineError::NotOpened)?;
        feed_packet(codec.as_mut(), packet, out)
    }

    fn send_eof(&self, out: &mut VecDeque<DecodedFrame>) -> Result<()> {
        let mut codec = self.codec.lock();
        let codec = codec.as_mut().ok_or(PipelineError::NotOpened)?;
        drain_codec(codec.as_mut(), out)
    }

    fn process(&self, frame: &DecodedFrame, status: &StatusCell) -> Result<()> {
        let DecodedFrame::Audio(audio) = frame else {
            return Ok(());
        };
        self.check_format(audio.spec);

        let timestamp = self.frame_timestamp(audio, &self.timing.lock());
        let end = timestamp + audio.duration_us();

        if !self.pass_av_gate(end) {
            self.timing.lock().next_timestamp = Some(end);
            return Ok(());
        }
        {
            let mut timing = self.timing.lock();
            if let Some(target) = timing.seek_target {
                if end <= target {
                    timing.next_timestamp = Some(end);
                    return Ok(());
                }
                debug!("🎯 音频 seek 对齐: 目标 {}us，首帧 {}us", target, timestamp);
                timing.seek_target = None;
            }
        }

        wait_for_space(status, |timeout| self.queue.wait_not_full(timeout))?;

        {
            let mut stage = self.stage.lock();
            let Some(resampler) = stage.resampler.as_mut() else {
                return Err(PipelineError::DecodeError("音频转换器未初始化".to_string()));
            };
            let samples = resampler.process(&audio.samples);
            self.emit(&mut stage, Some(timestamp), samples);
        }
        self.timing.lock().next_timestamp = Some(end);
        Ok(())
    }

    fn finish(&self, status: &StatusCell) -> Result<()> {
        wait_for_space(status, |timeout| self.queue.wait_not_full(timeout))?;
        let mut stage = self.stage.lock();
        let tail = match stage.resampler.as_mut() {
            Some(resampler) => resampler.drain(),
            None => return Ok(()),
        };
        self.emit(&mut stage, None, tail);
        Ok(())
    }

    fn flush(&self) {
        if let Some(codec) = self.codec.lock().as_mut() {
            codec.flush();
        }
        {
            let mut timing = self.timing.lock();
            timing.next_timestamp = None;
            timing.seek_target = None;
            timing.gate_released = false;
        }
        {
            let mut stage = self.stage.lock();
            if let Some(resampler) = stage.resampler.as_mut() {
                resampler.reset();
            }
            stage.speed.first_output_timestamp = None;
            stage.speed.output_samples = 0;
            self.queue.flush();
        }
    }

    fn teardown(&self) {
        self.codec.lock().take();
        self.queue.flush();
    }

    fn is_open(&self) -> bool {
        self.codec.lock().is_some()
    }
}

pub type AudioDecoder = Decoder<AudioBody>;

impl Decoder<AudioBody> {
    /// 打开音频流的解码器
    pub fn open(
        demuxer: &Demuxer,
        stream_index: usize,
        config: &AudioConfig,
        av_sync: Arc<AvSync>,
        events: EventBus,
    ) -> Result<Self> {
        let codec = open_codec_for(demuxer, stream_index, MediaKind::Audio)?;
        let stream = demuxer.stream(stream_index)?;
        let container_start_us = demuxer.start_time_us();
        let stream_start_us = stream
            .start_time_us()
            .map(|ts| ts - container_start_us)
            .unwrap_or(0);

        let queue = Arc::new(AudioFrameQueue::new(
            config.output,
            config.frame_queue_limit,
            config.arena_frame_capacity(),
            events.clone(),
        ));
        let body = AudioBody {
            codec: Mutex::new(Some(codec)),
            time_base: stream.time_base,
            container_start_us,
            stream_start_us,
            timing: Mutex::new(AudioTiming::default()),
            stage: Mutex::new(AudioStage {
                resampler: None,
                speed: SpeedState::default(),
            }),
            queue,
            av_sync,
            output: config.output,
            resync_threshold_us: config.resync_threshold_us,
            events: events.clone(),
        };
        Decoder::assemble(body, demuxer, stream_index, events)
    }

    pub fn frame_queue(&self) -> Arc<AudioFrameQueue> {
        self.body().frame_queue().clone()
    }

    pub fn set_speed(&self, speed: f64) {
        self.body().set_speed(speed)
    }

    pub fn speed(&self) -> f64 {
        self.body().speed().current
    }

    pub fn set_seek_target(&self, target: Option<i64>) {
        self.body().set_seek_target(target)
    }
}
