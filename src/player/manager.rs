use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::Arc;
use std::thread;

use crate::core::{
    AudioFrame, BufferStatus, EventBus, MediaInfo, MediaKind, MediaSource, PipelineConfig, PipelineError, PipelineEvent,
    PlaybackClock, PlaybackState, PlayerState, Result, Status, SubtitleFrame, VideoFrame,
};
use crate::player::decoder::{AudioDecoder, AudioFrameQueue, AvSync, SubtitleDecoder, VideoDecoder};
use crate::player::demuxer::Demuxer;
use crate::player::engine::MediaEngine;
use crate::player::queue::BoundedQueue;
use crate::player::recording::RecordingSink;
use crate::renderer::{CpuRenderer, Renderer};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 已打开的一条管线：Demuxer + 各类型解码器
struct Pipeline {
    demuxer: Demuxer,
    video: Option<VideoDecoder>,
    audio: Option<AudioDecoder>,
    subtitle: Option<SubtitleDecoder>,
    media_info: MediaInfo,
}

impl Pipeline {
    fn start_decoders(&self) -> Result<()> {
        if let Some(video) = &self.video {
            video.start()?;
        }
        if let Some(audio) = &self.audio {
            audio.start()?;
        }
        if let Some(subtitle) = &self.subtitle {
            subtitle.start()?;
        }
        Ok(())
    }

    fn pause_decoders(&self) {
        if let Some(video) = &self.video {
            video.pause();
        }
        if let Some(audio) = &self.audio {
            audio.pause();
        }
        if let Some(subtitle) = &self.subtitle {
            subtitle.pause();
        }
    }

    fn flush_decoders(&self) {
        if let Some(video) = &self.video {
            video.flush();
        }
        if let Some(audio) = &self.audio {
            audio.flush();
        }
        if let Some(subtitle) = &self.subtitle {
            subtitle.flush();
        }
    }

    /// 解码器先停（释放编解码器并摘除流），最后关闭容器
    fn shutdown(&self) {
        if let Some(subtitle) = &self.subtitle {
            subtitle.stop();
        }
        if let Some(audio) = &self.audio {
            audio.stop();
        }
        if let Some(video) = &self.video {
            video.stop();
        }
        self.demuxer.close();
    }

    fn statuses(&self) -> Vec<Status> {
        let mut statuses = vec![self.demuxer.status()];
        statuses.extend(self.video.as_ref().map(|d| d.status()));
        statuses.extend(self.audio.as_ref().map(|d| d.status()));
        statuses.extend(self.subtitle.as_ref().map(|d| d.status()));
        statuses
    }
}

/// 播放会话 - 统一管理解封装、解码与播放时钟
///
/// 打开后各工作线程立即开始预缓冲，时钟保持暂停，直到 `play()`
pub struct PlaybackSession {
    config: PipelineConfig,
    events: EventBus,
    renderer: Arc<dyn Renderer>,
    clock: PlaybackClock,
    av_sync: Arc<AvSync>,
    pipeline: Option<Pipeline>,
    state: Mutex<PlayerState>,
}

impl PlaybackSession {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_renderer(config, Arc::new(CpuRenderer::new()))
    }

    pub fn with_renderer(config: PipelineConfig, renderer: Arc<dyn Renderer>) -> Result<Self> {
        config.validate()?;
        info!("{} 🎬 创建播放会话", log_ctx());
        Ok(Self {
            config,
            events: EventBus::new(),
            renderer,
            clock: PlaybackClock::new(),
            av_sync: Arc::new(AvSync::new()),
            pipeline: None,
            state: Mutex::new(PlayerState::default()),
        })
    }

    /// 打开媒体源，每种类型取第一个流
    ///
    /// 视频解码器先于音频打开，音频起点门限因此在第一帧音频前就已就位
    pub fn open(&mut self, engine: &dyn MediaEngine, source: &MediaSource) -> Result<MediaInfo> {
        self.stop();
        self.set_state(PlaybackState::Opening);

        let pipeline = match self.assemble(engine, source) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!("{} ❌ 打开失败: {}", log_ctx(), e);
                self.set_state(PlaybackState::Error);
                return Err(e);
            }
        };

        if let Err(e) = pipeline.demuxer.start().and_then(|_| pipeline.start_decoders()) {
            error!("{} ❌ 启动工作线程失败: {}", log_ctx(), e);
            pipeline.shutdown();
            self.set_state(PlaybackState::Error);
            return Err(e);
        }

        let media_info = pipeline.media_info.clone();
        self.clock.pause();
        self.clock.set_time(0);
        self.clock.set_rate(1.0);
        {
            let mut state = self.state.lock();
            state.state = PlaybackState::Paused;
            state.position = 0;
            state.duration = media_info.duration;
            state.speed = 1.0;
            state.media_info = Some(media_info.clone());
        }
        info!(
            "{} ✅ 会话就绪: {}x{} @ {:.2}fps, {}Hz/{}ch, 时长 {:.1}s{}",
            log_ctx(),
            media_info.width,
            media_info.height,
            media_info.fps,
            media_info.sample_rate,
            media_info.channels,
            media_info.duration as f64 / 1_000_000.0,
            if media_info.is_live { " (直播)" } else { "" }
        );
        self.pipeline = Some(pipeline);
        Ok(media_info)
    }

    fn assemble(&self, engine: &dyn MediaEngine, source: &MediaSource) -> Result<Pipeline> {
        debug!("使用 {} 引擎", engine.name());
        let demuxer = Demuxer::open(engine, source, &self.config, self.events.clone())?;
        let mut media_info = MediaInfo {
            duration: demuxer.duration_us().unwrap_or(0),
            is_live: demuxer.is_live(),
            ..Default::default()
        };

        let video_stream = demuxer.first_stream(MediaKind::Video).cloned();
        let audio_stream = demuxer.first_stream(MediaKind::Audio).cloned();
        let subtitle_stream = demuxer.first_stream(MediaKind::Subtitle).cloned();

        let opened = (|| -> Result<(Option<VideoDecoder>, Option<AudioDecoder>)> {
            let video = match &video_stream {
                Some(stream) => {
                    let decoder = VideoDecoder::open(
                        &demuxer,
                        stream.index,
                        &self.config.video,
                        self.renderer.clone(),
                        self.av_sync.clone(),
                        self.events.clone(),
                    )?;
                    media_info.video_codec = stream.codec_name.clone();
                    if let Some(spec) = stream.video {
                        media_info.width = spec.width;
                        media_info.height = spec.height;
                        if spec.frame_rate.is_valid() {
                            media_info.fps = spec.frame_rate.as_f64();
                        }
                    }
                    Some(decoder)
                }
                None => {
                    self.av_sync.reset();
                    self.av_sync.set_has_video(false);
                    None
                }
            };
            let audio = match &audio_stream {
                Some(stream) => {
                    let decoder = AudioDecoder::open(
                        &demuxer,
                        stream.index,
                        &self.config.audio,
                        self.av_sync.clone(),
                        self.events.clone(),
                    )?;
                    media_info.audio_codec = stream.codec_name.clone();
                    if let Some(spec) = stream.audio {
                        media_info.sample_rate = spec.sample_rate;
                        media_info.channels = spec.channels;
                    }
                    Some(decoder)
                }
                None => None,
            };
            Ok((video, audio))
        })();

        let (video, audio) = match opened {
            Ok(decoders) => decoders,
            Err(e) => {
                demuxer.close();
                return Err(e);
            }
        };

        // 字幕打不开不影响播放
        let subtitle = subtitle_stream.and_then(|stream| {
            match SubtitleDecoder::open(&demuxer, stream.index, &self.config.subtitle, self.events.clone()) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    warn!("{} ⚠ 字幕流 #{} 打开失败，忽略: {}", log_ctx(), stream.index, e);
                    None
                }
            }
        });
        media_info.has_subtitles = subtitle.is_some();

        Ok(Pipeline {
            demuxer,
            video,
            audio,
            subtitle,
            media_info,
        })
    }

    /// 开始/继续播放
    pub fn play(&self) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or(PipelineError::NotOpened)?;
        pipeline.demuxer.start()?;
        pipeline.start_decoders()?;
        self.clock.play();
        self.set_state(PlaybackState::Playing);
        info!("{} ▶️ 播放 @{}us", log_ctx(), self.clock.now());
        Ok(())
    }

    /// 暂停：只停时钟，工作线程继续预缓冲直到队列满
    pub fn pause(&self) -> Result<()> {
        if self.pipeline.is_none() {
            return Err(PipelineError::NotOpened);
        }
        self.clock.pause();
        self.set_state(PlaybackState::Paused);
        info!("{} ⏸️ 暂停 @{}us", log_ctx(), self.clock.now());
        Ok(())
    }

    /// 停止并释放整条管线；未打开时为空操作
    pub fn stop(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        info!("{} ⏹️ 停止播放", log_ctx());
        self.clock.pause();
        pipeline.shutdown();
        let mut state = self.state.lock();
        state.state = PlaybackState::Stopped;
        state.position = self.clock.now();
    }

    /// 跳转到指定位置（微秒，相对容器起点）
    ///
    /// 优先在已缓冲的包中移动；落不进缓冲窗口时才让容器 seek
    pub fn seek(&self, position: i64, forward: bool) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or(PipelineError::NotOpened)?;
        let position = match pipeline.media_info.duration {
            d if d > 0 => position.clamp(0, d),
            _ => position.max(0),
        };
        let resume = {
            let mut state = self.state.lock();
            let previous = state.state;
            state.state = PlaybackState::Seeking;
            previous
        };
        info!("{} ⏩ Seek → {}us ({})", log_ctx(), position, if forward { "向前" } else { "向后" });

        pipeline.pause_decoders();
        if !pipeline.demuxer.seek_in_queue(position, forward) {
            pipeline.demuxer.seek(position, forward)?;
        }
        pipeline.flush_decoders();
        if let Some(audio) = &pipeline.audio {
            audio.set_seek_target(Some(position));
        }
        self.clock.set_time(position);

        // 之前已读到结尾的线程需要重建
        pipeline.demuxer.start()?;
        pipeline.start_decoders()?;

        let restored = match resume {
            PlaybackState::Seeking | PlaybackState::Buffering => PlaybackState::Playing,
            PlaybackState::Stopped => PlaybackState::Paused,
            other => other,
        };
        let mut state = self.state.lock();
        state.state = restored;
        state.position = position;
        Ok(())
    }

    /// 设置播放速率，返回实际生效（截断后）的速率
    pub fn set_speed(&self, speed: f64) -> Result<f64> {
        let pipeline = self.pipeline.as_ref().ok_or(PipelineError::NotOpened)?;
        let speed = self.config.audio.clamp_speed(speed);
        if let Some(audio) = &pipeline.audio {
            audio.set_speed(speed);
        }
        self.clock.set_rate(speed);
        self.state.lock().speed = speed;
        debug!("倍速 → {:.2}x", speed);
        Ok(speed)
    }

    pub fn speed(&self) -> f64 {
        self.clock.rate()
    }

    pub fn position(&self) -> i64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn state(&self) -> PlayerState {
        let mut state = self.state.lock().clone();
        state.position = self.clock.now();
        state
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.pipeline.as_ref().map(|p| p.media_info.clone())
    }

    pub fn buffer_status(&self) -> BufferStatus {
        let Some(pipeline) = &self.pipeline else {
            return BufferStatus::default();
        };
        let demuxer = &pipeline.demuxer;
        let buffered_duration = demuxer.buffered_duration();
        let max_buffered = self.config.demuxer.max_buffered_duration_us;
        let buffer_progress = if max_buffered > 0 {
            (buffered_duration as f64 / max_buffered as f64).clamp(0.0, 1.0) as f32
        } else {
            0.0
        };
        let starving = |status: Option<Status>| status == Some(Status::QueueEmpty);
        let is_buffering = !demuxer.is_eof()
            && (starving(pipeline.video.as_ref().map(|d| d.status()))
                || starving(pipeline.audio.as_ref().map(|d| d.status())));

        BufferStatus {
            video_packets: demuxer.buffer_state(MediaKind::Video).packet_count,
            audio_packets: demuxer.buffer_state(MediaKind::Audio).packet_count,
            subtitle_packets: demuxer.buffer_state(MediaKind::Subtitle).packet_count,
            video_frames: pipeline.video.as_ref().map(|d| d.frame_queue().len()).unwrap_or(0),
            audio_frames: pipeline.audio.as_ref().map(|d| d.frame_queue().len()).unwrap_or(0),
            buffered_duration,
            is_buffering,
            buffer_progress,
            demuxer_status: Some(demuxer.status()),
        }
    }

    /// 所有组件都进入 Ended 后折叠为 Stopped，返回是否已播完
    ///
    /// 播完后工作线程保留在 Stopped，仍可 seek 回去继续播放
    pub fn poll_ended(&self) -> bool {
        let Some(pipeline) = &self.pipeline else {
            return false;
        };
        if !pipeline.statuses().iter().all(|s| *s == Status::Ended) {
            return false;
        }
        pipeline.demuxer.take_ended();
        if let Some(video) = &pipeline.video {
            video.take_ended();
        }
        if let Some(audio) = &pipeline.audio {
            audio.take_ended();
        }
        if let Some(subtitle) = &pipeline.subtitle {
            subtitle.take_ended();
        }
        self.clock.pause();
        self.set_state(PlaybackState::Stopped);
        info!("{} 🏁 播放结束 @{}us", log_ctx(), self.clock.now());
        true
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn demuxer(&self) -> Option<&Demuxer> {
        self.pipeline.as_ref().map(|p| &p.demuxer)
    }

    pub fn video_decoder(&self) -> Option<&VideoDecoder> {
        self.pipeline.as_ref().and_then(|p| p.video.as_ref())
    }

    pub fn audio_decoder(&self) -> Option<&AudioDecoder> {
        self.pipeline.as_ref().and_then(|p| p.audio.as_ref())
    }

    pub fn subtitle_decoder(&self) -> Option<&SubtitleDecoder> {
        self.pipeline.as_ref().and_then(|p| p.subtitle.as_ref())
    }

    pub fn video_frames(&self) -> Option<Arc<BoundedQueue<VideoFrame>>> {
        self.video_decoder().map(|d| d.frame_queue())
    }

    pub fn audio_frames(&self) -> Option<Arc<AudioFrameQueue>> {
        self.audio_decoder().map(|d| d.frame_queue())
    }

    pub fn subtitle_frames(&self) -> Option<Arc<BoundedQueue<SubtitleFrame>>> {
        self.subtitle_decoder().map(|d| d.frame_queue())
    }

    /// 取出到 `now` 为止应显示的视频帧
    ///
    /// 已经过时的帧被跳过，只返回最新一帧；还没到时间则返回 None
    pub fn video_frame_for_time(&self, now: i64) -> Option<VideoFrame> {
        let queue = self.video_frames()?;
        let mut due = None;
        while queue.front().is_some_and(|f| f.timestamp <= now) {
            match queue.try_pop() {
                Some(frame) => {
                    if let Some(skipped) = due.replace(frame) {
                        debug!("跳过过时视频帧 @{}us", skipped.timestamp);
                    }
                }
                None => break,
            }
        }
        due
    }

    /// 取出到 `now` 为止应播放的音频帧（最多一帧）
    pub fn audio_frame_for_time(&self, now: i64) -> Option<AudioFrame> {
        let queue = self.audio_frames()?;
        match queue.front_timestamp() {
            Some(ts) if ts <= now => queue.pop(),
            _ => None,
        }
    }

    /// 当前时间应显示的字幕；已结束的字幕被出队丢弃
    pub fn current_subtitle(&self, now: i64) -> Option<SubtitleFrame> {
        let queue = self.subtitle_frames()?;
        while queue.front().is_some_and(|s| s.end_timestamp <= now) {
            queue.try_pop();
        }
        queue
            .front()
            .filter(|s| s.timestamp <= now && now < s.end_timestamp)
    }

    /// 录制已解封装的包（透传给 Demuxer）
    pub fn start_recording(&self, sink: Box<dyn RecordingSink>, start_time: Option<i64>) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or(PipelineError::NotOpened)?;
        pipeline.demuxer.start_recording(sink, start_time);
        info!("{} ⏺️ 开始录制", log_ctx());
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or(PipelineError::NotOpened)?;
        pipeline.demuxer.stop_recording()?;
        info!("{} ⏹️ 停止录制", log_ctx());
        Ok(())
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.lock().state = state;
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}
