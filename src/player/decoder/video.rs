use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::frame::{DecodedFrame, DecodedPicture};
use crate::core::{
    Component, EventBus, MediaKind, Packet, PipelineError, PipelineEvent, PixelFormat, Rational, Result, StatusCell,
    VideoConfig, VideoFrame,
};
use crate::player::decoder::sync::AvSync;
use crate::player::decoder::{drain_codec, feed_packet, open_codec_for, wait_for_space, DecodeBody, Decoder};
use crate::player::demuxer::Demuxer;
use crate::player::engine::CodecContext;
use crate::player::queue::BoundedQueue;
use crate::renderer::Renderer;

/// 帧率未知时的帧间隔（25fps）
const FALLBACK_FRAME_DURATION_US: i64 = 40_000;

#[derive(Debug, Default)]
struct VideoTiming {
    next_timestamp: Option<i64>,
    /// 最近一帧的尺寸与像素格式
    geometry: Option<(u32, u32, PixelFormat)>,
}

pub struct VideoBody {
    codec: Mutex<Option<Box<dyn CodecContext>>>,
    time_base: Rational,
    container_start_us: i64,
    stream_start_us: i64,
    frame_duration_us: i64,
    /// 打开及每次 flush 后置位，直到遇到关键帧
    keyframe_required: AtomicBool,
    timing: Mutex<VideoTiming>,
    av_sync: Arc<AvSync>,
    renderer: Arc<dyn Renderer>,
    queue: Arc<BoundedQueue<VideoFrame>>,
    events: EventBus,
}

impl VideoBody {
    fn frame_timestamp(&self, picture: &DecodedPicture) -> i64 {
        match picture.best_effort_timestamp {
            Some(ts) => self.time_base.to_micros(ts) - self.container_start_us,
            None => self.timing.lock().next_timestamp.unwrap_or(self.stream_start_us),
        }
    }

    fn check_geometry(&self, picture: &DecodedPicture) {
        let geometry = (picture.width, picture.height, picture.format);
        let previous = self.timing.lock().geometry.replace(geometry);
        match previous {
            None => info!("📺 视频画面: {}x{} {:?}", picture.width, picture.height, picture.format),
            Some(previous) if previous != geometry => {
                info!(
                    "🔄 视频格式变化: {}x{} {:?} → {}x{} {:?}",
                    previous.0, previous.1, previous.2, picture.width, picture.height, picture.format
                );
                self.events.emit(PipelineEvent::VideoFormatChanged {
                    width: picture.width,
                    height: picture.height,
                    format: picture.format,
                });
            }
            Some(_) => {}
        }
    }

    pub fn frame_queue(&self) -> &Arc<BoundedQueue<VideoFrame>> {
        &self.queue
    }

    pub fn keyframe_required(&self) -> bool {
        self.keyframe_required.load(Ordering::Acquire)
    }
}

impl DecodeBody for VideoBody {
    fn component(&self) -> Component {
        Component::VideoDecoder
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
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
        let DecodedFrame::Video(picture) = frame else {
            return Ok(());
        };
        let timestamp = self.frame_timestamp(picture);

        if self.keyframe_required() {
            if !picture.keyframe {
                debug!("等待关键帧，丢弃 @{}us", timestamp);
                self.timing.lock().next_timestamp = Some(timestamp + self.frame_duration_us);
                return Ok(());
            }
            self.keyframe_required.store(false, Ordering::Release);
        }

        self.check_geometry(picture);
        // 先于等待发布，音频门限尽早放行
        if self.av_sync.publish_video_start(timestamp) {
            debug!("🎬 视频起点 {}us", timestamp);
        }

        wait_for_space(status, |timeout| self.queue.wait_not_full(timeout))?;

        let image = self.renderer.submit(picture)?;
        let frame = VideoFrame {
            timestamp,
            duration: self.frame_duration_us,
            width: picture.width,
            height: picture.height,
            format: picture.format,
            keyframe: picture.keyframe,
            image,
        };
        if self.queue.try_push(frame).is_err() {
            warn!("⚠ 视频帧入队失败 @{}us", timestamp);
        }
        self.timing.lock().next_timestamp = Some(timestamp + self.frame_duration_us);
        Ok(())
    }

    fn finish(&self, _status: &StatusCell) -> Result<()> {
        // 视频已结束，音频门限直接放行
        self.av_sync.set_has_video(false);
        Ok(())
    }

    fn flush(&self) {
        let open = {
            let mut codec = self.codec.lock();
            if let Some(codec) = codec.as_mut() {
                codec.flush();
            }
            codec.is_some()
        };
        self.keyframe_required.store(true, Ordering::Release);
        self.timing.lock().next_timestamp = None;
        self.queue.flush();
        self.av_sync.reset();
        self.av_sync.set_has_video(open);
    }

    fn teardown(&self) {
        self.codec.lock().take();
        self.queue.flush();
        self.av_sync.set_has_video(false);
    }

    fn is_open(&self) -> bool {
        self.codec.lock().is_some()
    }
}

pub type VideoDecoder = Decoder<VideoBody>;

impl Decoder<VideoBody> {
    pub fn open(
        demuxer: &Demuxer,
        stream_index: usize,
        config: &VideoConfig,
        renderer: Arc<dyn Renderer>,
        av_sync: Arc<AvSync>,
        events: EventBus,
    ) -> Result<Self> {
        let codec = open_codec_for(demuxer, stream_index, MediaKind::Video)?;
        let stream = demuxer.stream(stream_index)?;
        let container_start_us = demuxer.start_time_us();
        let stream_start_us = stream
            .start_time_us()
            .map(|ts| ts - container_start_us)
            .unwrap_or(0);
        let frame_duration_us = stream
            .frame_duration_us()
            .filter(|d| *d > 0)
            .unwrap_or(FALLBACK_FRAME_DURATION_US);

        let sync = av_sync.clone();
        let body = VideoBody {
            codec: Mutex::new(Some(codec)),
            time_base: stream.time_base,
            container_start_us,
            stream_start_us,
            frame_duration_us,
            keyframe_required: AtomicBool::new(true),
            timing: Mutex::new(VideoTiming::default()),
            av_sync,
            renderer,
            queue: Arc::new(BoundedQueue::new(config.frame_queue_size)),
            events: events.clone(),
        };
        let decoder = Decoder::assemble(body, demuxer, stream_index, events)?;
        sync.reset();
        sync.set_has_video(true);
        Ok(decoder)
    }

    pub fn frame_queue(&self) -> Arc<BoundedQueue<VideoFrame>> {
        self.body().frame_queue().clone()
    }
}
