use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::frame::DecodedFrame;
use crate::core::{
    Component, EventBus, MediaKind, Packet, PipelineError, Rational, Result, StatusCell, SubtitleConfig,
    SubtitleFrame,
};
use crate::player::decoder::{drain_codec, feed_packet, open_codec_for, wait_for_space, DecodeBody, Decoder};
use crate::player::demuxer::Demuxer;
use crate::player::engine::CodecContext;
use crate::player::queue::BoundedQueue;

/// 未给出显示时长的字幕默认显示 3 秒
const DEFAULT_CUE_DURATION_US: i64 = 3_000_000;

pub struct SubtitleBody {
    codec: Mutex<Option<Box<dyn CodecContext>>>,
    time_base: Rational,
    container_start_us: i64,
    next_timestamp: Mutex<Option<i64>>,
    queue: Arc<BoundedQueue<SubtitleFrame>>,
}

impl SubtitleBody {
    pub fn frame_queue(&self) -> &Arc<BoundedQueue<SubtitleFrame>> {
        &self.queue
    }
}

impl DecodeBody for SubtitleBody {
    fn component(&self) -> Component {
        Component::SubtitleDecoder
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Subtitle
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
        let DecodedFrame::Subtitle(cue) = frame else {
            return Ok(());
        };
        let text = clean_subtitle_text(&cue.text);
        if text.is_empty() {
            return Ok(());
        }

        let timestamp = match cue.best_effort_timestamp {
            Some(ts) => self.time_base.to_micros(ts) - self.container_start_us,
            None => self.next_timestamp.lock().unwrap_or(0),
        };
        let duration = cue.duration.filter(|d| *d > 0).unwrap_or(DEFAULT_CUE_DURATION_US);

        wait_for_space(status, |timeout| self.queue.wait_not_full(timeout))?;

        debug!("💬 字幕 @{}us +{}us: {}", timestamp, duration, text);
        let cue = SubtitleFrame {
            timestamp,
            duration,
            text,
            end_timestamp: timestamp + duration,
        };
        if self.queue.try_push(cue).is_err() {
            warn!("⚠ 字幕入队失败 @{}us", timestamp);
        }
        *self.next_timestamp.lock() = Some(timestamp + duration);
        Ok(())
    }

    fn flush(&self) {
        if let Some(codec) = self.codec.lock().as_mut() {
            codec.flush();
        }
        *self.next_timestamp.lock() = None;
        self.queue.flush();
    }

    fn teardown(&self) {
        self.codec.lock().take();
        self.queue.flush();
    }

    fn is_open(&self) -> bool {
        self.codec.lock().is_some()
    }
}

/// 清理字幕文本：移除 ASS 覆盖标签 `{...}` 与 HTML 风格标签，
/// 处理 `\N` `\n` 换行，去掉空行与首尾空白
pub fn clean_subtitle_text(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_ass_tag = false;

    while let Some(ch) = chars.next() {
        match ch {
            '{' => in_ass_tag = true,
            '}' => in_ass_tag = false,
            _ if in_ass_tag => {}
            '<' => {
                let mut tag = String::from('<');
                let mut closed = false;
                while let Some(&next) = chars.peek() {
                    if next == '>' {
                        chars.next();
                        closed = true;
                        break;
                    }
                    if next.is_ascii_alphanumeric() || next == '/' || next.is_whitespace() || next == '=' || next == '"' || next == '#' {
                        tag.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !closed {
                    result.push_str(&tag);
                }
            }
            '\\' => match chars.peek() {
                Some(&'N') | Some(&'n') => {
                    chars.next();
                    result.push('\n');
                }
                Some(&'h') => {
                    chars.next();
                    result.push(' ');
                }
                _ => result.push(ch),
            },
            '\r' => {}
            _ => result.push(ch),
        }
    }

    result
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type SubtitleDecoder = Decoder<SubtitleBody>;

impl Decoder<SubtitleBody> {
    pub fn open(demuxer: &Demuxer, stream_index: usize, config: &SubtitleConfig, events: EventBus) -> Result<Self> {
        let codec = open_codec_for(demuxer, stream_index, MediaKind::Subtitle)?;
        let stream = demuxer.stream(stream_index)?;
        let body = SubtitleBody {
            codec: Mutex::new(Some(codec)),
            time_base: stream.time_base,
            container_start_us: demuxer.start_time_us(),
            next_timestamp: Mutex::new(None),
            queue: Arc::new(BoundedQueue::new(config.frame_queue_size)),
        };
        Decoder::assemble(body, demuxer, stream_index, events)
    }

    pub fn frame_queue(&self) -> Arc<BoundedQueue<SubtitleFrame>> {
        self.body().frame_queue().clone()
    }
}
