// 管线配置（JSON 加载，缺省字段取默认值）

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::error::{PipelineError, Result};
use crate::core::frame::OutputFormat;
use crate::core::types::{MediaKind, SampleFormat};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub demuxer: DemuxerConfig,
    pub timeouts: Timeouts,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub subtitle: SubtitleConfig,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.demuxer;
        if d.max_video_packets == 0 || d.max_audio_packets == 0 || d.max_subtitle_packets == 0 {
            return Err(invalid("数据包队列容量必须大于 0"));
        }
        if d.max_buffered_duration_us <= 0 {
            return Err(invalid("max_buffered_duration_us 必须为正"));
        }
        if d.keyframe_tolerance_us < 0 || d.in_queue_tolerance_us < 0 {
            return Err(invalid("seek 容差不能为负"));
        }

        let a = &self.audio;
        if a.output.sample_rate == 0 || a.output.channels == 0 {
            return Err(invalid("音频输出格式无效"));
        }
        if !matches!(a.output.sample_format, SampleFormat::F32 | SampleFormat::I16) {
            return Err(invalid("音频输出仅支持 f32 / i16"));
        }
        if a.frame_queue_limit == 0 || a.max_frame_samples == 0 {
            return Err(invalid("音频帧队列参数必须大于 0"));
        }
        if !(a.speed_min > 0.0 && a.speed_min <= 1.0 && a.speed_max >= 1.0) {
            return Err(invalid("速率范围必须满足 0 < min <= 1 <= max"));
        }

        if self.video.frame_queue_size == 0 || self.subtitle.frame_queue_size == 0 {
            return Err(invalid("帧队列容量必须大于 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> PipelineError {
    PipelineError::InvalidConfig(msg.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxerConfig {
    pub max_video_packets: usize,
    pub max_audio_packets: usize,
    pub max_subtitle_packets: usize,
    /// 跟踪流的缓冲时长上限（微秒）
    pub max_buffered_duration_us: i64,
    /// 连续读错误预算
    pub max_read_errors: u32,
    /// 读操作忽略显式中断请求（仅超时与停止生效）
    pub suppress_read_interrupts: bool,
    /// 尚未观察到关键帧间隔时使用的视频容差（微秒）
    pub keyframe_tolerance_us: i64,
    /// 音频跟踪流的队列内 seek 容差（微秒）
    pub in_queue_tolerance_us: i64,
    /// 背压等待时的状态复查间隔（毫秒）
    pub backpressure_recheck_ms: u64,
}

impl DemuxerConfig {
    pub fn max_packets(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Video => self.max_video_packets,
            MediaKind::Audio => self.max_audio_packets,
            MediaKind::Subtitle => self.max_subtitle_packets,
        }
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.backpressure_recheck_ms.max(1))
    }
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        Self {
            // 视频：200 packets ≈ 8秒（25fps）
            // 音频：150 packets ≈ 3秒（48kHz）
            max_video_packets: 200,
            max_audio_packets: 150,
            max_subtitle_packets: 64,
            max_buffered_duration_us: 5_000_000,
            max_read_errors: 3,
            suppress_read_interrupts: false,
            keyframe_tolerance_us: 2_000_000,
            in_queue_tolerance_us: 100_000,
            backpressure_recheck_ms: 20,
        }
    }
}

/// 各类阻塞操作的超时（毫秒），从 `begin` 开始计时
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub open_ms: u64,
    pub read_ms: u64,
    pub seek_ms: u64,
    pub close_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open_ms: 10_000,
            read_ms: 5_000,
            seek_ms: 5_000,
            close_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub output: OutputFormat,
    pub frame_queue_limit: usize,
    /// 单个解码帧的最大采样数（用于估算环形缓冲区单帧容量）
    pub max_frame_samples: usize,
    pub speed_min: f64,
    pub speed_max: f64,
    /// 输出时间戳与输入时间戳偏差超过该值时重新锚定（微秒）
    pub resync_threshold_us: i64,
}

impl AudioConfig {
    /// 环形缓冲区单帧容量（采样帧）：最慢速率下的最大帧
    pub fn arena_frame_capacity(&self) -> usize {
        (self.max_frame_samples as f64 / self.speed_min).ceil() as usize
    }

    pub fn clamp_speed(&self, speed: f64) -> f64 {
        speed.clamp(self.speed_min, self.speed_max)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output: OutputFormat::default(),
            frame_queue_limit: 16,
            max_frame_samples: 8192,
            speed_min: 0.25,
            speed_max: 4.0,
            resync_threshold_us: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub frame_queue_size: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self { frame_queue_size: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleConfig {
    pub frame_queue_size: usize,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self { frame_queue_size: 16 }
    }
}
