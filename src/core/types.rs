use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::core::status::Status;

/// 全局时钟单位：微秒
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// 媒体源类型
#[derive(Debug, Clone)]
pub enum MediaSource {
    /// 本地文件路径
    LocalFile(PathBuf),

    /// 网络流 URL
    NetworkStream {
        url: String,
        protocol: StreamProtocol,
    },
}

impl MediaSource {
    /// 从 URL 字符串解析媒体源
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("rtsp://") {
            MediaSource::NetworkStream {
                url: url.to_string(),
                protocol: StreamProtocol::RTSP,
            }
        } else if url.starts_with("rtmp://") {
            MediaSource::NetworkStream {
                url: url.to_string(),
                protocol: StreamProtocol::RTMP,
            }
        } else if url.ends_with(".m3u8") || url.contains("/hls/") {
            MediaSource::NetworkStream {
                url: url.to_string(),
                protocol: StreamProtocol::HLS,
            }
        } else if url.starts_with("http://") || url.starts_with("https://") {
            MediaSource::NetworkStream {
                url: url.to_string(),
                protocol: StreamProtocol::HTTP,
            }
        } else {
            // 默认当作本地文件
            MediaSource::LocalFile(PathBuf::from(url))
        }
    }

    /// 判断是否为网络流
    pub fn is_network_stream(&self) -> bool {
        matches!(self, MediaSource::NetworkStream { .. })
    }

    /// 是否为无界直播源（不允许队列内 seek）
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            MediaSource::NetworkStream {
                protocol: StreamProtocol::RTSP | StreamProtocol::RTMP,
                ..
            }
        )
    }

    /// 协议名（日志用）
    pub fn protocol_name(&self) -> &'static str {
        match self {
            MediaSource::LocalFile(_) => "FILE",
            MediaSource::NetworkStream { protocol, .. } => protocol.as_str(),
        }
    }

    /// 传给引擎的位置字符串
    pub fn location(&self) -> String {
        match self {
            MediaSource::LocalFile(path) => path.to_string_lossy().to_string(),
            MediaSource::NetworkStream { url, .. } => url.clone(),
        }
    }
}

/// 流媒体协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// RTSP - 实时流协议（监控摄像头）
    RTSP,
    /// RTMP - 实时消息协议（直播流）
    RTMP,
    /// HLS - HTTP Live Streaming
    HLS,
    /// HTTP - 普通 HTTP 流
    HTTP,
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::RTSP => "RTSP",
            StreamProtocol::RTMP => "RTMP",
            StreamProtocol::HLS => "HLS",
            StreamProtocol::HTTP => "HTTP",
        }
    }
}

/// 流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Subtitle,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Video, MediaKind::Audio, MediaKind::Subtitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "音频",
            MediaKind::Video => "视频",
            MediaKind::Subtitle => "字幕",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 有理数时间基
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// 时间基单位 → 微秒（四舍五入）
    pub fn to_micros(&self, value: i64) -> i64 {
        rescale_round(value as i128, self.num as i128 * 1_000_000, self.den as i128)
    }

    /// 微秒 → 时间基单位（四舍五入）
    pub fn from_micros(&self, micros: i64) -> i64 {
        rescale_round(micros as i128, self.den as i128, self.num as i128 * 1_000_000)
    }
}

fn rescale_round(value: i128, mul: i128, div: i128) -> i64 {
    if div == 0 {
        return 0;
    }
    let product = value * mul;
    let half = div / 2;
    let rounded = if product >= 0 {
        (product + half) / div
    } else {
        (product - half) / div
    };
    rounded as i64
}

/// 压缩数据包
///
/// 由 Demuxer 读取，交给恰好一个解码器队列；解码后或队列清空时释放
#[derive(Debug, Clone)]
pub struct Packet {
    /// 所属流的索引
    pub stream_index: usize,
    /// 流类型（由 Demuxer 按流表分类）
    pub kind: MediaKind,
    /// 显示时间戳（流时间基，None 表示无时间戳）
    pub pts: Option<i64>,
    /// 解码时间戳（流时间基）
    pub dts: Option<i64>,
    /// 时长（流时间基）
    pub duration: i64,
    /// 时间基
    pub time_base: Rational,
    /// 是否为关键帧
    pub keyframe: bool,
    /// 压缩数据
    pub data: Bytes,
}

impl Packet {
    pub fn new(kind: MediaKind, stream_index: usize, time_base: Rational, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            kind,
            pts: None,
            dts: None,
            duration: 0,
            time_base,
            keyframe: false,
            data: data.into(),
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self.dts = Some(pts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    /// 数据大小（字节）
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// 显示时间戳（绝对微秒）
    pub fn timestamp_us(&self) -> Option<i64> {
        self.pts.map(|pts| self.time_base.to_micros(pts))
    }

    pub fn duration_us(&self) -> i64 {
        self.time_base.to_micros(self.duration.max(0))
    }

    /// 结束时间（绝对微秒）
    pub fn end_us(&self) -> Option<i64> {
        self.timestamp_us().map(|ts| ts + self.duration_us())
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
    Unknown,
}

impl PixelFormat {
    /// 一帧画面的字节数（未知格式返回 0）
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::RGBA => pixels * 4,
            PixelFormat::RGB => pixels * 3,
            PixelFormat::YUV420P | PixelFormat::NV12 => pixels * 3 / 2,
            PixelFormat::Unknown => 0,
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    I16,
    I32,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// 音频参数（采样格式、采样率、声道数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for AudioSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch/{:?}", self.sample_rate, self.channels, self.sample_format)
    }
}

/// 视频参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSpec {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// 帧率（帧/秒，有理数）
    pub frame_rate: Rational,
}

/// 流描述信息（发现后不可变）
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: Rational,
    /// 起始时间（流时间基）
    pub start_time: Option<i64>,
    /// 时长（流时间基）
    pub duration: Option<i64>,
    pub codec_name: String,
    pub audio: Option<AudioSpec>,
    pub video: Option<VideoSpec>,
}

impl StreamDescriptor {
    /// 起始时间（绝对微秒）
    pub fn start_time_us(&self) -> Option<i64> {
        self.start_time.map(|t| self.time_base.to_micros(t))
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.duration.map(|d| self.time_base.to_micros(d))
    }

    /// 视频帧间隔（微秒），帧率未知时返回 None
    pub fn frame_duration_us(&self) -> Option<i64> {
        let rate = self.video?.frame_rate;
        if !rate.is_valid() {
            return None;
        }
        Some(MICROS_PER_SECOND * rate.den as i64 / rate.num as i64)
    }
}

/// 缓冲状态信息（用于监控和调试）
#[derive(Debug, Clone, Default)]
pub struct BufferStatus {
    /// 视频数据包队列长度
    pub video_packets: usize,

    /// 音频数据包队列长度
    pub audio_packets: usize,

    /// 字幕数据包队列长度
    pub subtitle_packets: usize,

    /// 视频帧队列长度
    pub video_frames: usize,

    /// 音频帧队列长度
    pub audio_frames: usize,

    /// 已缓冲时长（微秒）
    pub buffered_duration: i64,

    /// 是否正在缓冲（解码器等待数据包）
    pub is_buffering: bool,

    /// 缓冲进度 (0.0 - 1.0)
    pub buffer_progress: f32,

    /// Demuxer 状态
    pub demuxer_status: Option<Status>,
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Opening,
    Playing,
    Paused,
    Seeking,
    Buffering,
    Stopped,
    Error,
}

/// 媒体信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: i64,          // 总时长（微秒）
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub has_subtitles: bool,
    pub is_live: bool,
}

/// 播放器状态信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub state: PlaybackState,
    pub position: i64,          // 当前位置（微秒）
    pub duration: i64,          // 总时长（微秒）
    pub speed: f64,             // 播放速率
    pub media_info: Option<MediaInfo>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            position: 0,
            duration: 0,
            speed: 1.0,
            media_info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_source_from_url() {
        assert!(matches!(
            MediaSource::from_url("rtsp://cam/1"),
            MediaSource::NetworkStream { protocol: StreamProtocol::RTSP, .. }
        ));
        assert!(MediaSource::from_url("rtmp://live/x").is_live());
        assert!(!MediaSource::from_url("https://cdn/a.m3u8").is_live());
        assert!(matches!(MediaSource::from_url("/tmp/a.mkv"), MediaSource::LocalFile(_)));
        assert_eq!(MediaSource::from_url("https://cdn/a.m3u8").protocol_name(), "HLS");
        assert_eq!(MediaSource::from_url("/tmp/a.mkv").protocol_name(), "FILE");
    }

    #[test]
    fn test_rational_rescale() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(tb.to_micros(90_000), 1_000_000);
        assert_eq!(tb.from_micros(1_000_000), 90_000);
        let audio = Rational::new(1, 48_000);
        assert_eq!(audio.to_micros(1024), 21_333);
        assert_eq!(audio.to_micros(-1024), -21_333);
    }

    #[test]
    fn test_packet_timestamps() {
        let packet = Packet::new(MediaKind::Video, 0, Rational::new(1, 1000), vec![1, 2, 3])
            .with_pts(2_000)
            .with_duration(40);
        assert_eq!(packet.timestamp_us(), Some(2_000_000));
        assert_eq!(packet.end_us(), Some(2_040_000));
        assert_eq!(packet.byte_size(), 3);
    }
}
