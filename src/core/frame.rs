// 解码帧与输出帧

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::types::{AudioSpec, PixelFormat, SampleFormat, MICROS_PER_SECOND};

/// 引擎输出的音频帧（交错 f32，已归一化）
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// 引擎给出的 best-effort 时间戳（流时间基）
    pub best_effort_timestamp: Option<i64>,
    /// 源格式（用于格式变化检测）
    pub spec: AudioSpec,
    /// 每声道样本数
    pub nb_samples: usize,
    /// 交错样本
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn duration_us(&self) -> i64 {
        if self.spec.sample_rate == 0 {
            return 0;
        }
        self.nb_samples as i64 * MICROS_PER_SECOND / self.spec.sample_rate as i64
    }
}

/// 引擎输出的视频画面
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub best_effort_timestamp: Option<i64>,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

/// 引擎输出的字幕
#[derive(Debug, Clone)]
pub struct DecodedSubtitle {
    pub best_effort_timestamp: Option<i64>,
    /// 显示时长（微秒），None 表示未知
    pub duration: Option<i64>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Audio(DecodedAudio),
    Video(DecodedPicture),
    Subtitle(DecodedSubtitle),
}

/// 音频输出格式（通过配置显式传入管线构造）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl OutputFormat {
    /// 一个采样帧（所有声道）的字节数
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    /// 一个输出采样帧对应的微秒数
    pub fn sample_period_us(&self) -> f64 {
        MICROS_PER_SECOND as f64 / self.sample_rate as f64
    }

    /// 采样帧数 → 实际播放时长（微秒）
    pub fn frames_to_us(&self, frames: usize) -> i64 {
        (frames as f64 * self.sample_period_us()).round() as i64
    }

    /// 交错 f32 → 输出字节
    pub fn encode(&self, samples: &[f32]) -> Vec<u8> {
        match self.sample_format {
            SampleFormat::I16 => {
                let converted: Vec<i16> = samples
                    .iter()
                    .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                bytemuck::cast_slice(&converted).to_vec()
            }
            _ => bytemuck::cast_slice(samples).to_vec(),
        }
    }

    /// 输出字节 → 交错 f32
    pub fn decode(&self, bytes: &[u8]) -> Vec<f32> {
        match self.sample_format {
            SampleFormat::I16 => bytes
                .chunks_exact(2)
                .map(|b| i16::from_ne_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                .collect(),
            _ => bytes
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::F32,
        }
    }
}

/// 音频帧数据（出队时从环形缓冲区拷贝而来）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub timestamp: i64,     // 显示时间戳（微秒，媒体时间）
    pub duration: i64,      // 实际播放时长（微秒）
    pub frames: usize,      // 采样帧数
    pub format: OutputFormat,
    pub data: Vec<u8>,
}

/// 渲染器返回的可呈现句柄
#[derive(Debug, Clone)]
pub struct PresentableImage {
    pub id: u64,
    /// CPU 内存数据（纹理后端可为空）
    pub data: Option<Bytes>,
}

/// 视频帧数据
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub timestamp: i64,     // 显示时间戳（微秒）
    pub duration: i64,      // 帧持续时间（微秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub keyframe: bool,
    pub image: PresentableImage,
}

/// 字幕帧数据
#[derive(Debug, Clone)]
pub struct SubtitleFrame {
    pub timestamp: i64,     // 开始显示时间戳（微秒）
    pub duration: i64,      // 显示持续时间（微秒）
    pub text: String,       // 字幕文本
    pub end_timestamp: i64, // 结束显示时间戳（微秒）
}
