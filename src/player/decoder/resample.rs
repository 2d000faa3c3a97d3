use log::debug;

use crate::core::{AudioSpec, OutputFormat};

/// 音频转换：声道重排 + 线性插值变采样率 + 变速
///
/// 步长 = 输入采样率 / 输出采样率 × 速率，速率改变只影响之后的输出
#[derive(Debug, Clone)]
pub struct AudioResampler {
    in_rate: u32,
    in_channels: usize,
    out_rate: u32,
    out_channels: usize,
    speed: f64,
    step: f64,
    /// 相对 backlog 起点的读位置（采样帧，带小数）
    pos: f64,
    /// 已重排为输出声道数的交错样本
    backlog: Vec<f32>,
}

impl AudioResampler {
    pub fn new(input: AudioSpec, output: OutputFormat, speed: f64) -> Self {
        debug!(
            "🔧 初始化音频转换: {}Hz/{}ch → {}Hz/{}ch ×{}",
            input.sample_rate, input.channels, output.sample_rate, output.channels, speed
        );
        let mut resampler = Self {
            in_rate: input.sample_rate.max(1),
            in_channels: input.channels.max(1) as usize,
            out_rate: output.sample_rate.max(1),
            out_channels: output.channels.max(1) as usize,
            speed,
            step: 1.0,
            pos: 0.0,
            backlog: Vec::new(),
        };
        resampler.set_speed(speed);
        resampler
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
        self.step = self.in_rate as f64 / self.out_rate as f64 * speed;
    }

    pub fn reset(&mut self) {
        self.backlog.clear();
        self.pos = 0.0;
    }

    fn backlog_frames(&self) -> usize {
        self.backlog.len() / self.out_channels
    }

    /// 输入声道 → 输出声道（多余声道按 i % out 分组取平均，不足时复制）
    fn remix_into(&mut self, input: &[f32]) {
        let in_ch = self.in_channels;
        let out_ch = self.out_channels;
        for frame in input.chunks_exact(in_ch) {
            if in_ch == out_ch {
                self.backlog.extend_from_slice(frame);
            } else if in_ch > out_ch {
                for c in 0..out_ch {
                    let (sum, n) = frame
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| i % out_ch == c)
                        .fold((0.0f32, 0usize), |(sum, n), (_, s)| (sum + s, n + 1));
                    self.backlog.push(sum / n.max(1) as f32);
                }
            } else {
                for c in 0..out_ch {
                    self.backlog.push(frame[c % in_ch]);
                }
            }
        }
    }

    fn emit(&mut self, out: &mut Vec<f32>, hold_last: bool) {
        let ch = self.out_channels;
        let frames = self.backlog_frames();
        loop {
            let base = self.pos.floor() as usize;
            if base + 1 >= frames && !(hold_last && base < frames) {
                break;
            }
            let next = (base + 1).min(frames - 1);
            let frac = (self.pos - base as f64) as f32;
            for c in 0..ch {
                let a = self.backlog[base * ch + c];
                let b = self.backlog[next * ch + c];
                out.push(a + (b - a) * frac);
            }
            self.pos += self.step;
        }
        let consumed = (self.pos.floor() as usize).min(frames);
        self.backlog.drain(..consumed * ch);
        self.pos -= consumed as f64;
    }

    /// 转换一帧交错样本，返回输出声道数的交错样本
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        self.remix_into(input);
        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + self.out_channels);
        self.emit(&mut out, false);
        out
    }

    /// 输出剩余积压（输入结束时调用）
    pub fn drain(&mut self) -> Vec<f32> {
        let mut out = Vec::new();
        if self.backlog_frames() > 0 {
            self.emit(&mut out, true);
        }
        self.reset();
        out
    }
}

/// 线性插值把交错样本拉伸/压缩到指定帧数
pub fn stretch(samples: &[f32], channels: usize, frames: usize) -> Vec<f32> {
    let channels = channels.max(1);
    let src_frames = samples.len() / channels;
    let mut out = vec![0.0; frames * channels];
    if src_frames == 0 || frames == 0 {
        return out;
    }
    let ratio = if frames > 1 {
        (src_frames - 1) as f64 / (frames - 1) as f64
    } else {
        0.0
    };
    for i in 0..frames {
        let pos = i as f64 * ratio;
        let base = pos.floor() as usize;
        let next = (base + 1).min(src_frames - 1);
        let frac = (pos - base as f64) as f32;
        for c in 0..channels {
            let a = samples[base * channels + c];
            let b = samples[next * channels + c];
            out[i * channels + c] = a + (b - a) * frac;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SampleFormat;

    fn spec(rate: u32, channels: u16) -> AudioSpec {
        AudioSpec {
            sample_format: SampleFormat::F32,
            sample_rate: rate,
            channels,
        }
    }

    fn output(rate: u32, channels: u16) -> OutputFormat {
        OutputFormat {
            sample_rate: rate,
            channels,
            sample_format: SampleFormat::F32,
        }
    }

    #[test]
    fn test_identity_conversion_preserves_count() {
        let mut resampler = AudioResampler::new(spec(48_000, 2), output(48_000, 2), 1.0);
        let input: Vec<f32> = (0..2048).map(|i| (i / 2) as f32).collect();
        let first = resampler.process(&input);
        // 线性插值保留一帧用于下一次插值
        assert_eq!(first.len(), 1023 * 2);
        let rest = resampler.drain();
        assert_eq!(rest.len(), 2);
        assert_eq!(first[2], 1.0);
    }

    #[test]
    fn test_double_speed_halves_output() {
        let mut resampler = AudioResampler::new(spec(48_000, 1), output(48_000, 1), 2.0);
        let mut total = 0;
        for _ in 0..10 {
            total += resampler.process(&[0.5; 1024]).len();
        }
        assert!((total as i64 - 5_120).abs() <= 1, "total = {}", total);
    }

    #[test]
    fn test_downmix_averages_channel_groups() {
        let mut resampler = AudioResampler::new(spec(48_000, 4), output(48_000, 2), 1.0);
        let out = resampler.process(&[1.0, 0.0, 3.0, 2.0, 1.0, 0.0, 3.0, 2.0]);
        assert_eq!(out, vec![2.0, 1.0]);
    }

    #[test]
    fn test_rate_conversion_ratio() {
        let mut resampler = AudioResampler::new(spec(24_000, 1), output(48_000, 1), 1.0);
        let out = resampler.process(&[0.0; 1000]);
        // 999 个插值区间，每个区间 2 个输出
        assert_eq!(out.len(), 1998);
    }

    #[test]
    fn test_stretch_endpoints() {
        let out = stretch(&[0.0, 10.0, 1.0, 11.0], 2, 3);
        assert_eq!(out, vec![0.0, 10.0, 0.5, 10.5, 1.0, 11.0]);
    }
}
