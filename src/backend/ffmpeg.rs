// FFmpeg 引擎（feature = "ffmpeg"）
use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi::{AVDiscard, AVSubtitleType};
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::ffi::CStr;
use std::sync::{Arc, Once};

use crate::core::frame::{DecodedAudio, DecodedFrame, DecodedPicture, DecodedSubtitle};
use crate::core::{
    AudioSpec, EngineError, EngineResult, MediaKind, MediaSource, Packet, PipelineError, PixelFormat, Rational, Result,
    SampleFormat, StreamDescriptor, VideoSpec,
};
use crate::player::engine::{CodecContext, Container, MediaEngine, SeekDirection};
use crate::player::interrupter::Interrupter;

static INIT: Once = Once::new();

fn engine_error(e: ffmpeg::Error) -> EngineError {
    match e {
        ffmpeg::Error::Eof => EngineError::EndOfStream,
        ffmpeg::Error::Other { errno } if errno == util::error::EAGAIN => EngineError::Again,
        ffmpeg::Error::Exit => EngineError::Interrupted,
        other => EngineError::Failed(other.to_string()),
    }
}

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn optional_ts(value: i64) -> Option<i64> {
    (value != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(value)
}

pub struct FfmpegEngine;

impl FfmpegEngine {
    pub fn new() -> Result<Self> {
        let mut result = Ok(());
        INIT.call_once(|| {
            result = ffmpeg::init();
        });
        result.map_err(|e| PipelineError::OpenError(format!("FFmpeg 初始化失败: {}", e)))?;
        info!("✅ FFmpeg 初始化成功");
        Ok(Self)
    }
}

impl MediaEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_container(&self, source: &MediaSource, interrupter: Arc<Interrupter>) -> Result<Box<dyn Container>> {
        let location = source.location();
        if source.is_network_stream() {
            info!("🌐 检测到网络流: {}", location);
        }
        let callback = interrupter.clone();
        let input = format::input_with_interrupt(&location, move || callback.should_abort())
            .map_err(|e| PipelineError::OpenError(format!("无法打开 {}: {}", location, e)))?;
        Ok(Box::new(FfmpegContainer::new(input, location, interrupter)))
    }
}

pub struct FfmpegContainer {
    input: format::context::Input,
    streams: Vec<StreamDescriptor>,
    discard: Vec<bool>,
    location: String,
    _interrupter: Arc<Interrupter>,
}

// AVFormatContext 只在持有容器锁的线程中使用
unsafe impl Send for FfmpegContainer {}

impl FfmpegContainer {
    fn new(input: format::context::Input, location: String, interrupter: Arc<Interrupter>) -> Self {
        let streams: Vec<StreamDescriptor> = input
            .streams()
            .map(|stream| {
                let params = stream.parameters();
                let kind = match params.medium() {
                    media::Type::Video => MediaKind::Video,
                    media::Type::Audio => MediaKind::Audio,
                    media::Type::Subtitle => MediaKind::Subtitle,
                    // 其它流按字幕登记，始终处于丢弃状态
                    _ => MediaKind::Subtitle,
                };
                let (audio, video) = match codec::context::Context::from_parameters(params.clone()) {
                    Ok(ctx) => match kind {
                        MediaKind::Audio => (
                            ctx.decoder().audio().ok().map(|a| AudioSpec {
                                sample_format: SampleFormat::F32,
                                sample_rate: a.rate(),
                                channels: a.channels(),
                            }),
                            None,
                        ),
                        MediaKind::Video => (
                            None,
                            ctx.decoder().video().ok().map(|v| VideoSpec {
                                width: v.width(),
                                height: v.height(),
                                pixel_format: PixelFormat::RGBA,
                                frame_rate: rational(stream.avg_frame_rate()),
                            }),
                        ),
                        MediaKind::Subtitle => (None, None),
                    },
                    Err(_) => (None, None),
                };
                StreamDescriptor {
                    index: stream.index(),
                    kind,
                    time_base: rational(stream.time_base()),
                    start_time: optional_ts(stream.start_time()),
                    duration: optional_ts(stream.duration()).filter(|d| *d > 0),
                    codec_name: params.id().name().to_string(),
                    audio,
                    video,
                }
            })
            .collect();
        let discard = vec![false; streams.len()];
        Self {
            input,
            streams,
            discard,
            location,
            _interrupter: interrupter,
        }
    }
}

impl Container for FfmpegContainer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn start_time_us(&self) -> i64 {
        let start = unsafe { (*self.input.as_ptr()).start_time };
        optional_ts(start).unwrap_or(0)
    }

    fn duration_us(&self) -> Option<i64> {
        optional_ts(self.input.duration()).filter(|d| *d > 0)
    }

    fn is_live(&self) -> bool {
        self.duration_us().is_none()
    }

    fn read_packet(&mut self) -> EngineResult<Packet> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            packet.read(&mut self.input).map_err(engine_error)?;
            let index = packet.stream();
            let Some(stream) = self.streams.get(index) else {
                continue;
            };
            if self.discard[index] {
                continue;
            }
            let data = Bytes::copy_from_slice(packet.data().unwrap_or(&[]));
            let mut out = Packet::new(stream.kind, index, stream.time_base, data)
                .with_duration(packet.duration())
                .with_keyframe(packet.is_key());
            out.pts = packet.pts();
            out.dts = packet.dts();
            return Ok(out);
        }
    }

    fn seek(&mut self, timestamp_us: i64, direction: SeekDirection) -> EngineResult<()> {
        let result = match direction {
            SeekDirection::Backward => self.input.seek(timestamp_us, ..timestamp_us),
            SeekDirection::Forward => self.input.seek(timestamp_us, timestamp_us..),
        };
        result.map_err(engine_error)
    }

    fn flush(&mut self) {
        unsafe {
            ffmpeg::ffi::avformat_flush(self.input.as_mut_ptr());
        }
    }

    fn set_discard(&mut self, index: usize, discard: bool) {
        let Some(flag) = self.discard.get_mut(index) else {
            return;
        };
        *flag = discard;
        unsafe {
            let ctx = self.input.as_mut_ptr();
            let stream = *(*ctx).streams.add(index);
            (*stream).discard = if discard {
                AVDiscard::AVDISCARD_ALL
            } else {
                AVDiscard::AVDISCARD_DEFAULT
            };
        }
    }

    fn open_codec(&self, index: usize) -> Result<Box<dyn CodecContext>> {
        let stream = self.input.stream(index).ok_or(PipelineError::InvalidStream(index))?;
        let context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| PipelineError::DecodeError(format!("流 #{} 解码参数无效: {}", index, e)))?;
        let decoder = context.decoder();
        let codec: Box<dyn CodecContext> = match self.streams[index].kind {
            MediaKind::Video => Box::new(VideoCodec {
                decoder: decoder.video().map_err(|e| PipelineError::DecodeError(e.to_string()))?,
                scaler: None,
            }),
            MediaKind::Audio => Box::new(AudioCodec {
                decoder: decoder.audio().map_err(|e| PipelineError::DecodeError(e.to_string()))?,
                resampler: None,
            }),
            MediaKind::Subtitle => Box::new(SubtitleCodec {
                decoder: decoder.subtitle().map_err(|e| PipelineError::DecodeError(e.to_string()))?,
                ready: VecDeque::new(),
                eof: false,
            }),
        };
        debug!("打开解码器: 流 #{} ({})", index, self.streams[index].codec_name);
        Ok(codec)
    }

    fn description(&self) -> String {
        format!("ffmpeg:{} ({})", self.location, self.input.format().name())
    }
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    if packet.keyframe {
        out.set_flags(codec::packet::Flags::KEY);
    }
    out
}

struct VideoCodec {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, (util::format::Pixel, u32, u32))>,
}

// SwsContext 只在持有编解码锁的线程中使用
unsafe impl Send for VideoCodec {}

impl VideoCodec {
    /// 转换为紧凑排列的 RGBA
    fn convert(&mut self, frame: &util::frame::Video) -> EngineResult<DecodedPicture> {
        let (width, height) = (frame.width(), frame.height());
        let key = (frame.format(), width, height);
        if self.scaler.as_ref().map(|(_, k)| *k) != Some(key) {
            let scaler = software::scaling::Context::get(
                frame.format(),
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )
            .map_err(engine_error)?;
            self.scaler = Some((scaler, key));
        }
        let mut rgba = util::frame::Video::empty();
        if let Some((scaler, _)) = self.scaler.as_mut() {
            scaler.run(frame, &mut rgba).map_err(engine_error)?;
        }

        let row = width as usize * 4;
        let stride = rgba.stride(0);
        let src = rgba.data(0);
        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            data.extend_from_slice(&src[y * stride..y * stride + row]);
        }

        Ok(DecodedPicture {
            best_effort_timestamp: frame.timestamp(),
            keyframe: frame.is_key(),
            width,
            height,
            format: PixelFormat::RGBA,
            data: Bytes::from(data),
        })
    }
}

impl CodecContext for VideoCodec {
    fn send_packet(&mut self, packet: &Packet) -> EngineResult<()> {
        self.decoder.send_packet(&to_ffmpeg_packet(packet)).map_err(engine_error)
    }

    fn send_eof(&mut self) -> EngineResult<()> {
        self.decoder.send_eof().map_err(engine_error)
    }

    fn receive_frame(&mut self) -> EngineResult<DecodedFrame> {
        let mut frame = util::frame::Video::empty();
        self.decoder.receive_frame(&mut frame).map_err(engine_error)?;
        Ok(DecodedFrame::Video(self.convert(&frame)?))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

struct AudioCodec {
    decoder: codec::decoder::Audio,
    /// 转为交错 f32，保持源采样率与声道
    resampler: Option<(software::resampling::Context, AudioSpec)>,
}

// SwrContext 只在持有编解码锁的线程中使用
unsafe impl Send for AudioCodec {}

impl AudioCodec {
    fn convert(&mut self, frame: &util::frame::Audio) -> EngineResult<DecodedAudio> {
        let spec = AudioSpec {
            sample_format: SampleFormat::F32,
            sample_rate: frame.rate(),
            channels: frame.channels(),
        };
        if self.resampler.as_ref().map(|(_, s)| *s) != Some(spec) {
            debug!("🔧 初始化音频格式转换: {:?} → 交错 f32 ({})", frame.format(), spec);
            let resampler = software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                util::format::Sample::F32(util::format::sample::Type::Packed),
                frame.channel_layout(),
                frame.rate(),
            )
            .map_err(engine_error)?;
            self.resampler = Some((resampler, spec));
        }
        let mut packed = util::frame::Audio::empty();
        if let Some((resampler, _)) = self.resampler.as_mut() {
            resampler.run(frame, &mut packed).map_err(engine_error)?;
        }

        let nb_samples = packed.samples();
        let bytes = nb_samples * spec.channels as usize * 4;
        let raw = packed.data(0);
        let samples: Vec<f32> = bytemuck::pod_collect_to_vec(&raw[..bytes.min(raw.len())]);

        Ok(DecodedAudio {
            best_effort_timestamp: frame.timestamp(),
            spec,
            nb_samples,
            samples,
        })
    }
}

impl CodecContext for AudioCodec {
    fn send_packet(&mut self, packet: &Packet) -> EngineResult<()> {
        self.decoder.send_packet(&to_ffmpeg_packet(packet)).map_err(engine_error)
    }

    fn send_eof(&mut self) -> EngineResult<()> {
        self.decoder.send_eof().map_err(engine_error)
    }

    fn receive_frame(&mut self) -> EngineResult<DecodedFrame> {
        let mut frame = util::frame::Audio::empty();
        self.decoder.receive_frame(&mut frame).map_err(engine_error)?;
        Ok(DecodedFrame::Audio(self.convert(&frame)?))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// 字幕解码是同步的：送包时直接解出，取帧时依次返回
struct SubtitleCodec {
    decoder: codec::decoder::Subtitle,
    ready: VecDeque<DecodedFrame>,
    eof: bool,
}

unsafe impl Send for SubtitleCodec {}

impl CodecContext for SubtitleCodec {
    fn send_packet(&mut self, packet: &Packet) -> EngineResult<()> {
        let mut subtitle = ffmpeg::codec::subtitle::Subtitle::default();
        let got = self
            .decoder
            .decode(&to_ffmpeg_packet(packet), &mut subtitle)
            .map_err(engine_error)?;
        if !got {
            return Ok(());
        }

        let mut text = String::new();
        for rect in subtitle.rects() {
            unsafe {
                let raw = rect.as_ptr();
                match (*raw).type_ {
                    AVSubtitleType::SUBTITLE_TEXT if !(*raw).text.is_null() => {
                        text.push_str(&CStr::from_ptr((*raw).text).to_string_lossy());
                        text.push('\n');
                    }
                    AVSubtitleType::SUBTITLE_ASS if !(*raw).ass.is_null() => {
                        text.push_str(&CStr::from_ptr((*raw).ass).to_string_lossy());
                        text.push('\n');
                    }
                    AVSubtitleType::SUBTITLE_BITMAP => debug!("跳过位图字幕"),
                    _ => {}
                }
            }
        }
        let end_ms = unsafe { (*subtitle.as_ptr()).end_display_time };
        // 必须释放，否则泄漏
        unsafe {
            ffmpeg::ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }

        if text.trim().is_empty() {
            return Ok(());
        }
        let duration = (end_ms > 0)
            .then(|| end_ms as i64 * 1_000)
            .or_else(|| (packet.duration > 0).then(|| packet.duration_us()));
        self.ready.push_back(DecodedFrame::Subtitle(DecodedSubtitle {
            best_effort_timestamp: packet.pts,
            duration,
            text,
        }));
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
        self.eof = false;
        if !self.ready.is_empty() {
            warn!("丢弃 {} 条未取出的字幕", self.ready.len());
        }
        self.ready.clear();
    }
}
