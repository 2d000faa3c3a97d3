// 编解码引擎实现

pub mod synthetic;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use synthetic::{ChannelSwitch, SyntheticAudio, SyntheticEngine, SyntheticMedia, SyntheticProbe, SyntheticVideo};
#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegEngine;
