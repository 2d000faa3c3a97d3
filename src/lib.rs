// 播放管线核心库

pub mod backend;
pub mod core;
pub mod player;
pub mod renderer;

pub use crate::core::{
    BufferStatus, MediaInfo, MediaKind, MediaSource, PipelineConfig, PipelineError, PipelineEvent, PlaybackState,
    PlayerState, Result, Status,
};
pub use crate::player::PlaybackSession;
