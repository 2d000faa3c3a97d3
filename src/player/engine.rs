use std::sync::Arc;

use crate::core::frame::DecodedFrame;
use crate::core::{EngineResult, MediaSource, Packet, Result, StreamDescriptor};
use crate::player::interrupter::Interrupter;

/// Seek 方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    /// 落在目标之后（含）的最近关键帧
    Forward,
    /// 落在目标之前（含）的最近关键帧
    Backward,
}

impl SeekDirection {
    pub fn from_forward(forward: bool) -> Self {
        if forward {
            SeekDirection::Forward
        } else {
            SeekDirection::Backward
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            SeekDirection::Forward => SeekDirection::Backward,
            SeekDirection::Backward => SeekDirection::Forward,
        }
    }
}

/// 编解码引擎入口
///
/// 管线只通过这组接口与引擎交互，不关心码流内部
pub trait MediaEngine: Send + Sync {
    fn name(&self) -> &str;

    /// 打开容器；引擎在阻塞期间轮询 `interrupter`
    fn open_container(&self, source: &MediaSource, interrupter: Arc<Interrupter>) -> Result<Box<dyn Container>>;
}

/// 已打开的容器（由 Demuxer 的容器锁保护）
pub trait Container: Send {
    fn streams(&self) -> &[StreamDescriptor];

    /// 容器起始时间（绝对微秒）
    fn start_time_us(&self) -> i64;

    fn duration_us(&self) -> Option<i64>;

    /// 无界直播源
    fn is_live(&self) -> bool;

    /// 读取下一个包
    ///
    /// - `Again`：暂无数据
    /// - `EndOfStream`：到达末尾
    /// - `Interrupted`：被 Interrupter 中止
    fn read_packet(&mut self) -> EngineResult<Packet>;

    /// Seek 到绝对微秒时间戳
    fn seek(&mut self, timestamp_us: i64, direction: SeekDirection) -> EngineResult<()>;

    /// 丢弃引擎内部的读缓冲
    fn flush(&mut self);

    /// 设置流的丢弃标记（被丢弃的流不再产出包）
    fn set_discard(&mut self, index: usize, discard: bool);

    fn open_codec(&self, index: usize) -> Result<Box<dyn CodecContext>>;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 单个流的解码上下文（由解码器的编解码锁保护）
pub trait CodecContext: Send {
    fn send_packet(&mut self, packet: &Packet) -> EngineResult<()>;

    /// 通知输入结束，之后 `receive_frame` 吐完剩余帧再返回 `EndOfStream`
    fn send_eof(&mut self) -> EngineResult<()>;

    fn receive_frame(&mut self) -> EngineResult<DecodedFrame>;

    fn flush(&mut self);
}
