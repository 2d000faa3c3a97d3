// 解码器：通用解码循环 + 按流类型的解码体

pub mod arena;
pub mod audio;
pub mod audio_queue;
pub mod resample;
pub mod subtitle;
pub mod sync;
pub mod video;

pub use audio::{AudioBody, AudioDecoder};
pub use audio_queue::AudioFrameQueue;
pub use subtitle::{SubtitleBody, SubtitleDecoder};
pub use sync::AvSync;
pub use video::{VideoBody, VideoDecoder};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::frame::DecodedFrame;
use crate::core::{
    Component, EngineError, EventBus, MediaKind, Packet, PipelineError, PipelineEvent, Result, Status, StatusCell,
};
use crate::player::demuxer::Demuxer;
use crate::player::engine::CodecContext;
use crate::player::packet_queue::PacketQueue;
use crate::player::worker::{Worker, WorkerBody};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 出队/等待的状态复查间隔
pub(crate) const RECHECK_INTERVAL: Duration = Duration::from_millis(20);

/// 按流类型的解码策略
pub trait DecodeBody: Send + Sync + 'static {
    fn component(&self) -> Component;

    fn kind(&self) -> MediaKind;

    /// 在编解码锁内送入一个包并收集就绪帧
    fn send(&self, packet: &Packet, out: &mut VecDeque<DecodedFrame>) -> Result<()>;

    /// 输入结束：冲刷编解码器中剩余的帧
    fn send_eof(&self, out: &mut VecDeque<DecodedFrame>) -> Result<()>;

    /// 处理一帧；等待输出队列时被暂停/停止打断则返回 `Interrupted`，
    /// 之后同一帧会被重新处理
    fn process(&self, frame: &DecodedFrame, status: &StatusCell) -> Result<()>;

    /// 所有帧处理完后的收尾（冲刷转换器积压）
    fn finish(&self, _status: &StatusCell) -> Result<()> {
        Ok(())
    }

    /// seek 后清空编解码器与输出队列
    fn flush(&self);

    /// 释放编解码器
    fn teardown(&self);

    fn is_open(&self) -> bool;
}

/// 通用解码循环（工作线程的循环体）
pub struct DecoderLoop<B: DecodeBody> {
    body: B,
    demuxer: Demuxer,
    queue: Arc<PacketQueue>,
    stream_index: usize,
    /// 已解码但尚未送出的帧
    backlog: Mutex<VecDeque<DecodedFrame>>,
    events: EventBus,
}

impl<B: DecodeBody> DecoderLoop<B> {
    /// 处理积压帧；被打断时返回 false
    fn process_backlog(&self, status: &StatusCell) -> bool {
        loop {
            let Some(frame) = self.backlog.lock().pop_front() else {
                return true;
            };
            match self.body.process(&frame, status) {
                Ok(()) => {}
                Err(e) if e.is_interrupted() => {
                    self.backlog.lock().push_front(frame);
                    return false;
                }
                Err(e) => warn!("{} ⚠ {} 丢弃一帧: {}", log_ctx(), self.body.component(), e),
            }
        }
    }

    fn decode(&self, packet: Packet, status: &StatusCell) {
        let mut frames = VecDeque::new();
        let sent = self.body.send(&packet, &mut frames);
        self.backlog.lock().extend(frames);
        match sent {
            Ok(()) => {
                self.process_backlog(status);
            }
            Err(e) if e.is_interrupted() => {}
            Err(e) => {
                error!("{} ❌ {} 送包失败: {}", log_ctx(), self.body.component(), e);
                status.set_if_active(Status::Stopping);
            }
        }
    }

    /// 输入耗尽：冲刷编解码器后进入 Ended
    fn drain(&self, status: &StatusCell) {
        status.set_if_active(Status::Draining);
        let mut frames = VecDeque::new();
        if let Err(e) = self.body.send_eof(&mut frames) {
            warn!("{} ⚠ {} 冲刷失败: {}", log_ctx(), self.body.component(), e);
        }
        self.backlog.lock().extend(frames);
        if !self.process_backlog(status) {
            return;
        }
        match self.body.finish(status) {
            Err(e) if e.is_interrupted() => return,
            Err(e) => warn!("{} ⚠ {} 收尾失败: {}", log_ctx(), self.body.component(), e),
            Ok(()) => {}
        }
        if status.set_if_active(Status::Ended) {
            info!("{} 🏁 {} 解码结束", log_ctx(), self.body.component());
            self.events.emit(PipelineEvent::EndOfStream {
                component: self.body.component(),
            });
        }
    }
}

impl<B: DecodeBody> WorkerBody for DecoderLoop<B> {
    fn name(&self) -> String {
        format!("{}#{}", self.body.component(), self.stream_index)
    }

    fn run(&self, status: &StatusCell) {
        while status.is_active() {
            if !self.process_backlog(status) {
                continue;
            }
            match self.queue.pop_timeout(RECHECK_INTERVAL) {
                Some(packet) => {
                    status.compare_and_set(Status::QueueEmpty, Status::Running);
                    self.decode(packet, status);
                }
                None => {
                    if self.demuxer.is_eof() && self.queue.is_empty() {
                        self.drain(status);
                        continue;
                    }
                    let upstream = self.demuxer.status();
                    if matches!(upstream, Status::Stopping | Status::Stopped) && !self.demuxer.is_eof() {
                        info!("{} ⏹ {} 上游 Demuxer 已停止，随之停止", log_ctx(), self.body.component());
                        status.set_if_active(Status::Stopping);
                        continue;
                    }
                    if status.compare_and_set(Status::Running, Status::QueueEmpty) {
                        debug!("{} 队列为空，等待数据包", self.body.component());
                    }
                }
            }
        }
    }
}

/// 解码器：工作线程 + 解码体
pub struct Decoder<B: DecodeBody> {
    inner: Arc<DecoderLoop<B>>,
    worker: Worker<DecoderLoop<B>>,
}

impl<B: DecodeBody> Decoder<B> {
    /// 启用流并组装解码器（码流上下文已由调用方打开）
    pub(crate) fn assemble(body: B, demuxer: &Demuxer, stream_index: usize, events: EventBus) -> Result<Self> {
        let queue = demuxer.packet_queue(body.kind());
        let component = body.component();
        demuxer.enable_stream(stream_index)?;
        let inner = Arc::new(DecoderLoop {
            body,
            demuxer: demuxer.clone(),
            queue,
            stream_index,
            backlog: Mutex::new(VecDeque::new()),
            events: events.clone(),
        });
        let status = Arc::new(StatusCell::new(component, Status::Stopped, events));
        let worker = Worker::new(inner.clone(), status);
        info!("{} ✅ {} 已打开 (流 #{})", log_ctx(), component, stream_index);
        Ok(Self { inner, worker })
    }

    pub fn start(&self) -> Result<()> {
        if !self.inner.body.is_open() {
            return Err(PipelineError::NotOpened);
        }
        self.worker.start()
    }

    pub fn pause(&self) {
        self.worker.pause()
    }

    /// 停止线程、释放编解码器并从 Demuxer 上摘除
    pub fn stop(&self) {
        self.worker.stop();
        self.inner.backlog.lock().clear();
        self.inner.body.teardown();
        if let Err(e) = self.inner.demuxer.disable_stream(self.inner.stream_index) {
            warn!("{} ⚠ 禁用流 #{} 失败: {}", log_ctx(), self.inner.stream_index, e);
        }
    }

    /// 丢弃积压帧并冲刷编解码器（应在暂停后调用）
    pub fn flush(&self) {
        self.inner.backlog.lock().clear();
        self.inner.body.flush();
    }

    pub fn take_ended(&self) -> bool {
        self.worker.take_ended()
    }

    pub fn status(&self) -> Status {
        self.worker.status()
    }

    pub fn status_cell(&self) -> &Arc<StatusCell> {
        self.worker.status_cell()
    }

    pub fn stream_index(&self) -> usize {
        self.inner.stream_index
    }

    pub fn body(&self) -> &B {
        &self.inner.body
    }
}

/// 校验流类型后打开编解码上下文
pub(crate) fn open_codec_for(demuxer: &Demuxer, stream_index: usize, kind: MediaKind) -> Result<Box<dyn CodecContext>> {
    let stream = demuxer.stream(stream_index)?;
    if stream.kind != kind {
        return Err(PipelineError::InvalidStream(stream_index));
    }
    demuxer.open_codec(stream_index)
}

/// 送包并取出所有就绪帧
///
/// 送包返回 `Again` 时先取空输出再重送一次
pub(crate) fn feed_packet(codec: &mut dyn CodecContext, packet: &Packet, out: &mut VecDeque<DecodedFrame>) -> Result<()> {
    match codec.send_packet(packet) {
        Ok(()) => {}
        Err(EngineError::Again) => {
            receive_ready(codec, out);
            codec.send_packet(packet)?;
        }
        Err(e) => return Err(e.into()),
    }
    receive_ready(codec, out);
    Ok(())
}

fn receive_ready(codec: &mut dyn CodecContext, out: &mut VecDeque<DecodedFrame>) {
    loop {
        match codec.receive_frame() {
            Ok(frame) => out.push_back(frame),
            Err(EngineError::Again) | Err(EngineError::EndOfStream) | Err(EngineError::Interrupted) => break,
            Err(EngineError::Failed(msg)) => {
                // 个别帧解码失败可以容忍
                warn!("解码错误（已跳过）: {}", msg);
                break;
            }
        }
    }
}

/// 通知输入结束并取出剩余帧
pub(crate) fn drain_codec(codec: &mut dyn CodecContext, out: &mut VecDeque<DecodedFrame>) -> Result<()> {
    match codec.send_eof() {
        Ok(()) | Err(EngineError::EndOfStream) => {}
        Err(e) => return Err(e.into()),
    }
    loop {
        match codec.receive_frame() {
            Ok(frame) => out.push_back(frame),
            Err(EngineError::EndOfStream) | Err(EngineError::Again) => return Ok(()),
            Err(EngineError::Interrupted) => return Err(PipelineError::Interrupted),
            Err(EngineError::Failed(msg)) => {
                warn!("冲刷时解码错误: {}", msg);
                return Ok(());
            }
        }
    }
}

/// 等待输出队列出现空位
///
/// 队列满时进入 QueueFull；状态离开活动态则返回 `Interrupted`。
/// 调用方不得在等待期间持有编解码锁或速率锁。
pub(crate) fn wait_for_space(status: &StatusCell, wait_not_full: impl Fn(Duration) -> bool) -> Result<()> {
    let mut full = false;
    loop {
        if !status.is_active() {
            return Err(PipelineError::Interrupted);
        }
        let timeout = if full { RECHECK_INTERVAL } else { Duration::ZERO };
        if wait_not_full(timeout) {
            break;
        }
        if !full {
            full = true;
            status.set_if_active(Status::QueueFull);
        }
    }
    if full {
        status.compare_and_set(Status::QueueFull, Status::Running);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::DecodedSubtitle;
    use crate::core::Rational;

    /// 第一次送包返回 Again 的编解码器
    struct Stubborn {
        rejected: bool,
        ready: VecDeque<DecodedFrame>,
        eof: bool,
    }

    impl CodecContext for Stubborn {
        fn send_packet(&mut self, packet: &Packet) -> crate::core::EngineResult<()> {
            if !self.rejected {
                self.rejected = true;
                return Err(EngineError::Again);
            }
            self.ready.push_back(DecodedFrame::Subtitle(DecodedSubtitle {
                best_effort_timestamp: packet.pts,
                duration: None,
                text: "cue".into(),
            }));
            Ok(())
        }

        fn send_eof(&mut self) -> crate::core::EngineResult<()> {
            self.eof = true;
            Ok(())
        }

        fn receive_frame(&mut self) -> crate::core::EngineResult<DecodedFrame> {
            match self.ready.pop_front() {
                Some(frame) => Ok(frame),
                None if self.eof => Err(EngineError::EndOfStream),
                None => Err(EngineError::Again),
            }
        }

        fn flush(&mut self) {
            self.ready.clear();
        }
    }

    #[test]
    fn test_feed_packet_retries_after_again() {
        let mut codec = Stubborn {
            rejected: false,
            ready: VecDeque::new(),
            eof: false,
        };
        let packet = Packet::new(MediaKind::Subtitle, 2, Rational::new(1, 1000), vec![]).with_pts(10);
        let mut out = VecDeque::new();
        feed_packet(&mut codec, &packet, &mut out).unwrap();
        assert_eq!(out.len(), 1);

        drain_codec(&mut codec, &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_wait_for_space_interrupted_by_pause() {
        let status = StatusCell::new(Component::VideoDecoder, Status::Running, EventBus::new());
        assert!(wait_for_space(&status, |_| true).is_ok());

        status.set(Status::Pausing);
        let err = wait_for_space(&status, |_| false).unwrap_err();
        assert!(err.is_interrupted());
    }
}
