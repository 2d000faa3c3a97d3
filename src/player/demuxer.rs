use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::{
    Component, DemuxerConfig, EngineError, EventBus, MediaKind, MediaSource, Packet, PipelineConfig, PipelineError,
    PipelineEvent, Result, Status, StatusCell, StreamDescriptor,
};
use crate::player::engine::{CodecContext, Container, MediaEngine, SeekDirection};
use crate::player::interrupter::{AbortReason, Interrupter, OperationKind};
use crate::player::packet_queue::{BufferState, PacketQueue};
use crate::player::recording::{Recorder, RecordingSink};
use crate::player::worker::{Worker, WorkerBody};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 引擎暂无数据时的退避
const AGAIN_BACKOFF: Duration = Duration::from_millis(2);

/// 关键帧统计（队列内 seek 的容差来源）
#[derive(Debug, Default, Clone, Copy)]
struct KeyframeStats {
    last: Option<i64>,
    max_interval: Option<i64>,
}

/// 解封装器内部状态，同时也是读线程的循环体
pub struct DemuxerCore {
    container: Mutex<Option<Box<dyn Container>>>,
    streams: Vec<StreamDescriptor>,
    enabled: RwLock<Vec<bool>>,
    video_queue: Arc<PacketQueue>,
    audio_queue: Arc<PacketQueue>,
    subtitle_queue: Arc<PacketQueue>,
    tracked: RwLock<Option<MediaKind>>,
    keyframes: Mutex<KeyframeStats>,
    /// 容量竞争时暂存的包，下次循环优先入队
    pending: Mutex<Option<Packet>>,
    recorder: Mutex<Option<Recorder>>,
    eof: AtomicBool,
    failed: AtomicBool,
    consecutive_errors: AtomicU32,
    start_time_us: i64,
    duration_us: Option<i64>,
    is_live: bool,
    description: String,
    interrupter: Arc<Interrupter>,
    events: EventBus,
    config: DemuxerConfig,
}

impl DemuxerCore {
    fn queue(&self, kind: MediaKind) -> &Arc<PacketQueue> {
        match kind {
            MediaKind::Video => &self.video_queue,
            MediaKind::Audio => &self.audio_queue,
            MediaKind::Subtitle => &self.subtitle_queue,
        }
    }

    fn enabled_kinds(&self) -> Vec<MediaKind> {
        let enabled = self.enabled.read();
        MediaKind::ALL
            .into_iter()
            .filter(|kind| self.streams.iter().any(|s| s.kind == *kind && enabled[s.index]))
            .collect()
    }

    /// 跟踪流：有视频时跟踪视频，否则音频
    fn update_tracked(&self) {
        let kinds = self.enabled_kinds();
        let tracked = if kinds.contains(&MediaKind::Video) {
            Some(MediaKind::Video)
        } else if kinds.contains(&MediaKind::Audio) {
            Some(MediaKind::Audio)
        } else {
            None
        };
        *self.tracked.write() = tracked;
    }

    fn buffered_duration(&self) -> i64 {
        match *self.tracked.read() {
            Some(kind) => self.queue(kind).buffered_duration(),
            None => 0,
        }
    }

    /// 需要背压时返回阻塞的队列
    fn congested_queue(&self) -> Option<&Arc<PacketQueue>> {
        for kind in self.enabled_kinds() {
            let queue = self.queue(kind);
            if queue.is_full() {
                return Some(queue);
            }
        }
        let tracked = (*self.tracked.read())?;
        let queue = self.queue(tracked);
        (queue.buffered_duration() > self.config.max_buffered_duration_us).then_some(queue)
    }

    fn relative_ts(&self, packet: &Packet) -> Option<i64> {
        packet.timestamp_us().map(|ts| ts - self.start_time_us)
    }

    fn purge_all(&self) {
        // 持暂存锁清空，读线程不能在中途补入旧包
        let mut pending = self.pending.lock();
        for kind in MediaKind::ALL {
            self.queue(kind).flush();
        }
        *pending = None;
    }

    /// 一次阻塞读取并分发
    fn read_one(&self, status: &StatusCell) {
        let mut guard = self.container.lock();
        let Some(container) = guard.as_mut() else {
            status.set_if_active(Status::Stopping);
            return;
        };

        let result = {
            let _op = self.interrupter.begin(OperationKind::Read);
            container.read_packet()
        };

        match result {
            Ok(packet) => {
                self.consecutive_errors.store(0, Ordering::Release);
                // 持有容器锁入队，保证 seek 清队后不会混入旧包
                self.handle_packet(packet);
            }
            Err(EngineError::EndOfStream) => {
                info!("{} 📄 Demuxer 到达文件末尾", log_ctx());
                self.eof.store(true, Ordering::Release);
                if status.set_if_active(Status::Ended) {
                    self.events.emit(PipelineEvent::EndOfStream {
                        component: Component::Demuxer,
                    });
                }
            }
            Err(EngineError::Again) => {
                drop(guard);
                thread::sleep(AGAIN_BACKOFF);
            }
            Err(EngineError::Interrupted) => {
                drop(guard);
                match self.interrupter.take_abort() {
                    Some(AbortReason::Timeout) => self.count_read_error(status, "读取超时"),
                    Some(AbortReason::Requested) => {
                        // 等待 seek 拿到容器锁并撤销请求后再重试
                        self.interrupter.wait_request_cleared(self.config.recheck_interval());
                    }
                    _ => {}
                }
            }
            Err(EngineError::Failed(msg)) => {
                drop(guard);
                self.count_read_error(status, &msg);
            }
        }
    }

    fn count_read_error(&self, status: &StatusCell, reason: &str) {
        let consecutive = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        let budget = self.config.max_read_errors;
        warn!("{} ⚠ 读取包失败 ({}/{}): {}", log_ctx(), consecutive, budget, reason);
        self.events.emit(PipelineEvent::ReadError { consecutive, budget });
        if consecutive > budget {
            error!("{} ❌ 连续读取错误超出预算，Demuxer 停止", log_ctx());
            self.failed.store(true, Ordering::Release);
            status.set_if_active(Status::Stopping);
        }
    }

    fn handle_packet(&self, mut packet: Packet) {
        let Some(stream) = self.streams.get(packet.stream_index) else {
            debug!("跳过未知流 #{} 的包", packet.stream_index);
            return;
        };
        if !self.enabled.read()[stream.index] {
            return;
        }
        packet.kind = stream.kind;
        let relative = self.relative_ts(&packet);

        if stream.kind == MediaKind::Video && packet.keyframe {
            if let Some(ts) = relative {
                let mut stats = self.keyframes.lock();
                if let Some(last) = stats.last {
                    let interval = ts - last;
                    if interval > 0 && stats.max_interval.map_or(true, |max| interval > max) {
                        debug!("关键帧间隔更新: {}us", interval);
                        stats.max_interval = Some(interval);
                    }
                }
                stats.last = Some(ts);
            }
        }

        if let Some(recorder) = self.recorder.lock().as_mut() {
            recorder.offer(&packet, stream, relative);
        }

        if let Err(packet) = self.queue(stream.kind).push(packet) {
            *self.pending.lock() = Some(packet);
        }
    }

    fn push_pending(&self) -> bool {
        let mut pending = self.pending.lock();
        let Some(packet) = pending.take() else {
            return true;
        };
        match self.queue(packet.kind).push(packet) {
            Ok(()) => true,
            Err(packet) => {
                *pending = Some(packet);
                false
            }
        }
    }
}

impl WorkerBody for DemuxerCore {
    fn name(&self) -> String {
        "demuxer".to_string()
    }

    fn run(&self, status: &StatusCell) {
        let recheck = self.config.recheck_interval();
        while status.is_active() {
            if let Some(queue) = self.congested_queue() {
                if status.compare_and_set(Status::Running, Status::QueueFull) {
                    debug!("{} ⏸ {} 队列已满，等待消费", log_ctx(), queue.kind());
                }
                queue.wait_for_pop(recheck);
                continue;
            }
            status.compare_and_set(Status::QueueFull, Status::Running);

            if !self.push_pending() {
                let blocked = self.pending.lock().as_ref().map(|p| self.queue(p.kind).clone());
                if let Some(queue) = blocked {
                    queue.wait_for_pop(recheck);
                }
                continue;
            }

            self.read_one(status);
        }
    }
}

/// 解封装器 - 负责读取容器并按流类型分发数据包
///
/// 克隆共享同一个读线程
#[derive(Clone)]
pub struct Demuxer {
    core: Arc<DemuxerCore>,
    worker: Arc<Worker<DemuxerCore>>,
}

impl Demuxer {
    /// 打开媒体源；失败时不保留任何状态
    pub fn open(engine: &dyn MediaEngine, source: &MediaSource, config: &PipelineConfig, events: EventBus) -> Result<Self> {
        info!("{} 正在打开 [{}]: {}", log_ctx(), source.protocol_name(), source.location());
        let status = Arc::new(StatusCell::new(Component::Demuxer, Status::Stopped, events.clone()));
        status.set(Status::Opening);

        let interrupter = Arc::new(Interrupter::new(
            status.clone(),
            config.timeouts,
            config.demuxer.suppress_read_interrupts,
        ));

        let opened = {
            let _op = interrupter.begin(OperationKind::Open);
            engine.open_container(source, interrupter.clone())
        };
        let mut container = match opened {
            Ok(container) => container,
            Err(e) => {
                status.set(Status::Stopped);
                error!("{} ❌ 打开失败: {}", log_ctx(), e);
                return Err(match e {
                    PipelineError::OpenError(msg) => PipelineError::OpenError(msg),
                    other => PipelineError::OpenError(other.to_string()),
                });
            }
        };

        let streams = container.streams().to_vec();
        if !streams.iter().any(|s| matches!(s.kind, MediaKind::Audio | MediaKind::Video)) {
            status.set(Status::Stopped);
            return Err(PipelineError::OpenError("没有音频或视频流".to_string()));
        }
        // 默认丢弃所有流，由调用方按需启用
        for stream in &streams {
            container.set_discard(stream.index, true);
        }

        let start_time_us = container.start_time_us();
        let demuxer_config = config.demuxer.clone();
        let max_buffered = demuxer_config.max_buffered_duration_us;
        let make_queue = |kind: MediaKind| {
            Arc::new(PacketQueue::new(kind, demuxer_config.max_packets(kind), max_buffered, start_time_us))
        };

        let core = Arc::new(DemuxerCore {
            enabled: RwLock::new(vec![false; streams.len()]),
            video_queue: make_queue(MediaKind::Video),
            audio_queue: make_queue(MediaKind::Audio),
            subtitle_queue: make_queue(MediaKind::Subtitle),
            tracked: RwLock::new(None),
            keyframes: Mutex::new(KeyframeStats::default()),
            pending: Mutex::new(None),
            recorder: Mutex::new(None),
            eof: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            start_time_us,
            duration_us: container.duration_us(),
            is_live: container.is_live() || source.is_live(),
            description: container.description(),
            interrupter,
            events,
            config: demuxer_config,
            streams,
            container: Mutex::new(Some(container)),
        });

        for stream in &core.streams {
            debug!("流 #{}: {} {} tb={}/{}", stream.index, stream.kind, stream.codec_name, stream.time_base.num, stream.time_base.den);
        }
        info!("{} ✅ 已打开: {} ({} 个流)", log_ctx(), core.description, core.streams.len());

        status.set(Status::Stopped);
        let worker = Arc::new(Worker::new(core.clone(), status));
        Ok(Self { core, worker })
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.core.streams
    }

    pub fn stream(&self, index: usize) -> Result<&StreamDescriptor> {
        self.core.streams.get(index).ok_or(PipelineError::InvalidStream(index))
    }

    /// 第一个指定类型的流
    pub fn first_stream(&self, kind: MediaKind) -> Option<&StreamDescriptor> {
        self.core.streams.iter().find(|s| s.kind == kind)
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        self.core.enabled.read().get(index).copied().unwrap_or(false)
    }

    /// 启用流；同类型的其它流会被禁用
    pub fn enable_stream(&self, index: usize) -> Result<()> {
        let kind = self.stream(index)?.kind;
        let mut guard = self.core.container.lock();
        let container = guard.as_mut().ok_or(PipelineError::NotOpened)?;

        let mut replaced = Vec::new();
        {
            let mut enabled = self.core.enabled.write();
            for other in self.core.streams.iter().filter(|s| s.kind == kind && s.index != index) {
                if enabled[other.index] {
                    enabled[other.index] = false;
                    container.set_discard(other.index, true);
                    replaced.push(other.index);
                }
            }
            enabled[index] = true;
            container.set_discard(index, false);
        }
        for other in replaced {
            let dropped = self.core.queue(kind).purge_stream(other);
            info!("{} 🔀 流 #{} 替换 #{}，清除 {} 个包", log_ctx(), index, other, dropped);
        }
        self.core.update_tracked();
        debug!("启用流 #{} ({})", index, kind);
        Ok(())
    }

    /// 禁用流并清除其队列中的包
    pub fn disable_stream(&self, index: usize) -> Result<()> {
        let kind = self.stream(index)?.kind;
        {
            let mut guard = self.core.container.lock();
            if let Some(container) = guard.as_mut() {
                container.set_discard(index, true);
            }
            self.core.enabled.write()[index] = false;
            let mut pending = self.core.pending.lock();
            if pending.as_ref().is_some_and(|p| p.stream_index == index) {
                *pending = None;
            }
            let dropped = self.core.queue(kind).purge_stream(index);
            drop(pending);
            debug!("禁用流 #{} ({})，清除 {} 个包", index, kind, dropped);
        }
        self.core.update_tracked();
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        if self.core.container.lock().is_none() {
            return Err(PipelineError::NotOpened);
        }
        self.worker.start()
    }

    pub fn pause(&self) {
        self.worker.pause()
    }

    pub fn stop(&self) {
        for kind in MediaKind::ALL {
            self.core.queue(kind).wake_all();
        }
        self.worker.stop();
    }

    /// 关闭容器；之后所有操作返回 NotOpened
    pub fn close(&self) {
        self.stop();
        if let Err(e) = self.stop_recording() {
            warn!("{} ⚠ 录制收尾失败: {}", log_ctx(), e);
        }
        let closed = {
            let _op = self.core.interrupter.begin(OperationKind::Close);
            self.core.container.lock().take()
        };
        drop(closed);
        self.core.purge_all();
        info!("{} 🧹 Demuxer 已关闭: {}", log_ctx(), self.core.description);
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

    pub fn interrupter(&self) -> &Arc<Interrupter> {
        &self.core.interrupter
    }

    /// 队列内 seek：只在已缓冲的包中移动读位置，不触碰容器
    pub fn seek_in_queue(&self, target: i64, forward: bool) -> bool {
        let core = &self.core;
        if core.is_live {
            return false;
        }
        let Some(kind) = *core.tracked.read() else {
            return false;
        };
        let tolerance = match kind {
            MediaKind::Video => core
                .keyframes
                .lock()
                .max_interval
                .unwrap_or(core.config.keyframe_tolerance_us),
            _ => core.config.in_queue_tolerance_us,
        };

        let mut pending = core.pending.lock();
        let queue = core.queue(kind);
        let landing = queue.with_packets(|items| {
            let (first, last) = queue.window_of(items)?;
            if target < first || target > last + tolerance {
                return None;
            }
            let candidate = |p: &Packet| kind != MediaKind::Video || p.keyframe;
            let found = if forward {
                items.iter().enumerate().find_map(|(i, p)| {
                    let ts = queue.relative_ts(p)?;
                    (candidate(p) && ts >= target).then_some((i, ts))
                })
            } else {
                items.iter().enumerate().rev().find_map(|(i, p)| {
                    let ts = queue.relative_ts(p)?;
                    (candidate(p) && ts <= target).then_some((i, ts))
                })
            };
            let (index, ts) = found?;
            items.drain(..index);
            Some(ts)
        });

        let Some(landing) = landing else {
            debug!("队列内 seek 未命中: {}us ({})", target, kind);
            return false;
        };

        // 其它队列丢弃在落点之前结束的包
        for other in MediaKind::ALL.into_iter().filter(|k| *k != kind) {
            let queue = core.queue(other);
            queue.with_packets(|items| {
                items.retain(|p| match queue.relative_ts(p) {
                    Some(ts) => ts + p.duration_us() >= landing,
                    None => true,
                })
            });
        }
        // 旧的暂存包也可能早于落点
        if pending.as_ref().is_some_and(|p| core.relative_ts(p).is_some_and(|ts| ts < landing)) {
            *pending = None;
        }
        drop(pending);

        info!(
            "{} ⏩ 队列内 seek 成功: 目标 {}us → 落点 {}us，剩余缓冲 {}us",
            log_ctx(),
            target,
            landing,
            core.buffered_duration()
        );
        core.events.emit(PipelineEvent::SeekCompleted { target, in_queue: true });
        true
    }

    /// 容器 seek：中断读操作，冲刷容器，失败时反向重试一次
    ///
    /// 两次都失败只记录日志并发布事件
    pub fn seek(&self, target: i64, forward: bool) -> Result<()> {
        let core = &self.core;
        core.interrupter.request();
        let mut guard = core.container.lock();
        core.interrupter.clear_request();
        let Some(container) = guard.as_mut() else {
            return Err(PipelineError::NotOpened);
        };

        container.flush();
        let timestamp = target + core.start_time_us;
        let direction = SeekDirection::from_forward(forward);
        let result = {
            let _op = core.interrupter.begin(OperationKind::Seek);
            container.seek(timestamp, direction).or_else(|e| {
                warn!("{} ⚠ Seek {:?} 失败 ({})，反向重试", log_ctx(), direction, e);
                container.seek(timestamp, direction.opposite())
            })
        };

        match result {
            Ok(()) => {
                core.purge_all();
                core.keyframes.lock().last = None;
                core.consecutive_errors.store(0, Ordering::Release);
                core.eof.store(false, Ordering::Release);
                info!("{} ⏩ 容器 seek 完成: {}us", log_ctx(), target);
                core.events.emit(PipelineEvent::SeekCompleted { target, in_queue: false });
            }
            Err(e) => {
                error!("{} ❌ Seek 失败: {}us ({})", log_ctx(), target, e);
                core.events.emit(PipelineEvent::SeekFailed { target });
            }
        }
        Ok(())
    }

    /// 开始录制；`start_time` 为 None 时从下一个关键帧开始
    pub fn start_recording(&self, sink: Box<dyn RecordingSink>, start_time: Option<i64>) {
        let gate_kind = match *self.core.tracked.read() {
            Some(MediaKind::Audio) => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let previous = self
            .core
            .recorder
            .lock()
            .replace(Recorder::new(sink, start_time, gate_kind));
        if let Some(previous) = previous {
            if let Err(e) = previous.finish() {
                warn!("{} ⚠ 录制收尾失败: {}", log_ctx(), e);
            }
        }
    }

    pub fn stop_recording(&self) -> Result<()> {
        match self.core.recorder.lock().take() {
            Some(recorder) => recorder.finish(),
            None => Ok(()),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.core.recorder.lock().is_some()
    }

    /// 通过容器为指定流打开解码上下文
    pub fn open_codec(&self, index: usize) -> Result<Box<dyn CodecContext>> {
        self.stream(index)?;
        let guard = self.core.container.lock();
        let container = guard.as_ref().ok_or(PipelineError::NotOpened)?;
        container.open_codec(index)
    }

    pub fn packet_queue(&self, kind: MediaKind) -> Arc<PacketQueue> {
        self.core.queue(kind).clone()
    }

    pub fn buffer_state(&self, kind: MediaKind) -> BufferState {
        self.core.queue(kind).buffer_state()
    }

    /// 跟踪流的已缓冲时长（微秒）
    pub fn buffered_duration(&self) -> i64 {
        self.core.buffered_duration()
    }

    pub fn tracked_kind(&self) -> Option<MediaKind> {
        *self.core.tracked.read()
    }

    /// 至今观察到的最长关键帧间隔
    pub fn keyframe_interval(&self) -> Option<i64> {
        self.core.keyframes.lock().max_interval
    }

    pub fn is_eof(&self) -> bool {
        self.core.eof.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.core.failed.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.core.is_live
    }

    pub fn start_time_us(&self) -> i64 {
        self.core.start_time_us
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.core.duration_us
    }

    pub fn description(&self) -> &str {
        &self.core.description
    }
}
