use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::trace;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::core::status::Status;
use crate::core::types::{AudioSpec, PixelFormat};

/// 管线组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Demuxer,
    AudioDecoder,
    VideoDecoder,
    SubtitleDecoder,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Demuxer => "Demuxer",
            Component::AudioDecoder => "AudioDecoder",
            Component::VideoDecoder => "VideoDecoder",
            Component::SubtitleDecoder => "SubtitleDecoder",
        };
        f.write_str(name)
    }
}

/// 对外通知的管线事件
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StatusChanged {
        component: Component,
        status: Status,
    },
    /// 音频源格式变化，输出管线已重建
    AudioFormatChanged {
        from: AudioSpec,
        to: AudioSpec,
    },
    VideoFormatChanged {
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    /// 音频环形缓冲区重新分配，队列中的帧已失效
    AudioBufferReallocated {
        frame_capacity: usize,
        dropped_frames: usize,
    },
    SeekCompleted {
        target: i64,
        in_queue: bool,
    },
    SeekFailed {
        target: i64,
    },
    ReadError {
        consecutive: u32,
        budget: u32,
    },
    SpeedChanged {
        from: f64,
        to: f64,
    },
    EndOfStream {
        component: Component,
    },
}

/// 每个订阅者最多积压的事件数
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// 事件总线：向所有订阅者广播
///
/// 订阅者积压满时丢弃新事件，不阻塞发布方
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<PipelineEvent>>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: PipelineEvent) {
        let mut subscribers = self.subscribers.lock();
        // 接收端已关闭的订阅者直接移除
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                trace!("事件积压已满，丢弃: {:?}", dropped);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_drops_closed_subscribers() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        {
            let _closed = bus.subscribe();
        }
        bus.emit(PipelineEvent::SeekFailed { target: 5 });
        assert_eq!(rx.try_recv().ok(), Some(PipelineEvent::SeekFailed { target: 5 }));
        assert_eq!(bus.subscribers.lock().len(), 1);
    }

    #[test]
    fn test_idle_subscriber_is_bounded() {
        let bus = EventBus::with_capacity(8);
        let idle = bus.subscribe();
        for target in 0..100 {
            bus.emit(PipelineEvent::SeekFailed { target });
        }
        assert_eq!(idle.len(), 8);
        // 保留最早的事件，订阅者不被移除
        assert_eq!(idle.try_recv().ok(), Some(PipelineEvent::SeekFailed { target: 0 }));
        bus.emit(PipelineEvent::SeekFailed { target: 100 });
        assert_eq!(idle.len(), 8);
        assert_eq!(bus.subscribers.lock().len(), 1);
    }
}
