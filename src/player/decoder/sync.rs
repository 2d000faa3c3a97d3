use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// 音视频起点同步
///
/// 视频解码器发布第一帧的时间戳，音频解码器在此之前丢弃输出
#[derive(Debug, Default)]
pub struct AvSync {
    has_video: AtomicBool,
    video_start: Mutex<Option<i64>>,
}

impl AvSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_video(&self) -> bool {
        self.has_video.load(Ordering::Acquire)
    }

    /// 视频解码器打开/停止时设置；无视频时音频门限直接放行
    pub fn set_has_video(&self, has_video: bool) {
        self.has_video.store(has_video, Ordering::Release);
    }

    /// 发布视频起点（每次启动/seek 只生效一次）
    pub fn publish_video_start(&self, timestamp: i64) -> bool {
        let mut start = self.video_start.lock();
        if start.is_some() {
            return false;
        }
        *start = Some(timestamp);
        true
    }

    pub fn video_start(&self) -> Option<i64> {
        *self.video_start.lock()
    }

    /// seek 后重新等待视频起点
    pub fn reset(&self) {
        *self.video_start.lock() = None;
    }
}
