use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 播放时钟 - 用于音视频同步
///
/// 媒体时间 = 基准 + 实际流逝 × 速率（微秒）
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_pts: i64,              // 基准 PTS（微秒）
    base_instant: Instant,      // 基准时刻
    playback_rate: f64,         // 播放速率（1.0 = 正常）
    paused: bool,
    paused_at: i64,             // 暂停时的位置
}

impl ClockInner {
    fn now(&self) -> i64 {
        if self.paused {
            self.paused_at
        } else {
            let elapsed = self.base_instant.elapsed().as_micros() as f64;
            self.base_pts + (elapsed * self.playback_rate) as i64
        }
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_pts: 0,
                base_instant: Instant::now(),
                playback_rate: 1.0,
                paused: true,
                paused_at: 0,
            })),
        }
    }

    /// 获取当前播放时间（微秒）
    pub fn now(&self) -> i64 {
        self.inner.lock().now()
    }

    /// 设置播放位置
    pub fn set_time(&self, pts: i64) {
        let mut inner = self.inner.lock();
        inner.base_pts = pts;
        inner.base_instant = Instant::now();
        inner.paused_at = pts;
    }

    /// 开始播放
    pub fn play(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            inner.base_pts = inner.paused_at;
            inner.base_instant = Instant::now();
            inner.paused = false;
        }
    }

    /// 暂停播放
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.paused_at = inner.now();
            inner.paused = true;
        }
    }

    /// 设置播放速率（从当前位置重新起算）
    pub fn set_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            let current_time = inner.now();
            inner.base_pts = current_time;
            inner.base_instant = Instant::now();
        }
        inner.playback_rate = rate;
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().playback_rate
    }

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_paused_clock_holds_position() {
        let clock = PlaybackClock::new();
        clock.set_time(5_000_000);
        thread::sleep(Duration::from_millis(10));
        assert!(clock.is_paused());
        assert_eq!(clock.now(), 5_000_000);
    }

    #[test]
    fn test_rate_scales_elapsed_time() {
        let clock = PlaybackClock::new();
        clock.set_rate(2.0);
        clock.play();
        thread::sleep(Duration::from_millis(50));
        clock.pause();
        let now = clock.now();
        assert!(now >= 100_000, "2x 速率下 50ms 应至少推进 100ms, 实际 {}", now);
        assert_eq!(clock.rate(), 2.0);
    }
}
