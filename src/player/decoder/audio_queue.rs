use log::{debug, warn};
use parking_lot::Mutex;
use std::time::Duration;

use crate::core::{AudioFrame, EventBus, OutputFormat, PipelineEvent};
use crate::player::decoder::arena::{ArenaSlot, SampleArena};
use crate::player::decoder::resample::stretch;
use crate::player::queue::BoundedQueue;

/// 排队中的音频帧：时间戳 + 环形缓冲区窗口
#[derive(Debug, Clone, Copy)]
pub struct QueuedAudio {
    /// 媒体时间（微秒）
    pub timestamp: i64,
    pub frames: usize,
    pub slot: ArenaSlot,
}

/// 音频输出队列
///
/// 帧数据放在共享的环形缓冲区里；出队时拷贝出来，之后窗口才可复用。
/// 锁顺序：环形缓冲区 → 队列
pub struct AudioFrameQueue {
    format: OutputFormat,
    arena: Mutex<SampleArena>,
    queue: BoundedQueue<QueuedAudio>,
    events: EventBus,
}

impl AudioFrameQueue {
    /// `frame_capacity` 为单帧最大采样帧数
    pub fn new(format: OutputFormat, limit: usize, frame_capacity: usize, events: EventBus) -> Self {
        let limit = limit.max(1);
        // 预留 3 帧余量，写游标不会追上排队中的窗口
        let arena = SampleArena::new(frame_capacity * format.frame_bytes(), limit + 3);
        Self {
            format,
            arena: Mutex::new(arena),
            queue: BoundedQueue::new(limit),
            events,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// 单帧容量（采样帧）
    pub fn frame_capacity(&self) -> usize {
        self.arena.lock().slot_bytes() / self.format.frame_bytes()
    }

    pub fn wait_not_full(&self, timeout: Duration) -> bool {
        self.queue.wait_not_full(timeout)
    }

    /// 写入一帧输出样本（编码后的字节）
    ///
    /// 超过单帧容量时重新分配缓冲区，排队中的帧作废并丢弃
    pub fn push_samples(&self, timestamp: i64, bytes: &[u8]) -> bool {
        let frame_bytes = self.format.frame_bytes();
        let frames = bytes.len() / frame_bytes;
        let mut arena = self.arena.lock();

        if bytes.len() > arena.slot_bytes() {
            let dropped = self.queue.flush();
            let new_frames = frames.next_power_of_two();
            arena.reallocate(new_frames * frame_bytes);
            warn!("⚠ 音频帧 {} 超出缓冲区单帧容量，重新分配为 {} (丢弃 {} 帧)", frames, new_frames, dropped);
            self.events.emit(PipelineEvent::AudioBufferReallocated {
                frame_capacity: new_frames,
                dropped_frames: dropped,
            });
        }

        let slot = arena.alloc(frames * frame_bytes);
        match arena.slice_mut(&slot) {
            Some(window) => window.copy_from_slice(&bytes[..slot.len]),
            None => return false,
        }
        self.queue
            .try_push(QueuedAudio {
                timestamp,
                frames,
                slot,
            })
            .is_ok()
    }

    /// 取出一帧并拷贝数据；失效的窗口直接跳过
    pub fn pop(&self) -> Option<AudioFrame> {
        let arena = self.arena.lock();
        loop {
            let item = self.queue.try_pop()?;
            let Some(data) = arena.slice(&item.slot) else {
                debug!("跳过失效的音频帧 @{}us", item.timestamp);
                continue;
            };
            return Some(AudioFrame {
                timestamp: item.timestamp,
                duration: self.format.frames_to_us(item.frames),
                frames: item.frames,
                format: self.format,
                data: data.to_vec(),
            });
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        if !self.queue.wait_not_empty(timeout) {
            return None;
        }
        self.pop()
    }

    /// 队首帧的时间戳
    pub fn front_timestamp(&self) -> Option<i64> {
        self.queue.front().map(|item| item.timestamp)
    }

    /// 所有排队帧的时间戳
    pub fn timestamps(&self) -> Vec<i64> {
        self.queue.with_items(|items| items.iter().map(|item| item.timestamp).collect())
    }

    /// 排队帧的总播放时长（微秒）
    pub fn total_duration(&self) -> i64 {
        let frames: usize = self.queue.with_items(|items| items.iter().map(|item| item.frames).sum());
        self.format.frames_to_us(frames)
    }

    pub fn flush(&self) -> usize {
        let _arena = self.arena.lock();
        self.queue.flush()
    }

    /// 速率变化时重排排队帧
    ///
    /// 时间戳：`n_old = round((ts - first) / (period·old))`，`n_new = round(n_old·old/new)`，
    /// `ts' = first + n_new·period·new`；长度按 `old/new` 缩放并对齐到采样帧。
    /// 旧窗口先填静音，新窗口从第一个窗口的偏移开始依次排布，越界则回绕。
    /// 放慢后单帧超出容量时先重新分配缓冲区，再从起点排布。
    pub fn retime(&self, old: f64, new: f64, first: i64) {
        if old == new || old <= 0.0 || new <= 0.0 {
            return;
        }
        let format = self.format;
        let channels = format.channels as usize;
        let frame_bytes = format.frame_bytes();
        let period = format.sample_period_us();

        let mut arena = self.arena.lock();
        let reallocated = self.queue.with_items(|items| {
            let base = items.front()?.slot.offset;

            let payloads: Vec<Option<Vec<f32>>> = items
                .iter()
                .map(|item| arena.slice(&item.slot).map(|bytes| format.decode(bytes)))
                .collect();
            let resized: Vec<usize> = items
                .iter()
                .map(|item| ((item.frames as f64 * old / new).round() as usize).max(1))
                .collect();

            let needed = resized.iter().copied().max().unwrap_or(1);
            let mut reallocated = None;
            if needed * frame_bytes > arena.slot_bytes() {
                let frame_capacity = needed.next_power_of_two();
                arena.reallocate(frame_capacity * frame_bytes);
                reallocated = Some(frame_capacity);
            } else {
                for item in items.iter() {
                    arena.fill_silence(&item.slot);
                }
                arena.set_cursor(base);
            }

            for ((item, payload), frames) in items.iter_mut().zip(payloads).zip(resized) {
                let n_old = ((item.timestamp - first) as f64 / (period * old)).round();
                let n_new = (n_old * old / new).round();
                item.timestamp = first + (n_new * period * new).round() as i64;

                let samples = match payload {
                    Some(samples) => stretch(&samples, channels, frames),
                    None => vec![0.0; frames * channels],
                };
                let slot = arena.alloc(frames * frame_bytes);
                if let Some(window) = arena.slice_mut(&slot) {
                    window.copy_from_slice(&format.encode(&samples));
                }
                item.frames = frames;
                item.slot = slot;
            }
            reallocated
        });
        drop(arena);

        if let Some(frame_capacity) = reallocated {
            warn!("⚠ 音频队列重排超出单帧容量，重新分配为 {}", frame_capacity);
            self.events.emit(PipelineEvent::AudioBufferReallocated {
                frame_capacity,
                dropped_frames: 0,
            });
        }
        debug!("🎚 音频队列重排: ×{} → ×{}", old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SampleFormat;
    use proptest::prelude::*;

    fn format() -> OutputFormat {
        OutputFormat {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::F32,
        }
    }

    /// 以 1.0 倍速连续写入 `count` 帧，每帧 `frames` 个采样帧
    fn filled(count: usize, frames: usize) -> AudioFrameQueue {
        let queue = AudioFrameQueue::new(format(), 32, 4096, EventBus::new());
        let period = format().sample_period_us();
        for i in 0..count {
            let samples = vec![0.25f32; frames * 2];
            let ts = (i as f64 * frames as f64 * period).round() as i64;
            assert!(queue.push_samples(ts, &format().encode(&samples)));
        }
        queue
    }

    #[test]
    fn test_pop_copies_window() {
        let queue = filled(2, 480);
        let frame = queue.pop().unwrap();
        assert_eq!(frame.frames, 480);
        assert_eq!(frame.duration, 10_000);
        assert_eq!(frame.data.len(), 480 * 8);
        assert_eq!(format().decode(&frame.data)[0], 0.25);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_same_speed_is_noop() {
        let queue = filled(5, 1024);
        let before = queue.timestamps();
        let duration = queue.total_duration();
        queue.retime(1.5, 1.5, 0);
        assert_eq!(queue.timestamps(), before);
        assert_eq!(queue.total_duration(), duration);
    }

    #[test]
    fn test_double_speed_halves_queued_duration() {
        let queue = filled(20, 1024);
        let before = queue.total_duration();
        let timestamps = queue.timestamps();

        queue.retime(1.0, 2.0, 0);
        assert_eq!(queue.total_duration(), before / 2);
        // 媒体时间基本不变
        for (old, new) in timestamps.iter().zip(queue.timestamps()) {
            assert!((old - new).abs() <= 42, "{} vs {}", old, new);
        }
        let frame = queue.pop().unwrap();
        assert_eq!(frame.frames, 512);
        assert!((format().decode(&frame.data)[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_oversized_frame_reallocates() {
        let events = EventBus::new();
        let rx = events.subscribe();
        let queue = AudioFrameQueue::new(format(), 8, 256, events);
        assert!(queue.push_samples(0, &format().encode(&vec![0.0; 256 * 2])));
        assert!(queue.push_samples(5_333, &format().encode(&vec![0.0; 300 * 2])));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.frame_capacity(), 512);
        assert_eq!(
            rx.try_recv().ok(),
            Some(PipelineEvent::AudioBufferReallocated {
                frame_capacity: 512,
                dropped_frames: 1
            })
        );
    }

    /// 反复写入再取出，推进写游标
    fn advance_cursor(queue: &AudioFrameQueue, frames: usize, times: usize) {
        for _ in 0..times {
            assert!(queue.push_samples(0, &format().encode(&vec![0.0; frames * 2])));
            assert!(queue.pop().is_some());
        }
    }

    fn live_windows(queue: &AudioFrameQueue) -> Vec<ArenaSlot> {
        queue.queue.with_items(|items| items.iter().map(|item| item.slot).collect())
    }

    #[test]
    fn test_retime_wraps_windows_at_arena_end() {
        // 单帧 4096 采样帧，7 个窗口：共 229_376 字节
        let queue = AudioFrameQueue::new(format(), 4, 4096, EventBus::new());
        advance_cursor(&queue, 1024, 25);
        assert_eq!(queue.arena.lock().cursor(), 25 * 8192);

        let period = format().sample_period_us();
        let values = [0.1f32, 0.2, 0.3];
        for (i, value) in values.iter().enumerate() {
            let ts = (i as f64 * 1024.0 * period * 2.0).round() as i64;
            assert!(queue.push_samples(ts, &format().encode(&vec![*value; 1024 * 2])));
        }
        let offsets: Vec<usize> = live_windows(&queue).iter().map(|slot| slot.offset).collect();
        assert_eq!(offsets, vec![204_800, 212_992, 221_184]);

        // 放慢一倍：每帧 16_384 字节，第二帧越过末尾回绕到起点
        queue.retime(2.0, 1.0, 0);
        let windows = live_windows(&queue);
        let offsets: Vec<usize> = windows.iter().map(|slot| slot.offset).collect();
        assert_eq!(offsets, vec![204_800, 0, 16_384]);
        assert_eq!(windows.last().unwrap().offset + windows.last().unwrap().len, queue.arena.lock().cursor());

        let mut sorted = windows.clone();
        sorted.sort_by_key(|slot| slot.offset);
        for pair in sorted.windows(2) {
            assert!(pair[0].offset + pair[0].len <= pair[1].offset, "{:?} 与 {:?} 重叠", pair[0], pair[1]);
        }

        for value in values {
            let frame = queue.pop().unwrap();
            assert_eq!(frame.frames, 2048);
            assert!(format().decode(&frame.data).iter().all(|s| (s - value).abs() < 1e-6));
        }
    }

    #[test]
    fn test_retime_past_frame_capacity_reallocates() {
        let events = EventBus::new();
        let rx = events.subscribe();
        let queue = AudioFrameQueue::new(format(), 8, 1024, events);
        let period = format().sample_period_us();
        for i in 0..2 {
            let ts = (i as f64 * 1024.0 * period).round() as i64;
            assert!(queue.push_samples(ts, &format().encode(&vec![0.5; 1024 * 2])));
        }
        let before = queue.total_duration();

        // 放慢到 0.5 倍：每帧 2048 采样帧，超出 1024 的单帧容量
        queue.retime(1.0, 0.5, 0);
        assert_eq!(queue.frame_capacity(), 2048);
        assert_eq!(queue.len(), 2);
        assert!((queue.total_duration() - before * 2).abs() <= 1);
        assert_eq!(
            rx.try_recv().ok(),
            Some(PipelineEvent::AudioBufferReallocated {
                frame_capacity: 2048,
                dropped_frames: 0
            })
        );
        for _ in 0..2 {
            let frame = queue.pop().unwrap();
            assert_eq!(frame.frames, 2048);
            assert!(format().decode(&frame.data).iter().all(|s| (s - 0.5).abs() < 1e-6));
        }
    }

    proptest! {
        #[test]
        fn prop_speed_round_trip_restores_timestamps(
            s1 in 0.25f64..4.0,
            s2 in 0.25f64..4.0,
            count in 1usize..16,
        ) {
            let period = format().sample_period_us();
            let queue = AudioFrameQueue::new(format(), 32, 32_768, EventBus::new());
            let frames = 1024usize;
            let first = 1_000_000i64;
            for i in 0..count {
                // 按 s1 速率下的输出计数生成时间戳
                let n = (i * frames) as f64;
                let ts = first + (n * period * s1).round() as i64;
                queue.push_samples(ts, &format().encode(&vec![0.0; frames * 2]));
            }
            let before = queue.timestamps();

            queue.retime(s1, s2, first);
            queue.retime(s2, s1, first);

            let tolerance = (period * s1.max(s2)).ceil() as i64 + 2;
            for (a, b) in before.iter().zip(queue.timestamps()) {
                prop_assert!((a - b).abs() <= tolerance, "{} vs {} (tol {})", a, b, tolerance);
            }
        }
    }
}
