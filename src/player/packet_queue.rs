use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::core::{MediaKind, Packet};
use crate::player::queue::BoundedQueue;

/// 单个数据包队列的缓冲统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferState {
    pub packet_count: usize,
    /// 队首到队尾的时间跨度（微秒，永不为负）
    pub buffered_duration: i64,
    pub max_queue_size: usize,
    pub max_buffered_duration: i64,
}

/// 按流类型划分的数据包队列
///
/// 时间均为相对容器起点的微秒
pub struct PacketQueue {
    kind: MediaKind,
    queue: BoundedQueue<Packet>,
    start_time_us: i64,
    max_buffered_duration: i64,
    last_duration: AtomicI64,
}

impl PacketQueue {
    pub fn new(kind: MediaKind, max_packets: usize, max_buffered_duration: i64, start_time_us: i64) -> Self {
        Self {
            kind,
            queue: BoundedQueue::new(max_packets),
            start_time_us,
            max_buffered_duration,
            last_duration: AtomicI64::new(0),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn push(&self, packet: Packet) -> Result<(), Packet> {
        self.queue.try_push(packet)
    }

    pub fn try_pop(&self) -> Option<Packet> {
        self.queue.try_pop()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Packet> {
        self.queue.pop_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn max_buffered_duration(&self) -> i64 {
        self.max_buffered_duration
    }

    pub fn wait_for_pop(&self, timeout: Duration) {
        self.queue.wait_for_pop(timeout)
    }

    pub fn wake_all(&self) {
        self.queue.wake_all()
    }

    /// 包的相对时间戳（微秒）
    pub fn relative_ts(&self, packet: &Packet) -> Option<i64> {
        packet.timestamp_us().map(|ts| ts - self.start_time_us)
    }

    /// 清空队列，返回丢弃的包数
    pub fn flush(&self) -> usize {
        let dropped = self.queue.flush();
        self.last_duration.store(0, Ordering::Release);
        dropped
    }

    /// 只清除指定流的包
    pub fn purge_stream(&self, stream_index: usize) -> usize {
        self.queue.with_items(|items| {
            let before = items.len();
            items.retain(|p| p.stream_index != stream_index);
            before - items.len()
        })
    }

    /// 在锁内操作队列（队列内 seek）
    pub fn with_packets<R>(&self, f: impl FnOnce(&mut VecDeque<Packet>) -> R) -> R {
        self.queue.with_items(f)
    }

    /// 第一个与最后一个有效时间戳（相对微秒）
    pub fn time_window(&self) -> Option<(i64, i64)> {
        self.queue.with_items(|items| self.window_of(items))
    }

    pub(crate) fn window_of(&self, items: &VecDeque<Packet>) -> Option<(i64, i64)> {
        let first = items.iter().find_map(|p| self.relative_ts(p))?;
        let last = items.iter().rev().find_map(|p| self.relative_ts(p))?;
        Some((first, last))
    }

    /// 已缓冲时长：最后有效时间戳 - 第一个有效时间戳
    ///
    /// 时间戳回退导致负值时保留上一次的有效值
    pub fn buffered_duration(&self) -> i64 {
        let window = self.time_window();
        match window {
            None => {
                self.last_duration.store(0, Ordering::Release);
                0
            }
            Some((first, last)) => {
                let raw = last - first;
                if raw < 0 {
                    self.last_duration.load(Ordering::Acquire)
                } else {
                    self.last_duration.store(raw, Ordering::Release);
                    raw
                }
            }
        }
    }

    pub fn buffer_state(&self) -> BufferState {
        BufferState {
            packet_count: self.len(),
            buffered_duration: self.buffered_duration(),
            max_queue_size: self.capacity(),
            max_buffered_duration: self.max_buffered_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Rational;

    fn packet(ms: i64) -> Packet {
        Packet::new(MediaKind::Video, 0, Rational::new(1, 1000), vec![0u8; 4])
            .with_pts(ms)
            .with_duration(40)
    }

    #[test]
    fn test_buffered_duration_window() {
        let queue = PacketQueue::new(MediaKind::Video, 8, 5_000_000, 0);
        assert_eq!(queue.buffered_duration(), 0);
        queue.push(packet(1_000)).unwrap();
        queue.push(Packet::new(MediaKind::Video, 0, Rational::new(1, 1000), vec![])).unwrap();
        queue.push(packet(1_500)).unwrap();
        assert_eq!(queue.buffered_duration(), 500_000);
    }

    #[test]
    fn test_negative_duration_keeps_last_good_value() {
        let queue = PacketQueue::new(MediaKind::Video, 8, 5_000_000, 0);
        queue.push(packet(1_000)).unwrap();
        queue.push(packet(1_200)).unwrap();
        assert_eq!(queue.buffered_duration(), 200_000);

        // 时间戳回退
        queue.push(packet(900)).unwrap();
        assert_eq!(queue.buffered_duration(), 200_000);

        queue.flush();
        assert_eq!(queue.buffered_duration(), 0);
    }

    #[test]
    fn test_relative_to_container_start() {
        let queue = PacketQueue::new(MediaKind::Video, 8, 5_000_000, 1_000_000);
        queue.push(packet(1_040)).unwrap();
        assert_eq!(queue.time_window(), Some((40_000, 40_000)));
    }

    #[test]
    fn test_purge_stream_and_buffer_state() {
        let queue = PacketQueue::new(MediaKind::Audio, 3, 1_000_000, 0);
        let mut other = packet(10);
        other.stream_index = 7;
        queue.push(packet(0)).unwrap();
        queue.push(other).unwrap();
        queue.push(packet(20)).unwrap();
        assert!(queue.push(packet(30)).is_err());

        assert_eq!(queue.purge_stream(7), 1);
        let state = queue.buffer_state();
        assert_eq!(state.packet_count, 2);
        assert_eq!(state.buffered_duration, 20_000);
        assert_eq!(state.max_queue_size, 3);
    }
}
