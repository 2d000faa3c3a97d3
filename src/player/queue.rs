use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// 有界 FIFO 队列（条件变量驱动，不轮询）
///
/// 生产者用 `try_push` + `wait_not_full` 实现背压，消费者用 `pop_timeout`
/// 等待数据；所有等待都带超时，调用方借此定期复查自身状态。
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.lock().len() >= self.capacity
    }

    /// 非阻塞入队，队列满时原样返回
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 等待空位后入队，超时则原样返回
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            self.not_full.wait_for(&mut items, timeout);
            if items.len() >= self.capacity {
                return Err(item);
            }
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_all();
        }
        item
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.not_empty.wait_for(&mut items, timeout);
        }
        let item = items.pop_front();
        drop(items);
        if item.is_some() {
            self.not_full.notify_all();
        }
        item
    }

    /// 等待队列出现空位，返回是否有空位
    pub fn wait_not_full(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity && !timeout.is_zero() {
            self.not_full.wait_for(&mut items, timeout);
        }
        items.len() < self.capacity
    }

    /// 等待队列非空，返回是否有数据
    pub fn wait_not_empty(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if items.is_empty() && !timeout.is_zero() {
            self.not_empty.wait_for(&mut items, timeout);
        }
        !items.is_empty()
    }

    /// 等待一次出队/清空（用于按时长背压：数量未满但时长超限）
    pub fn wait_for_pop(&self, timeout: Duration) {
        let mut items = self.items.lock();
        self.not_full.wait_for(&mut items, timeout);
    }

    /// 清空队列，返回丢弃的元素数
    pub fn flush(&self) -> usize {
        let dropped = {
            let mut items = self.items.lock();
            let n = items.len();
            items.clear();
            n
        };
        self.not_full.notify_all();
        dropped
    }

    /// 在锁内直接操作底层队列（队列内 seek、重排时间戳）
    ///
    /// 闭包不得让长度超过容量
    pub fn with_items<R>(&self, f: impl FnOnce(&mut VecDeque<T>) -> R) -> R {
        let result = {
            let mut items = self.items.lock();
            let result = f(&mut items);
            items.truncate(self.capacity);
            result
        };
        self.not_full.notify_all();
        self.not_empty.notify_all();
        result
    }

    /// 唤醒所有等待者（停止时使用）
    pub fn wake_all(&self) {
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

impl<T: Clone> BoundedQueue<T> {
    pub fn front(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_push_respects_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert_eq!(queue.try_push(3), Err(3));
        assert_eq!(queue.len(), 2);
        assert!(queue.is_full());
    }

    #[test]
    fn test_push_timeout_wakes_on_pop() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.try_push(1).unwrap();

        let consumer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            consumer.try_pop()
        });

        assert!(queue.push_timeout(2, Duration::from_secs(2)).is_ok());
        assert_eq!(handle.join().unwrap(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[test]
    fn test_pop_timeout_on_empty() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        assert_eq!(queue.pop_timeout(Duration::from_millis(5)), None);
        assert!(!queue.wait_not_empty(Duration::ZERO));
    }

    #[test]
    fn test_flush_and_with_items() {
        let queue = BoundedQueue::new(8);
        for i in 0..6 {
            queue.try_push(i).unwrap();
        }
        let removed = queue.with_items(|items| {
            let before = items.len();
            items.retain(|v| v % 2 == 0);
            before - items.len()
        });
        assert_eq!(removed, 3);
        assert_eq!(queue.front(), Some(0));
        assert_eq!(queue.flush(), 3);
        assert!(queue.is_empty());
        assert!(queue.wait_not_full(Duration::ZERO));
    }
}
