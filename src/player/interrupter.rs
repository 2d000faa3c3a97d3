use log::debug;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{Status, StatusCell, Timeouts};

/// 引擎阻塞调用的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Open,
    Read,
    Seek,
    Close,
}

/// 中止原因（按优先级排列）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Demuxer 正在停止，永远优先
    Stopping,
    Timeout,
    Requested,
}

/// 阻塞调用的中断判定
///
/// 引擎在 open/read/seek/close 期间反复调用 `should_abort`；返回 true 时
/// 引擎调用以 `Interrupted` 返回。
pub struct Interrupter {
    owner: Arc<StatusCell>,
    timeouts: Timeouts,
    suppress_read_interrupts: bool,
    requested: Mutex<bool>,
    request_cleared: Condvar,
    current: Mutex<Option<(OperationKind, Instant)>>,
    last_abort: Mutex<Option<AbortReason>>,
}

/// 当前操作的登记凭证，离开作用域时注销
pub struct OperationGuard<'a> {
    interrupter: &'a Interrupter,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        *self.interrupter.current.lock() = None;
    }
}

impl Interrupter {
    pub fn new(owner: Arc<StatusCell>, timeouts: Timeouts, suppress_read_interrupts: bool) -> Self {
        Self {
            owner,
            timeouts,
            suppress_read_interrupts,
            requested: Mutex::new(false),
            request_cleared: Condvar::new(),
            current: Mutex::new(None),
            last_abort: Mutex::new(None),
        }
    }

    pub fn timeout_for(&self, kind: OperationKind) -> Duration {
        let ms = match kind {
            OperationKind::Open => self.timeouts.open_ms,
            OperationKind::Read => self.timeouts.read_ms,
            OperationKind::Seek => self.timeouts.seek_ms,
            OperationKind::Close => self.timeouts.close_ms,
        };
        Duration::from_millis(ms)
    }

    /// 登记一次阻塞操作，超时从此刻开始计算
    pub fn begin(&self, kind: OperationKind) -> OperationGuard<'_> {
        *self.current.lock() = Some((kind, Instant::now()));
        *self.last_abort.lock() = None;
        OperationGuard { interrupter: self }
    }

    pub fn current_operation(&self) -> Option<OperationKind> {
        self.current.lock().map(|(kind, _)| kind)
    }

    /// 判定当前操作是否应中止，并记录原因
    pub fn check(&self) -> Option<AbortReason> {
        let reason = self.evaluate();
        if let Some(reason) = reason {
            let mut last = self.last_abort.lock();
            if last.is_none() {
                debug!("⛔ 中断引擎调用: {:?} ({:?})", self.current_operation(), reason);
            }
            *last = Some(reason);
        }
        reason
    }

    pub fn should_abort(&self) -> bool {
        self.check().is_some()
    }

    fn evaluate(&self) -> Option<AbortReason> {
        if self.owner.get() == Status::Stopping {
            return Some(AbortReason::Stopping);
        }
        let current = *self.current.lock();
        if let Some((kind, started)) = current {
            if started.elapsed() >= self.timeout_for(kind) {
                return Some(AbortReason::Timeout);
            }
        }
        if *self.requested.lock() {
            let suppressed = self.suppress_read_interrupts
                && matches!(current, Some((OperationKind::Read, _)));
            if !suppressed {
                return Some(AbortReason::Requested);
            }
        }
        None
    }

    /// 取出最近一次中止的原因
    pub fn take_abort(&self) -> Option<AbortReason> {
        self.last_abort.lock().take()
    }

    /// 请求中断当前阻塞调用（seek 前调用）
    pub fn request(&self) {
        *self.requested.lock() = true;
    }

    /// 请求方已拿到容器锁后撤销请求
    pub fn clear_request(&self) {
        *self.requested.lock() = false;
        self.request_cleared.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.lock()
    }

    /// 等待中断请求被撤销，返回是否已撤销
    pub fn wait_request_cleared(&self, timeout: Duration) -> bool {
        let mut requested = self.requested.lock();
        if *requested {
            self.request_cleared.wait_for(&mut requested, timeout);
        }
        !*requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Component, EventBus};

    fn interrupter(status: Status, suppress: bool) -> (Arc<StatusCell>, Interrupter) {
        let owner = Arc::new(StatusCell::new(Component::Demuxer, status, EventBus::new()));
        let timeouts = Timeouts {
            open_ms: 1_000,
            read_ms: 30,
            seek_ms: 1_000,
            close_ms: 1_000,
        };
        (owner.clone(), Interrupter::new(owner, timeouts, suppress))
    }

    #[test]
    fn test_stopping_wins_over_everything() {
        let (owner, interrupter) = interrupter(Status::Running, false);
        let _op = interrupter.begin(OperationKind::Read);
        interrupter.request();
        owner.set(Status::Stopping);
        assert_eq!(interrupter.check(), Some(AbortReason::Stopping));
    }

    #[test]
    fn test_timeout_per_operation_kind() {
        let (_owner, interrupter) = interrupter(Status::Running, false);
        {
            let _op = interrupter.begin(OperationKind::Read);
            assert_eq!(interrupter.check(), None);
            std::thread::sleep(Duration::from_millis(40));
            assert_eq!(interrupter.check(), Some(AbortReason::Timeout));
            assert_eq!(interrupter.take_abort(), Some(AbortReason::Timeout));
        }
        let _op = interrupter.begin(OperationKind::Seek);
        assert!(!interrupter.should_abort());
    }

    #[test]
    fn test_requested_interrupt() {
        let (_owner, interrupter) = interrupter(Status::Running, false);
        let _op = interrupter.begin(OperationKind::Read);
        interrupter.request();
        assert!(interrupter.is_requested());
        assert_eq!(interrupter.check(), Some(AbortReason::Requested));
        interrupter.clear_request();
        assert!(!interrupter.is_requested());
        assert!(!interrupter.should_abort());
        assert!(interrupter.wait_request_cleared(Duration::ZERO));
    }

    #[test]
    fn test_read_ignores_requests_when_suppressed() {
        let (_owner, interrupter) = interrupter(Status::Running, true);
        interrupter.request();
        {
            let _op = interrupter.begin(OperationKind::Read);
            assert!(!interrupter.should_abort());
        }
        let _op = interrupter.begin(OperationKind::Seek);
        assert_eq!(interrupter.check(), Some(AbortReason::Requested));
    }
}
