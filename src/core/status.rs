use log::debug;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::core::events::{Component, EventBus, PipelineEvent};

/// Demuxer 与各解码器共用的状态词汇
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Stopped,
    Opening,
    /// 解封装中 / 解码中
    Running,
    /// 下游队列已满，等待消费
    QueueFull,
    /// 输入队列为空，等待数据
    QueueEmpty,
    /// 输入耗尽，正在冲刷
    Draining,
    Pausing,
    Paused,
    Stopping,
    Ended,
}

impl Status {
    /// 工作体可以继续运行的状态
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Status::Running | Status::QueueFull | Status::QueueEmpty | Status::Draining
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 带条件变量的状态单元
///
/// 所有状态迁移都经过这里：唤醒等待者并广播事件
pub struct StatusCell {
    component: Component,
    state: Mutex<Status>,
    changed: Condvar,
    events: EventBus,
}

impl StatusCell {
    pub fn new(component: Component, initial: Status, events: EventBus) -> Self {
        Self {
            component,
            state: Mutex::new(initial),
            changed: Condvar::new(),
            events,
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn get(&self) -> Status {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.get().is_active()
    }

    pub fn set(&self, status: Status) {
        self.transition(|_| Some(status));
    }

    /// 仅当当前状态为 `expected` 时迁移
    pub fn compare_and_set(&self, expected: Status, status: Status) -> bool {
        self.transition(|current| (current == expected).then_some(status))
            .is_some()
    }

    /// 仅当当前为活动状态时迁移（不会覆盖 Pausing/Stopping 请求）
    pub fn set_if_active(&self, status: Status) -> bool {
        self.transition(|current| current.is_active().then_some(status))
            .is_some()
    }

    /// 原子迁移：闭包返回 Some(新状态) 时生效，返回迁移后的状态
    pub fn transition<F>(&self, f: F) -> Option<Status>
    where
        F: FnOnce(Status) -> Option<Status>,
    {
        let (old, new) = {
            let mut state = self.state.lock();
            let old = *state;
            let new = f(old)?;
            *state = new;
            (old, new)
        };
        self.changed.notify_all();
        if old != new {
            debug!("{} 状态: {} → {}", self.component, old, new);
            self.events.emit(PipelineEvent::StatusChanged {
                component: self.component,
                status: new,
            });
        }
        Some(new)
    }

    /// 阻塞等待，直到谓词不再成立，返回当时的状态
    pub fn wait_while<F>(&self, mut pred: F) -> Status
    where
        F: FnMut(Status) -> bool,
    {
        let mut state = self.state.lock();
        while pred(*state) {
            self.changed.wait(&mut state);
        }
        *state
    }

    /// 带超时的等待
    pub fn wait_while_for<F>(&self, mut pred: F, timeout: Duration) -> Status
    where
        F: FnMut(Status) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while pred(*state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCell")
            .field("component", &self.component)
            .field("state", &self.get())
            .finish()
    }
}
