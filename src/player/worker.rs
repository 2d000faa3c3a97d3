use log::{info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::core::{PipelineError, Result, Status, StatusCell};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 工作线程的循环体
///
/// `run` 在状态为活动态时循环执行，状态离开活动态后返回
pub trait WorkerBody: Send + Sync + 'static {
    fn name(&self) -> String;
    fn run(&self, status: &StatusCell);
}

/// 通用工作线程状态机（Demuxer 与各解码器共用）
///
/// - `start()`：Paused → Running；Stopped/Ended → 新建线程
/// - `pause()`：请求在下一个安全点退出循环体，阻塞直到 Paused
/// - `stop()`：任何状态下都可调用，阻塞直到线程退出
pub struct Worker<B: WorkerBody> {
    body: Arc<B>,
    status: Arc<StatusCell>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B: WorkerBody> Worker<B> {
    pub fn new(body: Arc<B>, status: Arc<StatusCell>) -> Self {
        Self {
            body,
            status,
            handle: Mutex::new(None),
        }
    }

    pub fn body(&self) -> &Arc<B> {
        &self.body
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn status_cell(&self) -> &Arc<StatusCell> {
        &self.status
    }

    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();

        // pause() 可能正在另一个线程等待确认
        let current = self.status.wait_while(|s| s == Status::Pausing);
        match current {
            Status::Paused => {
                self.status.set(Status::Running);
                return Ok(());
            }
            s if s.is_active() => return Ok(()),
            _ => {}
        }

        // Stopping/Stopped/Ended：回收旧线程后重建
        if let Some(old) = handle.take() {
            if old.join().is_err() {
                warn!("{} ⚠ {} 旧线程异常退出", log_ctx(), self.body.name());
            }
        }

        self.status.set(Status::Running);
        let body = self.body.clone();
        let status = self.status.clone();
        let spawned = thread::Builder::new()
            .name(self.body.name())
            .spawn(move || Self::thread_main(body, status))
            .map_err(|e| {
                self.status.set(Status::Stopped);
                PipelineError::IoError(e)
            })?;
        *handle = Some(spawned);
        Ok(())
    }

    fn thread_main(body: Arc<B>, status: Arc<StatusCell>) {
        info!("{} ▶ {} 线程启动", log_ctx(), body.name());
        loop {
            let current = status.get();
            if current.is_active() {
                body.run(&status);
                continue;
            }
            match current {
                Status::Pausing => {
                    status.compare_and_set(Status::Pausing, Status::Paused);
                }
                Status::Paused => {
                    status.wait_while(|s| s == Status::Paused);
                }
                Status::Stopping => {
                    status.compare_and_set(Status::Stopping, Status::Stopped);
                    break;
                }
                _ => break,
            }
        }
        info!("{} 🛑 {} 线程退出 ({})", log_ctx(), body.name(), status.get());
    }

    pub fn pause(&self) {
        let requested = self
            .status
            .transition(|s| s.is_active().then_some(Status::Pausing))
            .is_some();
        if requested {
            self.status.wait_while(|s| s == Status::Pausing);
        }
    }

    pub fn stop(&self) {
        let mut handle = self.handle.lock();
        self.status
            .transition(|s| (s != Status::Stopped || handle.is_some()).then_some(Status::Stopping));
        if let Some(thread) = handle.take() {
            if thread.join().is_err() {
                warn!("{} ⚠ {} 线程异常退出", log_ctx(), self.body.name());
            }
        }
        self.status.set(Status::Stopped);
    }

    /// Ended 由调用方折叠回 Stopped，返回是否发生了折叠
    pub fn take_ended(&self) -> bool {
        let mut handle = self.handle.lock();
        if self.status.get() != Status::Ended {
            return false;
        }
        if let Some(thread) = handle.take() {
            let _ = thread.join();
        }
        self.status.compare_and_set(Status::Ended, Status::Stopped)
    }
}

impl<B: WorkerBody> Drop for Worker<B> {
    fn drop(&mut self) {
        if self.handle.lock().is_some() {
            warn!("{} ⚠ {} 被 drop，但可能未调用 stop()，正在尝试优雅停止", log_ctx(), self.body.name());
            self.stop();
        }
    }
}
