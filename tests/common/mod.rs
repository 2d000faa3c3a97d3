#![allow(dead_code)]

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use myy_pipeline::backend::{SyntheticEngine, SyntheticMedia, SyntheticProbe};
use myy_pipeline::core::{MediaInfo, MediaSource, PipelineConfig, PipelineEvent};
use myy_pipeline::player::PlaybackSession;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn source() -> MediaSource {
    MediaSource::from_url("synthetic://test")
}

pub struct Harness {
    pub session: PlaybackSession,
    pub probe: Arc<SyntheticProbe>,
    pub events: Receiver<PipelineEvent>,
    pub info: MediaInfo,
}

/// 打开合成源；`prepare` 在打开前调用（用于注入故障）
pub fn open_with(config: PipelineConfig, media: SyntheticMedia, prepare: impl FnOnce(&SyntheticProbe)) -> Harness {
    init_logger();
    let engine = SyntheticEngine::new(media);
    let probe = engine.probe();
    prepare(probe.as_ref());
    let mut session = PlaybackSession::new(config).unwrap();
    let events = session.subscribe();
    let info = session.open(&engine, &source()).unwrap();
    Harness {
        session,
        probe,
        events,
        info,
    }
}

pub fn open(config: PipelineConfig, media: SyntheticMedia) -> Harness {
    open_with(config, media, |_| {})
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// 在超时内等待满足条件的事件
pub fn wait_event(
    events: &Receiver<PipelineEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&PipelineEvent) -> bool,
) -> Option<PipelineEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

/// 后台消费者：不看时钟，尽快取走视频与音频帧
pub struct Drain {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    pub video: Arc<Mutex<Vec<(i64, bool)>>>,
    pub audio: Arc<Mutex<Vec<i64>>>,
}

impl Drain {
    pub fn spawn(session: &PlaybackSession) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let video = Arc::new(Mutex::new(Vec::new()));
        let audio = Arc::new(Mutex::new(Vec::new()));
        let video_queue = session.video_frames();
        let audio_queue = session.audio_frames();

        let handle = {
            let (stop, video, audio) = (stop.clone(), video.clone(), audio.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let mut idle = true;
                    if let Some(queue) = &video_queue {
                        while let Some(frame) = queue.try_pop() {
                            video.lock().push((frame.timestamp, frame.keyframe));
                            idle = false;
                        }
                    }
                    if let Some(queue) = &audio_queue {
                        while let Some(frame) = queue.pop() {
                            audio.lock().push(frame.timestamp);
                            idle = false;
                        }
                    }
                    if idle {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };
        Self {
            stop,
            handle: Some(handle),
            video,
            audio,
        }
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
