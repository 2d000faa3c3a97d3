mod common;

use std::time::Duration;

use common::{open, wait_until};
use myy_pipeline::backend::SyntheticMedia;
use myy_pipeline::core::{PipelineConfig, PipelineEvent, PlaybackState, EVENT_CHANNEL_CAPACITY, MICROS_PER_SECOND};

const SECOND: i64 = MICROS_PER_SECOND;
const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_open_reports_media_info() {
    let media = SyntheticMedia {
        subtitle_interval_us: Some(SECOND),
        ..Default::default()
    };
    let h = open(PipelineConfig::default(), media);
    let info = &h.info;
    assert_eq!((info.width, info.height), (64, 36));
    assert!((info.fps - 25.0).abs() < f64::EPSILON);
    assert_eq!(info.sample_rate, 48_000);
    assert_eq!(info.channels, 2);
    assert_eq!(info.duration, 60 * SECOND);
    assert!(info.has_subtitles);
    assert!(!info.is_live);
    assert_eq!(info.video_codec, "synthetic-video");

    let state = h.session.state();
    assert_eq!(state.state, PlaybackState::Paused);
    assert_eq!(state.position, 0);
    assert_eq!(state.duration, 60 * SECOND);
}

#[test]
fn test_play_pause_moves_clock() {
    let h = open(PipelineConfig::default(), SyntheticMedia::default());
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(h.session.position(), 0);

    h.session.play().unwrap();
    assert_eq!(h.session.state().state, PlaybackState::Playing);
    assert!(wait_until(TIMEOUT, || h.session.position() > 20_000));

    h.session.pause().unwrap();
    let paused_at = h.session.position();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(h.session.position(), paused_at);
    assert_eq!(h.session.state().state, PlaybackState::Paused);
}

#[test]
fn test_speed_is_clamped() {
    let h = open(PipelineConfig::default(), SyntheticMedia::default());
    assert_eq!(h.session.set_speed(10.0).unwrap(), 4.0);
    assert_eq!(h.session.speed(), 4.0);
    assert_eq!(h.session.audio_decoder().unwrap().speed(), 4.0);
    assert_eq!(h.session.set_speed(0.01).unwrap(), 0.25);
    assert_eq!(h.session.state().speed, 0.25);
}

#[test]
fn test_seek_keeps_paused_state() {
    let h = open(PipelineConfig::default(), SyntheticMedia::default());
    h.session.seek(12 * SECOND, false).unwrap();
    let state = h.session.state();
    assert_eq!(state.state, PlaybackState::Paused);
    assert_eq!(state.position, 12 * SECOND);

    // 超出时长的目标被截断
    h.session.seek(120 * SECOND, false).unwrap();
    assert_eq!(h.session.position(), 60 * SECOND);
}

#[test]
fn test_video_frame_for_time_skips_late_frames() {
    let h = open(PipelineConfig::default(), SyntheticMedia::default());
    let queue = h.session.video_frames().unwrap();
    assert!(wait_until(TIMEOUT, || queue.len() == 4));

    assert!(h.session.video_frame_for_time(-1).is_none());
    // 0/40/80ms 已到期，返回最新的 80ms
    let frame = h.session.video_frame_for_time(90_000).unwrap();
    assert_eq!(frame.timestamp, 80_000);
    assert!(queue.front().is_some_and(|f| f.timestamp > 90_000));
}

#[test]
fn test_current_subtitle_follows_time() {
    let media = SyntheticMedia {
        subtitle_interval_us: Some(SECOND),
        ..Default::default()
    };
    let h = open(PipelineConfig::default(), media);
    let cues = h.session.subtitle_frames().unwrap();
    assert!(wait_until(TIMEOUT, || cues.len() >= 2));

    // 每秒一条，显示半秒
    let cue = h.session.current_subtitle(100_000).unwrap();
    assert_eq!(cue.timestamp, 0);
    assert_eq!(cue.text, "字幕 #0");
    assert!(h.session.current_subtitle(700_000).is_none());
    let cue = h.session.current_subtitle(1_200_000).unwrap();
    assert_eq!(cue.text, "字幕 #1");
}

#[test]
fn test_buffer_status_reports_queues() {
    let h = open(PipelineConfig::default(), SyntheticMedia::default());
    assert!(wait_until(TIMEOUT, || h.session.buffer_status().video_frames == 4));
    let status = h.session.buffer_status();
    assert!(status.video_packets > 0);
    assert!(status.audio_packets > 0);
    assert!(status.buffered_duration > 0);
    assert!(status.buffer_progress > 0.0 && status.buffer_progress <= 1.0);
    assert!(status.demuxer_status.is_some());
}

#[test]
fn test_stop_releases_pipeline() {
    let mut h = open(PipelineConfig::default(), SyntheticMedia::default());
    h.session.play().unwrap();
    h.session.stop();
    assert!(h.session.demuxer().is_none());
    assert_eq!(h.session.state().state, PlaybackState::Stopped);
    // 重复 stop 是空操作
    h.session.stop();
    assert_eq!(h.session.buffer_status().video_packets, 0);
}

#[test]
fn test_idle_subscriber_backlog_is_bounded() {
    let h = open(PipelineConfig::default(), SyntheticMedia::default());
    let idle = h.session.subscribe();
    let drain = common::Drain::spawn(&h.session);
    h.session.play().unwrap();

    // 持续消费时状态在 QueueFull/Running 之间频繁切换
    assert!(wait_until(TIMEOUT, || drain.video.lock().len() >= 200));
    assert!(idle.len() <= EVENT_CHANNEL_CAPACITY);
    assert!(h.events.len() <= EVENT_CHANNEL_CAPACITY);

    // 取走积压后仍能收到新事件
    while idle.try_recv().is_ok() {}
    h.session.set_speed(2.0).unwrap();
    assert!(common::wait_event(&idle, TIMEOUT, |e| matches!(e, PipelineEvent::SpeedChanged { .. })).is_some());
}
