mod common;

use crossbeam_channel::Receiver;
use std::time::Duration;

use common::{open, open_with, wait_event, wait_until, Drain};
use myy_pipeline::backend::{SyntheticMedia, SyntheticVideo};
use myy_pipeline::core::{Component, MediaKind, PipelineConfig, PipelineEvent, Status, MICROS_PER_SECOND};

const SECOND: i64 = MICROS_PER_SECOND;
const TIMEOUT: Duration = Duration::from_secs(5);

/// 10 分钟的源，不消费时缓冲时长停在上限附近；恢复消费后离开 QueueFull
#[test]
fn test_backpressure_caps_buffered_duration() {
    let mut config = PipelineConfig::default();
    config.demuxer.max_audio_packets = 2_000;
    config.video.frame_queue_size = 4;
    config.demuxer.max_buffered_duration_us = 5 * SECOND;
    let media = SyntheticMedia {
        duration_us: 600 * SECOND,
        ..Default::default()
    };
    let h = open(config, media);
    let demuxer = h.session.demuxer().unwrap().clone();

    assert!(wait_until(TIMEOUT, || demuxer.status() == Status::QueueFull));
    // 一个视频包 40ms
    for _ in 0..10 {
        assert!(demuxer.buffered_duration() <= 5 * SECOND + 40_000);
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(wait_until(TIMEOUT, || h.session.buffer_status().video_frames == 4));

    while h.events.try_recv().is_ok() {}
    let _drain = Drain::spawn(&h.session);
    h.session.play().unwrap();
    let resumed = wait_event(&h.events, TIMEOUT, |e| {
        matches!(
            e,
            PipelineEvent::StatusChanged {
                component: Component::Demuxer,
                status: Status::Running
            }
        )
    });
    assert!(resumed.is_some());
    assert!(demuxer.buffered_duration() <= 5 * SECOND + 40_000);
}

/// 20 帧排队时 1.0 → 2.0，排队时长减半
#[test]
fn test_speed_change_halves_queued_duration() {
    let mut config = PipelineConfig::default();
    config.audio.frame_queue_limit = 20;
    let h = open(config, SyntheticMedia::audio_only(60 * SECOND));
    let queue = h.session.audio_frames().unwrap();

    assert!(wait_until(TIMEOUT, || queue.len() == 20));
    let before = queue.total_duration();
    let timestamps = queue.timestamps();

    assert_eq!(h.session.set_speed(2.0).unwrap(), 2.0);
    let after = queue.total_duration();
    assert_eq!(queue.len(), 20);
    // 每帧长度取整误差不超过半个采样帧
    assert!((after - before / 2).abs() <= 1_000, "before={} after={}", before, after);

    // 第一帧是锚点，时间戳不变
    assert_eq!(queue.timestamps()[0], timestamps[0]);
    assert!(wait_event(&h.events, TIMEOUT, |e| matches!(e, PipelineEvent::SpeedChanged { to, .. } if *to == 2.0)).is_some());
}

/// 队列窗口 [110s, 130s] 内 seek 到 120s 不触碰容器
#[test]
fn test_seek_within_buffered_window() {
    let mut config = PipelineConfig::default();
    config.demuxer.max_video_packets = 1_000;
    config.demuxer.max_buffered_duration_us = 20 * SECOND;
    let media = SyntheticMedia {
        duration_us: 600 * SECOND,
        video: Some(SyntheticVideo {
            fps: 10,
            keyframe_interval: 10,
            ..Default::default()
        }),
        audio: None,
        ..Default::default()
    };
    let h = open(config, media);
    let demuxer = h.session.demuxer().unwrap().clone();

    h.session.seek(110 * SECOND, false).unwrap();
    assert_eq!(h.probe.seeks(), 1);
    assert!(wait_until(TIMEOUT, || demuxer.status() == Status::QueueFull));
    assert!(demuxer.buffered_duration() >= 19 * SECOND);

    while h.events.try_recv().is_ok() {}
    h.session.seek(120 * SECOND, true).unwrap();
    assert_eq!(h.probe.seeks(), 1);
    assert!(wait_event(&h.events, TIMEOUT, |e| {
        matches!(e, PipelineEvent::SeekCompleted { in_queue: true, .. })
    })
    .is_some());

    let frames = h.session.video_frames().unwrap();
    let first = frames.pop_timeout(TIMEOUT).unwrap();
    assert_eq!(first.timestamp, 120 * SECOND);
    assert!(first.keyframe);
    assert_eq!(h.session.position(), 120 * SECOND);
}

fn collect_read_errors(events: &Receiver<PipelineEvent>, seen: &mut Vec<u32>) {
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::ReadError { consecutive, budget } = event {
            assert_eq!(budget, 3);
            seen.push(consecutive);
        }
    }
}

/// 三次读错误后恢复：预算不受影响
#[test]
fn test_read_errors_within_budget() {
    let media = SyntheticMedia {
        duration_us: 3_600 * SECOND,
        ..Default::default()
    };
    let h = open_with(PipelineConfig::default(), media, |probe| probe.fail_next_reads(3));
    let demuxer = h.session.demuxer().unwrap().clone();
    let drain = Drain::spawn(&h.session);

    // 订阅端积压有上限，边等边收集
    let mut seen = Vec::new();
    let collect = |seen: &mut Vec<u32>| collect_read_errors(&h.events, seen);

    assert!(wait_until(TIMEOUT, || {
        collect(&mut seen);
        drain.video.lock().len() >= 5
    }));
    assert!(!demuxer.is_failed());
    assert!(demuxer.status().is_active());

    // 计数已清零：再来三次仍然不会停
    let reads = h.probe.reads();
    h.probe.fail_next_reads(3);
    assert!(wait_until(TIMEOUT, || {
        collect(&mut seen);
        h.probe.reads() >= reads + 20
    }));
    collect(&mut seen);
    assert!(!demuxer.is_failed());
    assert!(demuxer.status().is_active());
    assert_eq!(seen, vec![1, 2, 3, 1, 2, 3]);
}

/// 超出预算：Demuxer 停止，解码器随之停止
#[test]
fn test_read_error_budget_exhausted_cascades() {
    let h = open_with(PipelineConfig::default(), SyntheticMedia::default(), |probe| probe.fail_next_reads(4));
    let demuxer = h.session.demuxer().unwrap().clone();

    assert!(wait_until(TIMEOUT, || demuxer.status() == Status::Stopped));
    assert!(demuxer.is_failed());
    assert!(!demuxer.is_eof());
    assert!(wait_until(TIMEOUT, || {
        h.session.video_decoder().unwrap().status() == Status::Stopped
            && h.session.audio_decoder().unwrap().status() == Status::Stopped
    }));
    assert!(wait_event(&h.events, TIMEOUT, |e| {
        matches!(e, PipelineEvent::ReadError { consecutive: 4, budget: 3 })
    })
    .is_some());
    assert!(!h.session.poll_ended());
}

/// 精确 seek 落在非关键帧上：关键帧之前的画面全部丢弃
#[test]
fn test_keyframe_gate_after_exact_seek() {
    let media = SyntheticMedia {
        seek_exact: true,
        ..Default::default()
    };
    let h = open(PipelineConfig::default(), media);
    let target = 30 * SECOND + 100_000;
    h.session.seek(target, false).unwrap();
    assert_eq!(h.probe.seeks(), 1);

    let frames = h.session.video_frames().unwrap();
    let mut collected = Vec::new();
    while collected.len() < 10 {
        let frame = frames.pop_timeout(TIMEOUT).unwrap();
        collected.push((frame.timestamp, frame.keyframe));
    }

    // 关键帧间隔 50 帧 = 2s，30.08s 之后的第一个关键帧在 32s
    assert_eq!(collected[0], (32 * SECOND, true));
    assert!(collected[0].0 - target <= 2 * SECOND);
    assert!(collected.windows(2).all(|w| w[0].0 <= w[1].0));
    assert!(collected[1..].iter().all(|(_, key)| !key));

    // 音频在视频起点之前结束的帧被门限丢弃
    let audio = h.session.audio_frames().unwrap();
    let first_audio = audio.pop_timeout(TIMEOUT).unwrap();
    assert!(first_audio.timestamp + first_audio.duration >= 32 * SECOND);
}

/// 长 GOP 上精确 seek：视频起点未知期间音频照常取包，Demuxer 能读到下一个关键帧
#[test]
fn test_long_gop_exact_seek_does_not_stall() {
    let media = SyntheticMedia {
        seek_exact: true,
        video: Some(SyntheticVideo {
            keyframe_interval: 250,
            ..Default::default()
        }),
        ..Default::default()
    };
    let h = open(PipelineConfig::default(), media);
    h.session.seek(30 * SECOND + 100_000, false).unwrap();

    // 250 帧 @25fps = 10s，下一个关键帧在 40s，中间约 440 个音频包
    let frames = h.session.video_frames().unwrap();
    let first = frames.pop_timeout(TIMEOUT).unwrap();
    assert_eq!((first.timestamp, first.keyframe), (40 * SECOND, true));

    let audio = h.session.audio_frames().unwrap();
    let first_audio = audio.pop_timeout(TIMEOUT).unwrap();
    assert!(first_audio.timestamp + first_audio.duration >= 40 * SECOND);
}

/// 向后 seek：第一帧音频距离目标不超过一帧
#[test]
fn test_backward_seek_aligns_audio() {
    let h = open(PipelineConfig::default(), SyntheticMedia::audio_only(60 * SECOND));
    let target = 20 * SECOND + 500_000;
    h.session.seek(target, false).unwrap();

    let audio = h.session.audio_frames().unwrap();
    let mut timestamps = Vec::new();
    while timestamps.len() < 8 {
        timestamps.push(audio.pop_timeout(TIMEOUT).unwrap().timestamp);
    }
    // 1024 采样 @ 48kHz ≈ 21.3ms
    assert!(timestamps[0] <= target);
    assert!(target - timestamps[0] < 21_334);
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
}

/// 中途声道数变化：重建输出管线并发布事件
#[test]
fn test_audio_format_change_event() {
    let media = SyntheticMedia {
        channel_switch: Some(myy_pipeline::backend::ChannelSwitch {
            at_us: SECOND,
            channels: 1,
        }),
        ..SyntheticMedia::audio_only(10 * SECOND)
    };
    let h = open(PipelineConfig::default(), media);
    let _drain = Drain::spawn(&h.session);

    let event = wait_event(&h.events, TIMEOUT, |e| matches!(e, PipelineEvent::AudioFormatChanged { .. }));
    match event {
        Some(PipelineEvent::AudioFormatChanged { from, to }) => {
            assert_eq!(from.channels, 2);
            assert_eq!(to.channels, 1);
            assert_eq!(from.sample_rate, to.sample_rate);
        }
        other => panic!("未收到格式变化事件: {:?}", other),
    }
}

/// 播完后折叠为 Stopped，seek 回起点可以继续
#[test]
fn test_end_of_stream_and_restart() {
    let media = SyntheticMedia {
        duration_us: 2 * SECOND,
        subtitle_interval_us: Some(500_000),
        ..Default::default()
    };
    let h = open(PipelineConfig::default(), media);
    assert!(h.info.has_subtitles);
    let subtitles = h.session.subtitle_frames().unwrap();
    let drain = Drain::spawn(&h.session);
    h.session.play().unwrap();

    // 字幕队列也要取空，解码器才能收尾
    assert!(wait_until(TIMEOUT, || {
        while subtitles.try_pop().is_some() {}
        h.session.poll_ended()
    }));
    assert_eq!(h.session.state().state, myy_pipeline::PlaybackState::Stopped);
    assert_eq!(h.session.demuxer().unwrap().status(), Status::Stopped);
    let last_video = drain.video.lock().last().copied().unwrap();
    assert!(last_video.0 >= 2 * SECOND - 40_000);

    drain.video.lock().clear();
    h.session.seek(0, false).unwrap();
    assert!(wait_until(TIMEOUT, || !drain.video.lock().is_empty()));
    assert_eq!(drain.video.lock()[0], (0, true));
}

#[test]
fn test_recording_starts_at_keyframe() {
    let h = open(PipelineConfig::default(), SyntheticMedia::default());
    let sink = myy_pipeline::player::MemorySink::new();
    h.session.start_recording(Box::new(sink.clone()), None).unwrap();
    let _drain = Drain::spawn(&h.session);
    h.session.seek(10 * SECOND, false).unwrap();

    assert!(wait_until(TIMEOUT, || sink.len() >= 20));
    let packets = sink.packets();
    assert_eq!(packets[0].kind, MediaKind::Video);
    assert!(packets[0].keyframe);
    assert!(packets.iter().all(|p| p.kind != MediaKind::Subtitle));

    h.session.stop_recording().unwrap();
    assert!(sink.is_finished());
    assert!(!h.session.demuxer().unwrap().is_recording());
}
