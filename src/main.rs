use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use myy_pipeline::backend::{SyntheticEngine, SyntheticMedia};
use myy_pipeline::core::{MediaSource, PipelineConfig, PipelineEvent};
use myy_pipeline::player::engine::MediaEngine;
use myy_pipeline::player::PlaybackSession;

/// 消费帧的节拍
const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Args {
    /// 媒体路径或 URL（需要 ffmpeg 特性）；为空时使用合成源
    source: Option<String>,
    config: Option<PathBuf>,
    /// 合成源参数（JSON）
    synthetic: Option<PathBuf>,
    seconds: u64,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        seconds: 10,
        ..Default::default()
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = Some(iter.next().context("--config 需要文件路径")?.into()),
            "--synthetic" => args.synthetic = Some(iter.next().context("--synthetic 需要文件路径")?.into()),
            "--seconds" => {
                args.seconds = iter
                    .next()
                    .context("--seconds 需要数字")?
                    .parse()
                    .context("--seconds 不是有效数字")?
            }
            "-h" | "--help" => {
                println!("用法: myy_pipeline [--config cfg.json] [--synthetic media.json] [--seconds N] [源]");
                std::process::exit(0);
            }
            other if other.starts_with("--") => return Err(anyhow!("未知参数: {}", other)),
            other => args.source = Some(other.to_string()),
        }
    }
    Ok(args)
}

fn build_engine(args: &Args) -> Result<(Box<dyn MediaEngine>, MediaSource)> {
    if let Some(source) = &args.source {
        #[cfg(feature = "ffmpeg")]
        {
            let engine = myy_pipeline::backend::FfmpegEngine::new()?;
            return Ok((Box::new(engine), MediaSource::from_url(source)));
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            return Err(anyhow!("打开 {} 需要启用 ffmpeg 特性", source));
        }
    }

    let media = match &args.synthetic {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("读取 {:?} 失败", path))?;
            serde_json::from_str(&json).context("合成源参数解析失败")?
        }
        None => SyntheticMedia {
            subtitle_interval_us: Some(2_000_000),
            ..Default::default()
        },
    };
    Ok((Box::new(SyntheticEngine::new(media)), MediaSource::from_url("synthetic://demo")))
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = parse_args()?;
    info!("🎬 MYY Pipeline 启动");

    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let (engine, source) = build_engine(&args)?;

    let mut session = PlaybackSession::new(config)?;
    let events = session.subscribe();
    let media_info = session.open(engine.as_ref(), &source)?;
    info!("📋 媒体信息: {}", serde_json::to_string(&media_info)?);

    session.play()?;

    let run_for = Duration::from_secs(args.seconds);
    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut seeked = false;
    let mut sped_up = false;
    let mut subtitle_shown: Option<i64> = None;
    let (mut video_frames, mut audio_frames) = (0u64, 0u64);

    while started.elapsed() < run_for {
        let now = session.position();
        if session.video_frame_for_time(now).is_some() {
            video_frames += 1;
        }
        while session.audio_frame_for_time(now).is_some() {
            audio_frames += 1;
        }
        match session.current_subtitle(now) {
            Some(cue) if subtitle_shown != Some(cue.timestamp) => {
                info!("💬 [{}us] {}", cue.timestamp, cue.text);
                subtitle_shown = Some(cue.timestamp);
            }
            _ => {}
        }

        for event in events.try_iter() {
            match event {
                PipelineEvent::StatusChanged { .. } => debug!("事件: {:?}", event),
                other => info!("📣 事件: {:?}", other),
            }
        }

        if !seeked && started.elapsed() >= run_for / 3 && !media_info.is_live {
            let target = now + 10_000_000;
            if let Err(e) = session.seek(target, true) {
                warn!("⚠ Seek 失败: {}", e);
            }
            seeked = true;
        }
        if !sped_up && started.elapsed() >= run_for * 2 / 3 {
            let speed = session.set_speed(2.0)?;
            info!("⏩ 倍速 {:.2}x", speed);
            sped_up = true;
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let status = session.buffer_status();
            info!(
                "📊 位置 {:.2}s | 包 v{}/a{}/s{} | 帧 v{}/a{} | 缓冲 {:.2}s ({:.0}%) {}",
                now as f64 / 1_000_000.0,
                status.video_packets,
                status.audio_packets,
                status.subtitle_packets,
                status.video_frames,
                status.audio_frames,
                status.buffered_duration as f64 / 1_000_000.0,
                status.buffer_progress * 100.0,
                if status.is_buffering { "缓冲中" } else { "" }
            );
            last_report = Instant::now();
        }

        if session.poll_ended() {
            info!("🏁 播放完毕");
            break;
        }
        thread::sleep(TICK);
    }

    info!("📈 共呈现 {} 个视频帧，{} 个音频帧", video_frames, audio_frames);
    session.stop();
    Ok(())
}
