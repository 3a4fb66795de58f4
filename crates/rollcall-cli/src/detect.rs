//! `rollcall detect`: drive the live loop from the terminal.

use crate::config::Config;
use crate::webcam::Webcam;
use anyhow::{Context, Result};
use rollcall_core::{
    spawn_detection, AttendanceLog, DetectionEvent, DetectionLoop, GalleryStore, OnnxEncoder,
    StopFlag, StopReason,
};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub async fn run(config: &Config, preview: Option<PathBuf>) -> Result<()> {
    let encoder = OnnxEncoder::load(&config.model_dir).context("loading face models")?;
    let gallery = GalleryStore::open(&config.gallery_dir)?;
    let log = AttendanceLog::open(&config.log_path)?;

    let device = config.camera_device.clone();
    let (width, height) = (config.capture_width, config.capture_height);
    let (handle, mut events) = spawn_detection(
        DetectionLoop::new(encoder, gallery, log),
        move || Webcam::open(&device, width, height),
        config.event_capacity,
    )?;

    println!("Live attendance running on {}. Type q and Enter, or press Ctrl-C, to stop.", config.camera_device);

    pump(
        &mut events,
        &handle.stop_flag(),
        BufReader::new(tokio::io::stdin()),
        tokio::signal::ctrl_c(),
        preview.as_deref(),
        &mut std::io::stdout(),
    )
    .await?;

    let report = tokio::task::spawn_blocking(move || handle.join())
        .await
        .context("joining detection thread")??;

    match report.stop {
        StopReason::Requested => println!(
            "Stopped after {} frame(s); {} new attendance record(s).",
            report.frames,
            report.marked.len()
        ),
        StopReason::Disconnected => println!("Detection ended."),
    }
    if report.gallery_size == 0 {
        println!("Note: no faces are registered; use `rollcall register` first.");
    }
    Ok(())
}

/// Relay detection events to `out` until the loop closes its channel.
/// `interrupt` resolving, or a `q` line on `input`, requests a stop; the
/// events already queued are still drained.
async fn pump<R, I, W>(
    events: &mut mpsc::Receiver<DetectionEvent>,
    stop: &StopFlag,
    input: R,
    interrupt: I,
    preview: Option<&Path>,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    I: Future,
    W: Write,
{
    tokio::pin!(interrupt);
    let mut interrupted = false;
    let mut lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            biased;

            _ = &mut interrupt, if !interrupted => {
                tracing::info!("interrupt received, stopping");
                interrupted = true;
                stop.request();
            }
            line = lines.next_line(), if input_open => match line {
                Ok(Some(l)) if l.trim().eq_ignore_ascii_case("q") => stop.request(),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => input_open = false,
            },
            event = events.recv() => match event {
                Some(DetectionEvent::Marked { identity, at }) => {
                    writeln!(out, "{}  marked {identity}", at.format("%H:%M:%S"))?;
                }
                Some(DetectionEvent::Frame { sequence, annotated, faces }) => {
                    tracing::debug!(sequence, faces = faces.len(), "frame processed");
                    if let Some(path) = preview {
                        if let Err(e) = annotated.save(path) {
                            tracing::warn!(path = %path.display(), error = %e, "failed to write preview");
                        }
                    }
                }
                None => break,
            },
        }
    }
    Ok(())
}
