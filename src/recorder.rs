// ===============================
// src/recorder.rs
// ===============================
//
// Append-only JSONL journal of normalized records and UI events.
// - BufWriter, flushed every 1s and every 1000 events
// - parent directory is created on open
// - a failed write reopens the file once, then drops the event
//
// ENV: RECORD_FILE=/path/to/journal.jsonl enables it (see main.rs).
//
use std::io;
use std::path::Path;

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{broadcast, mpsc},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::bus::UiEvent;
use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

async fn open_writer(path: &str) -> io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) -> io::Result<()> {
    let mut writer = open_writer(&path).await?;
    info!(%path, "recorder started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    writer.flush().await?;
                    info!("recorder: channel closed, stopped");
                    return Ok(());
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, reopening");
                    writer = open_writer(&path).await?;
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed after reopen, event dropped");
                        continue;
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
            _ = tick.tick() => {
                if since_last_flush > 0 {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
        }
    }
}

/// Forwards bus traffic into the journal; `Refresh` pulses are not recorded.
pub async fn forward_ui(mut rx: broadcast::Receiver<UiEvent>, tx: mpsc::Sender<Event>) {
    loop {
        match rx.recv().await {
            Ok(UiEvent::Refresh) => {}
            Ok(ev) => {
                if tx.send(Event::Ui(ev)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "recorder lagged behind bus"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizedEvent;

    #[tokio::test]
    async fn writes_one_line_per_event_and_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/journal.jsonl");
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path.to_string_lossy().into_owned()));

        tx.send(Event::Normalized(NormalizedEvent::TradeAccount { account: "Sim1".into() })).await.unwrap();
        tx.send(Event::Note("hello".into())).await.unwrap();
        tx.send(Event::Ui(UiEvent::ConnectionHealthy)).await.unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        for l in lines {
            serde_json::from_str::<serde_json::Value>(l).unwrap();
        }
        assert!(body.contains("Sim1"));
    }

    #[tokio::test]
    async fn unopenable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::channel(1);
        // A directory cannot be opened for append
        let res = run(rx, dir.path().to_string_lossy().into_owned()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn forwarder_skips_refresh_pulses() {
        let (btx, brx) = broadcast::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        let fwd = tokio::spawn(forward_ui(brx, tx));
        btx.send(UiEvent::Refresh).unwrap();
        btx.send(UiEvent::ConnectionHealthy).unwrap();
        drop(btx);
        fwd.await.unwrap();
        assert!(matches!(rx.recv().await, Some(Event::Ui(UiEvent::ConnectionHealthy))));
        assert!(rx.recv().await.is_none());
    }
}
