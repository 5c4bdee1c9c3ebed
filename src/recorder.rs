// ===============================
// src/recorder.rs
// ===============================
//
// Optional JSONL event log (`--record-file`):
// - producers hold an `EventSink` and never block; a full queue drops the event
// - one line per Event, buffered, flushed every second, every 500 events
//   and on close
// - a failed write reopens the file once before giving up on that event
//
use std::path::Path;

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 500;

/// Cheap cloneable handle; a disabled sink swallows everything.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<Event>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self { Self { tx: Some(tx) } }

    pub fn disabled() -> Self { Self { tx: None } }

    pub fn record(&self, ev: Event) {
        if let Some(tx) = &self.tx {
            if tx.try_send(ev).is_err() {
                debug!("recorder queue full or closed, event dropped");
            }
        }
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(w: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
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
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e) => {
                            error!(?e, "recorder: reopen failed, stopped");
                            break;
                        }
                    }
                    if let Err(e) = write_line(&mut writer, &line).await {
                        error!(?e, "recorder: write failed after reopen, event dropped");
                        continue;
                    }
                }
                pending += 1;
                if pending >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    pending = 0;
                }
            }
            _ = tick.tick() => {
                if pending > 0 {
                    let _ = writer.flush().await;
                    pending = 0;
                }
            }
        }
    }
}
