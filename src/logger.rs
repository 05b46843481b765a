//! Asynchronous logger behind the `log` facade.
//!
//! Producers format the record and block on a bounded channel; one flusher
//! thread drains the channel into a dated file (`<dir>/<YYYY_MM_DD><suffix>`),
//! reopening it when the day rolls over. `flush` round-trips a marker through
//! the channel, so on return every earlier record is on disk.

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{LevelFilter, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

enum Msg {
    Line(String),
    Flush(Sender<()>),
}

pub struct AsyncLog {
    level: LevelFilter,
    tx: Sender<Msg>,
}

impl AsyncLog {
    /// Installs the logger process-wide. Errors if a logger is already set.
    pub fn init(
        level: LevelFilter,
        dir: &Path,
        suffix: &str,
        queue_capacity: usize,
    ) -> Result<(), log::SetLoggerError> {
        let _ = fs::create_dir_all(dir);
        let (tx, rx) = bounded(queue_capacity.max(1));

        let dir = dir.to_path_buf();
        let suffix = suffix.to_string();
        std::thread::Builder::new()
            .name("log-flusher".into())
            .spawn(move || flush_loop(rx, dir, suffix))
            .expect("spawning the log flusher");

        log::set_boxed_logger(Box::new(AsyncLog { level, tx }))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for AsyncLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (date, time) = now_parts();
        let tag = match record.level() {
            log::Level::Error => "[error]",
            log::Level::Warn => "[warn] ",
            log::Level::Info => "[info] ",
            _ => "[debug]",
        };
        let line = format!("{date} {time} {tag} {}\n", record.args());
        // Blocking send: backpressure instead of dropped records.
        let _ = self.tx.send(Msg::Line(line));
    }

    fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Msg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

fn flush_loop(rx: Receiver<Msg>, dir: PathBuf, suffix: String) {
    let mut day = String::new();
    let mut file: Option<File> = None;

    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Line(line) => {
                let (date, _) = now_parts();
                if date != day || file.is_none() {
                    day = date;
                    file = open_for_day(&dir, &day, &suffix);
                }
                match file.as_mut() {
                    Some(f) => {
                        let _ = f.write_all(line.as_bytes());
                    }
                    None => {
                        let _ = std::io::stderr().write_all(line.as_bytes());
                    }
                }
            }
            Msg::Flush(ack) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush();
                }
                let _ = ack.send(());
            }
        }
    }
}

fn open_for_day(dir: &Path, day: &str, suffix: &str) -> Option<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{day}{suffix}")))
        .ok()
}

/// (`YYYY_MM_DD`, `HH:MM:SS`) in local time.
fn now_parts() -> (String, String) {
    // SAFETY: localtime_r writes the out-struct and reads the time value;
    // both are stack-local.
    let tm = unsafe {
        let mut now: libc::time_t = 0;
        libc::time(&mut now);
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&now, &mut tm);
        tm
    };
    (
        format!(
            "{:04}_{:02}_{:02}",
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday
        ),
        format!("{:02}:{:02}:{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_parts_are_plausible() {
        let (date, time) = now_parts();
        assert_eq!(date.len(), 10);
        assert_eq!(&date[4..5], "_");
        assert_eq!(time.len(), 8);
    }

    #[test]
    fn flush_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = bounded(8);
        let handle = {
            let dir = dir.path().to_path_buf();
            std::thread::spawn(move || flush_loop(rx, dir, ".log".into()))
        };

        tx.send(Msg::Line("hello log\n".into())).unwrap();
        let (ack_tx, ack_rx) = bounded(1);
        tx.send(Msg::Flush(ack_tx)).unwrap();
        ack_rx.recv().unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content, "hello log\n");

        drop(tx);
        handle.join().unwrap();
    }
}
