//! セッションログ
//!
//! `<logs>/YYYY-MM-DD.log` に追記する。日付が変わると新しいファイルに切り替える。
//! `tracing_subscriber` の writer としても使える。

use chrono::{Local, NaiveDate};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone)]
pub struct SessionLog {
    dir: PathBuf,
    current: Arc<Mutex<Option<(NaiveDate, File)>>>,
}

impl SessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            current: Arc::new(Mutex::new(None)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.log", date.format("%Y-%m-%d")))
    }

    /// 今日のログファイル
    pub fn current_path(&self) -> PathBuf {
        self.path_for(Local::now().date_naive())
    }

    /// UI などからの1行を追記する
    pub fn append(&self, level: &str, source: &str, message: &str) -> io::Result<()> {
        let line = format!(
            "{} [{}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level.to_uppercase(),
            source,
            message.trim_end()
        );
        self.write_all_today(line.as_bytes())
    }

    fn write_all_today(&self, buf: &[u8]) -> io::Result<()> {
        let today = Local::now().date_naive();
        let mut guard = self
            .current
            .lock()
            .map_err(|_| io::Error::other("session log lock poisoned"))?;

        let needs_open = !matches!(guard.as_ref(), Some((date, _)) if *date == today);
        if needs_open {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(today))?;
            *guard = Some((today, file));
        }

        match guard.as_mut() {
            Some((_, file)) => file.write_all(buf),
            None => Ok(()),
        }
    }
}

/// `tracing_subscriber` 用の writer
pub struct SessionLogWriter {
    log: SessionLog,
}

impl Write for SessionLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.write_all_today(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SessionLog {
    type Writer = SessionLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SessionLogWriter { log: self.clone() }
    }
}
