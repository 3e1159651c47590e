use crate::error::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Journal of sync events, separate from `tracing` diagnostics
pub trait Logger: Send + Sync {
    fn pushed(&self, _lynk: &str, _files: usize) {}
    fn broadcast(&self, _lynk: &str, _delivered: usize, _peers: usize) {}
    fn fetched(&self, _lynk: &str, _file: &str, _bytes: u64, _from: &str) {}
    fn pruned(&self, _lynk: &str, _path: &Path) {}
    fn error(&self, _context: &str, _lynk: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn pushed(&self, lynk: &str, files: usize) {
        self.line(&format!("PUSH lynk={lynk} files={files}"));
    }
    fn broadcast(&self, lynk: &str, delivered: usize, peers: usize) {
        self.line(&format!("BROADCAST lynk={lynk} delivered={delivered}/{peers}"));
    }
    fn fetched(&self, lynk: &str, file: &str, bytes: u64, from: &str) {
        self.line(&format!("FETCH lynk={lynk} file={file} bytes={bytes} from={from}"));
    }
    fn pruned(&self, lynk: &str, path: &Path) {
        self.line(&format!("PRUNE lynk={lynk} path={}", path.display()));
    }
    fn error(&self, context: &str, lynk: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} lynk={lynk} msg={msg}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("sync.log");
        let log = TextLogger::new(&path).unwrap();
        log.pushed("Docs", 2);
        log.fetched("Docs", "a.txt", 100, "127.0.0.1:8080");
        drop(log);

        let log = TextLogger::new(&path).unwrap();
        log.error("fetch", "Docs", "no peer");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("PUSH lynk=Docs files=2"));
        assert!(lines[1].contains("FETCH lynk=Docs file=a.txt bytes=100"));
        assert!(lines[2].ends_with("ERROR ctx=fetch lynk=Docs msg=no peer"));
    }
}
