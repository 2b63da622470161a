use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Default rotation threshold (~5 MB).
const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;
/// How many rotated files (`.1` .. `.N`) are kept.
const DEFAULT_MAX_FILES: u32 = 5;

/// Byte-rotated log sink for one mind's stdout/stderr.
///
/// When a write would push the current file past `max_size`, the file is
/// closed, `mind.log` becomes `mind.log.1`, existing `.N` files shift up,
/// and anything beyond `max_files` is deleted. The size counter is restored
/// by statting the file on open, so rotation state survives daemon restarts.
pub struct RotatingLog {
    path: PathBuf,
    max_size: u64,
    max_files: u32,
    file: File,
    size: u64,
}

impl RotatingLog {
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        Self::with_limits(path, DEFAULT_MAX_SIZE, DEFAULT_MAX_FILES)
    }

    pub fn with_limits(path: PathBuf, max_size: u64, max_files: u32) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            size,
        })
    }

    /// Append one line of child output, rotating first if it would not fit.
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let needed = line.len() as u64 + 1;
        if self.size > 0 && self.size + needed > self.max_size {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.size += needed;
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;

        // Shift .N -> .N+1 from the top down, dropping the oldest.
        let oldest = self.rotated_path(self.max_files);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_files).rev() {
            let from = self.rotated_path(n);
            if from.exists() {
                std::fs::rename(&from, self.rotated_path(n + 1))?;
            }
        }
        std::fs::rename(&self.path, self.rotated_path(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.size = 0;
        Ok(())
    }

    fn rotated_path(&self, n: u32) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push(format!(".{}", n));
        PathBuf::from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_counts_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mind.log");
        let mut log = RotatingLog::with_limits(path.clone(), 1024, 3).unwrap();
        log.write_line("hello").unwrap();
        log.write_line("world").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\nworld\n");
    }

    #[test]
    fn rotates_when_full_and_caps_file_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mind.log");
        let mut log = RotatingLog::with_limits(path.clone(), 16, 2).unwrap();

        // Each line is 11 bytes; every second line forces a rotation.
        for n in 0..7 {
            log.write_line(&format!("line-{:05}", n)).unwrap();
        }

        assert!(path.exists());
        assert!(dir.path().join("mind.log.1").exists());
        assert!(dir.path().join("mind.log.2").exists());
        assert!(!dir.path().join("mind.log.3").exists());

        // Newest rotated file holds the most recent evicted lines.
        let rotated = std::fs::read_to_string(dir.path().join("mind.log.1")).unwrap();
        assert!(rotated.contains("line-00005"));
    }

    #[test]
    fn size_restored_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mind.log");
        {
            let mut log = RotatingLog::with_limits(path.clone(), 16, 2).unwrap();
            log.write_line("0123456789").unwrap();
        }
        // 11 bytes on disk; the next write must rotate rather than overshoot.
        let mut log = RotatingLog::with_limits(path.clone(), 16, 2).unwrap();
        log.write_line("0123456789").unwrap();
        assert!(dir.path().join("mind.log.1").exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0123456789\n");
    }
}
