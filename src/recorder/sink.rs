use log::{debug, error, info};

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

// Upper bound on numeric suffixes tried before giving up on a free name
const MAX_SUFFIX: u32 = 1000;

/**
 * Append-only destination file for one capture session. The file is always
 * freshly created, so bytes from an earlier run are never truncated and the
 * handle is never reopened mid-session.
 */
pub struct ChunkedSink {
    file: Option<File>,
    path: PathBuf,
    bytes_written: u64,
}

impl ChunkedSink {
    /**
     * Creates the output file. If `path` already exists a numeric suffix is
     * added to the file stem until an unused name is found.
     */
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut candidate = path.to_path_buf();
        let mut suffix = 0;

        loop {
            match OpenOptions::new()
                .append(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(file) => {
                    if suffix > 0 {
                        info!(
                            "{} already exists, recording to {} instead",
                            path.display(),
                            candidate.display()
                        );
                    }
                    return Ok(ChunkedSink {
                        file: Some(file),
                        path: candidate,
                        bytes_written: 0,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && suffix < MAX_SUFFIX => {
                    suffix += 1;
                    candidate = suffixed(path, suffix);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "sink is closed"))?;
        file.write_all(chunk)?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /**
     * Flushes and syncs the file. Only the first call does any work; later
     * calls return `Ok(())`.
     */
    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => {
                file.flush()?;
                file.sync_all()?;
                debug!(
                    "Closed {} after {} bytes",
                    self.path.display(),
                    self.bytes_written
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for ChunkedSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing {}: {}", self.path.display(), e);
        }
    }
}

fn suffixed(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}_{}", stem, n),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn appends_chunks_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("show.mp3");

        let mut sink = ChunkedSink::open(&path).unwrap();
        sink.append(b"hello ").unwrap();
        sink.append(b"world").unwrap();
        assert_eq!(sink.bytes_written(), 11);
        sink.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn close_twice_is_harmless() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("show.mp3");

        let mut sink = ChunkedSink::open(&path).unwrap();
        sink.append(b"abc").unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        drop(sink);

        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn append_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let mut sink = ChunkedSink::open(&dir.path().join("show.mp3")).unwrap();
        sink.close().unwrap();
        assert!(sink.append(b"late").is_err());
        assert_eq!(sink.bytes_written(), 0);
    }

    #[test]
    fn existing_file_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bass_station_2024-01-01.mp3");
        fs::write(&path, b"yesterday").unwrap();
        fs::write(dir.path().join("bass_station_2024-01-01_1.mp3"), b"rerun").unwrap();

        let mut sink = ChunkedSink::open(&path).unwrap();
        assert_eq!(sink.path(), dir.path().join("bass_station_2024-01-01_2.mp3"));
        sink.append(b"today").unwrap();
        sink.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"yesterday");
        assert_eq!(fs::read(sink.path()).unwrap(), b"today");
    }

    #[test]
    fn missing_parent_directory_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope").join("show.mp3");
        let err = ChunkedSink::open(&path).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!path.exists());
    }

    #[test]
    fn suffix_without_extension() {
        assert_eq!(suffixed(Path::new("/tmp/rec"), 3), PathBuf::from("/tmp/rec_3"));
    }
}
