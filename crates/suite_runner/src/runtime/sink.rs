//! Per-process log files
//!
//! Layout, one directory per `(suite type, suite name, service)`:
//!
//! ```text
//! <logs>/<type>/<suite>/<service>/out.log
//! <logs>/<type>/<suite>/<service>/err.log
//! <logs>/<type>/<suite>/<service>/combined-outerr.log
//! <logs>/<type>/<suite>/<service>/exit-code.log
//! ```

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const OUT_LOG: &str = "out.log";
pub const ERR_LOG: &str = "err.log";
pub const COMBINED_LOG: &str = "combined-outerr.log";
pub const EXIT_CODE_LOG: &str = "exit-code.log";

/// Which stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Location of the log files of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSink {
    dir: PathBuf,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Sink for `service` of suite `suite_type/suite_name`
    pub fn for_service(logs_root: &Path, suite_type: &str, suite_name: &str, service: &str) -> Self {
        Self::new(logs_root.join(suite_type).join(suite_name).join(service))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn out_path(&self) -> PathBuf {
        self.dir.join(OUT_LOG)
    }

    pub fn err_path(&self) -> PathBuf {
        self.dir.join(ERR_LOG)
    }

    pub fn combined_path(&self) -> PathBuf {
        self.dir.join(COMBINED_LOG)
    }

    pub fn exit_code_path(&self) -> PathBuf {
        self.dir.join(EXIT_CODE_LOG)
    }

    /// Create the directory and truncate every file left by a previous run
    pub(crate) async fn open(&self) -> io::Result<SinkFiles> {
        tokio::fs::create_dir_all(&self.dir).await?;

        match tokio::fs::remove_file(self.exit_code_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(SinkFiles {
            out: create_truncated(&self.out_path()).await?,
            err: create_truncated(&self.err_path()).await?,
            combined: create_truncated(&self.combined_path()).await?,
        })
    }

    /// Record the exit code of the process (`null` when it had none)
    pub async fn write_exit_code(&self, code: Option<i32>) -> io::Result<()> {
        tokio::fs::write(self.exit_code_path(), crate::error::display_code(&code)).await
    }
}

async fn create_truncated(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
}

/// Open files of a sink. Owned by exactly one writer task.
pub(crate) struct SinkFiles {
    out: File,
    err: File,
    combined: File,
}

impl SinkFiles {
    /// Append one line to its stream log and to the combined log
    pub(crate) async fn append(&mut self, stream: Stream, text: &str) -> io::Result<()> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        match stream {
            Stream::Stdout => self.out.write_all(line.as_bytes()).await?,
            Stream::Stderr => self.err.write_all(line.as_bytes()).await?,
        }
        self.combined.write_all(line.as_bytes()).await
    }

    /// Flush and release the files
    pub(crate) async fn close(mut self) -> io::Result<()> {
        self.out.flush().await?;
        self.err.flush().await?;
        self.combined.flush().await?;
        self.out.sync_all().await?;
        self.err.sync_all().await?;
        self.combined.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let sink = LogSink::for_service(Path::new("/logs"), "integration", "api", "db");
        assert_eq!(sink.dir(), Path::new("/logs/integration/api/db"));
        assert_eq!(sink.out_path(), PathBuf::from("/logs/integration/api/db/out.log"));
        assert_eq!(sink.err_path(), PathBuf::from("/logs/integration/api/db/err.log"));
        assert_eq!(
            sink.combined_path(),
            PathBuf::from("/logs/integration/api/db/combined-outerr.log")
        );
        assert_eq!(
            sink.exit_code_path(),
            PathBuf::from("/logs/integration/api/db/exit-code.log")
        );
    }

    #[tokio::test]
    async fn test_open_truncates_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("svc"));

        let mut files = sink.open().await.unwrap();
        files.append(Stream::Stdout, "old").await.unwrap();
        files.close().await.unwrap();
        sink.write_exit_code(Some(3)).await.unwrap();

        let mut files = sink.open().await.unwrap();
        files.append(Stream::Stderr, "new").await.unwrap();
        files.close().await.unwrap();

        assert_eq!(std::fs::read_to_string(sink.out_path()).unwrap(), "");
        assert_eq!(std::fs::read_to_string(sink.err_path()).unwrap(), "new\n");
        assert_eq!(std::fs::read_to_string(sink.combined_path()).unwrap(), "new\n");
        assert!(!sink.exit_code_path().exists());
    }
}
