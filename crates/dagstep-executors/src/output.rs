use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use dagstep_core::traits::OutputSink;

/// Stdout/stderr pair owned by one executor.
///
/// Replaced through `&mut self` before the run starts; during the run each
/// sink sits behind an async mutex so the run future can write from `&self`.
pub struct Sinks {
    pub stdout: Mutex<OutputSink>,
    pub stderr: Mutex<OutputSink>,
}

impl Sinks {
    pub fn set(&mut self, stdout: OutputSink, stderr: OutputSink) {
        self.stdout = Mutex::new(stdout);
        self.stderr = Mutex::new(stderr);
    }

    pub async fn write_stdout(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut out = self.stdout.lock().await;
        out.write_all(bytes).await?;
        out.flush().await
    }

    pub async fn write_stderr(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut err = self.stderr.lock().await;
        err.write_all(bytes).await?;
        err.flush().await
    }

    /// Write one line to stdout, appending the newline.
    pub async fn println(&self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write_stdout(&buf).await
    }
}

impl Default for Sinks {
    /// Both streams discard until replaced.
    fn default() -> Self {
        Self {
            stdout: Mutex::new(Box::new(tokio::io::sink())),
            stderr: Mutex::new(Box::new(tokio::io::sink())),
        }
    }
}
