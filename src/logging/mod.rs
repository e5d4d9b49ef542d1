use std::io::{self, Write};

use async_trait::async_trait;
use env_logger::Builder;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, metadata, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

/// `io::Write` end of the log channel; never blocks the caller.
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender
            .send(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// File log sink, run as a Pingora service.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    /// Routes the global logger into this sink. Level comes from `RUST_LOG`,
    /// `info` when unset.
    pub fn init_env_logger(&self) {
        let writer = self.create_async_writer();
        Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .init();
    }

    async fn open_log_file(&self) -> io::Result<File> {
        let log_file_path = &self.config.path;
        if let Some(parent) = std::path::Path::new(log_file_path).parent() {
            if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
                create_dir_all(parent).await?;
            }
        }

        OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file_path)
            .await
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match self.open_log_file().await {
            Ok(file) => BufWriter::new(file),
            Err(e) => {
                // the global logger points at this sink, so stderr is all that is left
                eprintln!("Unable to open log file {}: {e}", self.config.path);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                eprintln!("Failed to write to log file: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // drain what was logged before shutdown
        while let Ok(data) = self.receiver.try_recv() {
            if file.write_all(&data).await.is_err() {
                break;
            }
        }
        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_feeds_channel() {
        let mut logger = Logger::new(config::Log {
            path: "/tmp/pinggate-test.log".to_string(),
        });
        let mut writer = logger.create_async_writer();

        writer.write_all(b"first line\n").unwrap();
        writer.write_all(b"second line\n").unwrap();

        assert_eq!(Some(b"first line\n".to_vec()), logger.receiver.recv().await);
        assert_eq!(Some(b"second line\n".to_vec()), logger.receiver.recv().await);
    }

    #[tokio::test]
    async fn test_open_creates_parent_dir() {
        let dir = std::env::temp_dir().join(format!("pinggate-{}", uuid::Uuid::new_v4()));
        let path = dir.join("gateway.log");
        let logger = Logger::new(config::Log {
            path: path.to_string_lossy().to_string(),
        });

        logger.open_log_file().await.unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
