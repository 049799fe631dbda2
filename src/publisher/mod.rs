//! Publisher module for change notifications
//!
//! Every notification is a single frame on a Unix socket: a big-endian `u32`
//! length followed by a MessagePack map `{channel, message}`.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, WatcherError};

/// Publish side of a pub/sub channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

/// Payload of one notification frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub message: String,
}

/// Encode a notification as a length-prefixed MessagePack frame
pub fn encode_frame(notification: &Notification) -> Result<Bytes> {
    let payload = rmp_serde::to_vec_named(notification)
        .map_err(|e| WatcherError::SerializationError(format!("Failed to serialize: {}", e)))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| WatcherError::PublishError(format!("Frame too large: {} bytes", payload.len())))?;

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(len);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Publisher writing notification frames to a Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    /// Create a new publisher; a broker that is not up yet is retried on publish
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        match publisher.open().await {
            Ok(stream) => *publisher.stream.lock().await = Some(stream),
            Err(e) => warn!(error = %e, "Initial IPC connection failed, will retry on publish"),
        }
        publisher
    }

    async fn open(&self) -> Result<UnixStream> {
        let path = Path::new(&self.socket_path);
        if !path.exists() {
            return Err(WatcherError::PublishError(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            WatcherError::PublishError(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;
        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(stream)
    }
}

#[async_trait]
impl Notifier for Publisher {
    /// Socket failures drop the notification instead of failing the caller
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let frame = encode_frame(&Notification {
            channel: channel.to_string(),
            message: message.to_string(),
        })?;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            match self.open().await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    debug!(error = %e, channel, "Dropping notification");
                    return Ok(());
                }
            }
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(()) => debug!(channel, message, "Published notification"),
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn decode(frame: &[u8]) -> Notification {
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(frame.len(), 4 + len);
        rmp_serde::from_slice(&frame[4..]).unwrap()
    }

    #[test]
    fn test_frame_layout() {
        let notification = Notification {
            channel: "from-watcher:order-book-snapshot-id".to_string(),
            message: "*".to_string(),
        };
        let frame = encode_frame(&notification).unwrap();
        assert_eq!(decode(&frame), notification);
    }

    #[tokio::test]
    async fn test_missing_socket_drops_notification() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("absent.sock");
        let publisher = Publisher::new(path.to_str().unwrap()).await;

        assert!(publisher.publish("channel", "*").await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_reaches_listener() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("broker.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let publisher = Publisher::new(path.to_str().unwrap()).await;
        let (mut socket, _) = listener.accept().await.unwrap();

        publisher.publish("snapshots", "abc123").await.unwrap();

        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        socket.read_exact(&mut payload).await.unwrap();

        let mut frame = len.to_vec();
        frame.extend_from_slice(&payload);
        assert_eq!(
            decode(&frame),
            Notification {
                channel: "snapshots".to_string(),
                message: "abc123".to_string(),
            }
        );
    }
}
