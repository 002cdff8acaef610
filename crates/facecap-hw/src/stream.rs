//! Shared live media stream.
//!
//! A [`FrameFeed`] (owned by whoever drives the device) publishes frames;
//! any number of read-only [`MediaStream`] clones subscribe to them. When
//! the feed ends or is dropped, every subscriber observes the stream as
//! closed.

use crate::frame::{Frame, PixelFormat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Static properties of a live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

struct Shared {
    info: StreamInfo,
    sender: Mutex<Option<broadcast::Sender<Frame>>>,
    live: AtomicBool,
}

/// Read-only handle to the live camera feed.
#[derive(Clone)]
pub struct MediaStream {
    shared: Arc<Shared>,
}

/// Write side of a [`MediaStream`].
pub struct FrameFeed {
    shared: Arc<Shared>,
}

/// Create a connected feed/stream pair. `capacity` bounds how many frames a
/// slow subscriber may fall behind before it starts skipping.
pub fn media_stream(info: StreamInfo, capacity: usize) -> (FrameFeed, MediaStream) {
    let (sender, _) = broadcast::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        info,
        sender: Mutex::new(Some(sender)),
        live: AtomicBool::new(true),
    });
    (
        FrameFeed {
            shared: Arc::clone(&shared),
        },
        MediaStream { shared },
    )
}

impl MediaStream {
    pub fn info(&self) -> &StreamInfo {
        &self.shared.info
    }

    pub fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Receive every frame published from now on. A stream that has already
    /// ended yields a receiver that reports closed immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        let guard = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("info", &self.shared.info)
            .field("live", &self.is_live())
            .finish()
    }
}

impl FrameFeed {
    /// Publish a frame. Returns the number of subscribers that will see it.
    pub fn push(&self, frame: Frame) -> usize {
        let guard = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(sender) => sender.send(frame).unwrap_or(0),
            None => 0,
        }
    }

    /// End the stream. Subscribers drain what is buffered, then see `Closed`.
    pub fn end(&self) {
        self.shared.live.store(false, Ordering::Release);
        let sender = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if sender.is_some() {
            tracing::debug!(device = %self.shared.info.device, "media stream ended");
        }
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::broadcast::error::RecvError;

    fn info() -> StreamInfo {
        StreamInfo {
            device: "test".into(),
            width: 2,
            height: 1,
            format: PixelFormat::Mjpeg,
        }
    }

    fn frame(seq: u32) -> Frame {
        Frame {
            data: Bytes::from(vec![seq as u8]),
            width: 2,
            height: 1,
            format: PixelFormat::Mjpeg,
            timestamp: std::time::Instant::now(),
            sequence: seq,
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_frames_in_order() {
        let (feed, stream) = media_stream(info(), 8);
        let mut a = stream.subscribe();
        let mut b = stream.clone().subscribe();

        for seq in 0..3 {
            assert_eq!(feed.push(frame(seq)), 2);
        }
        for seq in 0..3 {
            assert_eq!(a.recv().await.unwrap().sequence, seq);
            assert_eq!(b.recv().await.unwrap().sequence, seq);
        }
    }

    #[tokio::test]
    async fn test_drop_feed_closes_stream() {
        let (feed, stream) = media_stream(info(), 8);
        let mut rx = stream.subscribe();
        feed.push(frame(7));
        drop(feed);

        assert!(!stream.is_live());
        assert_eq!(rx.recv().await.unwrap().sequence, 7);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_subscribe_after_end_is_closed() {
        let (feed, stream) = media_stream(info(), 8);
        feed.end();
        let mut rx = stream.subscribe();
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert_eq!(feed.push(frame(1)), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let (feed, stream) = media_stream(info(), 2);
        let mut rx = stream.subscribe();
        for seq in 0..5 {
            feed.push(frame(seq));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().sequence, 3);
    }
}
