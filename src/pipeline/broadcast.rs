//! Latest-frame-wins video slot

use std::time::Duration;

use tokio::sync::watch;

use crate::capture::frame::{Frame, VersionedFrame};
use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, Default)]
struct FrameSlot {
    frame: Option<Frame>,
    /// Bumped exactly once per publish; 0 means nothing published yet
    version: u64,
    closed: Option<CaptureError>,
}

/// Single-slot mailbox holding the most recent video frame.
///
/// One writer publishes, any number of readers wait for a version newer
/// than the one they last saw. Frames a reader was too slow to observe are
/// gone for good.
pub struct FrameBroadcaster {
    slot: watch::Sender<FrameSlot>,
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(FrameSlot::default());
        Self { slot }
    }

    /// Replace the latest frame and wake every waiter. Returns the new
    /// version, or `None` once the broadcaster is closed.
    pub fn publish(&self, frame: Frame) -> Option<u64> {
        let mut published = None;
        self.slot.send_if_modified(|slot| {
            if slot.closed.is_some() {
                return false;
            }
            slot.version += 1;
            slot.frame = Some(frame);
            published = Some(slot.version);
            true
        });
        published
    }

    /// Fail every current and future wait with `err`. The first cause wins.
    pub fn close(&self, err: CaptureError) {
        self.slot.send_if_modified(|slot| {
            if slot.closed.is_some() {
                return false;
            }
            slot.closed = Some(err);
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.slot.borrow().closed.is_some()
    }

    pub fn version(&self) -> u64 {
        self.slot.borrow().version
    }

    pub fn latest(&self) -> Option<VersionedFrame> {
        let slot = self.slot.borrow();
        slot.frame.clone().map(|frame| VersionedFrame {
            frame,
            version: slot.version,
        })
    }

    /// Wait for a frame with a version greater than `after`.
    ///
    /// `None` waits for the next publish after this call, so a fresh reader
    /// never gets a frame that was already sitting in the slot.
    pub async fn await_next(&self, after: Option<u64>) -> Result<VersionedFrame> {
        let mut rx = self.slot.subscribe();
        let after = match after {
            Some(version) => version,
            None => rx.borrow_and_update().version,
        };

        let slot = rx
            .wait_for(|slot| slot.closed.is_some() || slot.version > after)
            .await
            .map_err(|_| CaptureError::CoordinatorStopped)?;

        if let Some(err) = &slot.closed {
            return Err(err.clone());
        }
        match &slot.frame {
            Some(frame) => Ok(VersionedFrame {
                frame: frame.clone(),
                version: slot.version,
            }),
            None => Err(CaptureError::CoordinatorStopped),
        }
    }

    pub async fn await_next_timeout(
        &self,
        after: Option<u64>,
        timeout: Duration,
    ) -> Result<VersionedFrame> {
        tokio::time::timeout(timeout, self.await_next(after))
            .await
            .map_err(|_| CaptureError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::ImageFormat;
    use std::sync::Arc;

    fn frame(tag: &str) -> Frame {
        Frame::new(tag.as_bytes().to_vec(), ImageFormat::Jpeg)
    }

    #[test]
    fn test_publish_bumps_version_once_per_write() {
        let broadcaster = FrameBroadcaster::new();
        assert_eq!(broadcaster.version(), 0);
        assert!(broadcaster.latest().is_none());

        assert_eq!(broadcaster.publish(frame("a")), Some(1));
        assert_eq!(broadcaster.publish(frame("a")), Some(2));

        let latest = broadcaster.latest().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(&latest.frame.data[..], b"a");
    }

    #[tokio::test]
    async fn test_slow_reader_gets_something_newer() {
        let broadcaster = FrameBroadcaster::new();
        for tag in ["v1", "v2", "v3"] {
            broadcaster.publish(frame(tag));
        }

        let next = broadcaster.await_next(Some(1)).await.unwrap();
        // latest-wins: 2 may have been overwritten already
        assert!(next.version > 1);
        assert_eq!(&next.frame.data[..], b"v3");
    }

    #[tokio::test]
    async fn test_fresh_reader_blocks_until_next_publish() {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        broadcaster.publish(frame("stale"));

        let waiter = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.await_next(None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        broadcaster.publish(frame("fresh"));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(&got.frame.data[..], b"fresh");
    }

    #[tokio::test]
    async fn test_one_publish_releases_every_waiter() {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move { broadcaster.await_next(Some(0)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        broadcaster.publish(frame("only"));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().version, 1);
        }
    }

    #[tokio::test]
    async fn test_reader_never_sees_a_version_twice() {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let publisher = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                for i in 0..200u32 {
                    broadcaster.publish(frame(&i.to_string()));
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut last = Some(0);
        let mut seen = Vec::new();
        while seen.len() < 20 {
            match broadcaster
                .await_next_timeout(last, Duration::from_millis(200))
                .await
            {
                Ok(next) => {
                    assert!(next.version > last.unwrap());
                    last = Some(next.version);
                    seen.push(next.version);
                }
                Err(CaptureError::Timeout(_)) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        publisher.await.unwrap();

        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_later_calls() {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let waiter = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.await_next(None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broadcaster.close(CaptureError::DeviceUnavailable("unplugged".into()));
        broadcaster.close(CaptureError::CoordinatorStopped);

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            CaptureError::DeviceUnavailable("unplugged".into())
        );
        assert!(broadcaster.is_closed());
        assert_eq!(broadcaster.publish(frame("late")), None);
        assert!(broadcaster.await_next(Some(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_deadline_elapses_without_publisher() {
        let broadcaster = FrameBroadcaster::new();
        let err = broadcaster
            .await_next_timeout(None, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::Timeout(Duration::from_millis(30)));
    }
}
