//! Scriptable backend for coordinator tests

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::frame::ImageFormat;
use super::{Acquirer, CaptureBackend, VideoSink};
use crate::error::{CaptureError, Result};

/// Test-side view of every mock backend it acquires
#[derive(Default)]
pub(crate) struct MockProbe {
    pub acquisitions: AtomicUsize,
    pub still_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
    sink: Mutex<Option<VideoSink>>,
    gate: Mutex<Option<flume::Receiver<()>>>,
    failing_stills: Mutex<HashSet<usize>>,
    acquire_delay: Mutex<Option<Duration>>,
    refuse_acquire: Mutex<Option<String>>,
    refuse_start: AtomicBool,
}

impl MockProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquirer(self: &Arc<Self>) -> Acquirer {
        let probe = self.clone();
        Arc::new(move || -> Result<Box<dyn CaptureBackend>> {
            probe.acquisitions.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = *probe.acquire_delay.lock().unwrap() {
                std::thread::sleep(delay);
            }
            if let Some(reason) = probe.refuse_acquire.lock().unwrap().clone() {
                return Err(CaptureError::DeviceUnavailable(reason));
            }
            Ok(Box::new(MockBackend {
                probe: probe.clone(),
            }))
        })
    }

    /// Each still capture blocks until one `()` is sent; dropping the sender fails them
    pub fn gate_stills(&self) -> flume::Sender<()> {
        let (tx, rx) = flume::unbounded();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Make the `n`th still capture (1-based) fail
    pub fn fail_still(&self, n: usize) {
        self.failing_stills.lock().unwrap().insert(n);
    }

    pub fn delay_acquire(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = Some(delay);
    }

    pub fn refuse_acquire(&self, reason: &str) {
        *self.refuse_acquire.lock().unwrap() = Some(reason.to_string());
    }

    pub fn refuse_start(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }

    pub fn push_frame(&self, data: impl Into<Bytes>) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.write(data.into());
        }
    }

    pub fn fault(&self, err: CaptureError) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.fault(err);
        }
    }
}

pub(crate) fn failing_acquirer(reason: &str) -> Acquirer {
    let reason = reason.to_string();
    Arc::new(move || -> Result<Box<dyn CaptureBackend>> {
        Err(CaptureError::DeviceUnavailable(reason.clone()))
    })
}

struct MockBackend {
    probe: Arc<MockProbe>,
}

impl CaptureBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn start_continuous(&mut self, sink: VideoSink) -> Result<()> {
        if self.probe.refuse_start.load(Ordering::SeqCst) {
            return Err(CaptureError::CaptureFailed("encoder refused to start".into()));
        }
        *self.probe.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn capture_one(&mut self, sink: &mut dyn Write, _format: ImageFormat) -> Result<()> {
        let n = self.probe.still_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = self.probe.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.recv()
                .map_err(|_| CaptureError::CaptureFailed("gate closed".into()))?;
        }

        if self.probe.failing_stills.lock().unwrap().contains(&n) {
            return Err(CaptureError::CaptureFailed(format!("still {n} failed")));
        }
        write!(sink, "still-{n}")?;
        Ok(())
    }

    fn release(&mut self) {
        self.probe.release_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.sink.lock().unwrap().take();
    }
}
