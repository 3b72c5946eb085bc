use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Counters shared by the worker, the recorder and the video sink
#[derive(Default)]
pub struct CoordinatorStats {
    counters: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    frames_published: AtomicU64,
    frames_skipped: AtomicU64,
    stills_captured: AtomicU64,
    stills_failed: AtomicU64,
    stills_abandoned: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_published: u64,
    pub frames_skipped: u64,
    pub stills_captured: u64,
    pub stills_failed: u64,
    pub stills_abandoned: u64,
}

impl CoordinatorStats {
    pub fn record_published(&self) {
        self.counters.frames_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camshare_video_frames_published").increment(1);
    }

    pub fn record_skipped(&self) {
        self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camshare_video_frames_skipped").increment(1);
    }

    pub fn record_still(&self) {
        self.counters.stills_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camshare_stills_captured").increment(1);
    }

    pub fn record_still_failed(&self) {
        self.counters.stills_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camshare_stills_failed").increment(1);
    }

    pub fn record_abandoned(&self) {
        self.counters.stills_abandoned.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camshare_stills_abandoned").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            frames_published: c.frames_published.load(Ordering::Relaxed),
            frames_skipped: c.frames_skipped.load(Ordering::Relaxed),
            stills_captured: c.stills_captured.load(Ordering::Relaxed),
            stills_failed: c.stills_failed.load(Ordering::Relaxed),
            stills_abandoned: c.stills_abandoned.load(Ordering::Relaxed),
        }
    }
}
