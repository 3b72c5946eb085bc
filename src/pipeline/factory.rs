//! At most one live coordinator per factory

use std::sync::{Arc, Mutex, Weak};

use flume::Receiver;
use tracing::info;

use super::coordinator::{CaptureCoordinator, CoordinatorState};
use crate::capture::Acquirer;
use crate::error::Result;
use crate::{utils, Config};

/// Hands out the one live [`CaptureCoordinator`], starting it on first use.
///
/// Construct one factory per process and pass it to whoever needs the
/// camera. A new coordinator is only started once the previous one has
/// stopped and released the device, so the device is never opened twice.
pub struct CoordinatorFactory {
    config: Config,
    acquirer: Acquirer,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    live: Weak<CaptureCoordinator>,
    /// Exit signal of the most recently started worker
    exited: Option<Receiver<()>>,
}

impl CoordinatorFactory {
    /// Factory that opens the device chosen by [`utils::acquire_from_config`]
    pub fn new(config: Config) -> Self {
        let acquirer = utils::config_acquirer(config.clone());
        Self::with_acquirer(config, acquirer)
    }

    pub fn with_acquirer(config: Config, acquirer: Acquirer) -> Self {
        Self {
            config,
            acquirer,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// The live coordinator, or a freshly started one if there is none
    pub fn get_or_start(&self) -> Result<Arc<CaptureCoordinator>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = slot.live.upgrade() {
            if existing.state() != CoordinatorState::Stopped {
                return Ok(existing);
            }
        }

        // the old worker may still be releasing the device
        if let Some(exited) = slot.exited.take() {
            let _ = exited.recv();
        }

        info!("Starting capture coordinator");
        let coordinator = Arc::new(CaptureCoordinator::start(
            &self.config,
            self.acquirer.clone(),
        )?);
        slot.live = Arc::downgrade(&coordinator);
        slot.exited = Some(coordinator.exit_signal());
        Ok(coordinator)
    }

    /// The live coordinator without starting one
    pub fn current(&self) -> Option<Arc<CaptureCoordinator>> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.live.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockProbe;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_repeated_calls_share_one_instance() {
        let probe = MockProbe::new();
        let factory = CoordinatorFactory::with_acquirer(Config::default(), probe.acquirer());
        assert!(factory.current().is_none());

        let first = factory.get_or_start().unwrap();
        let second = factory.get_or_start().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.ready().await.unwrap();
        assert_eq!(probe.acquisitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_instance_is_replaced_after_release() {
        let probe = MockProbe::new();
        let factory = CoordinatorFactory::with_acquirer(Config::default(), probe.acquirer());

        let first = factory.get_or_start().unwrap();
        first.ready().await.unwrap();
        first.shutdown();
        first.wait_stopped().await;

        let second = factory.get_or_start().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.ready().await.unwrap();

        assert_eq!(probe.acquisitions.load(Ordering::SeqCst), 2);
        assert_eq!(probe.release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_instance_is_replaced() {
        let probe = MockProbe::new();
        let factory = CoordinatorFactory::with_acquirer(Config::default(), probe.acquirer());

        let first = factory.get_or_start().unwrap();
        first.ready().await.unwrap();
        drop(first);
        assert!(factory.current().is_none());

        let second = factory.get_or_start().unwrap();
        second.ready().await.unwrap();
        assert_eq!(probe.release_calls.load(Ordering::SeqCst), 1);
    }
}
