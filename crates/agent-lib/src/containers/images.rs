//! Container image registry
//!
//! Tracks per-image state (`Local`, `Pending`, `Absent`) and de-duplicates
//! concurrent fetches: at most one pull is ever in flight per image name,
//! and every waiter observes the same terminal outcome. Failed pulls are
//! retried with a randomized backoff before the failure is reported.

use crate::runtime::ContainerRuntime;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// State of one image name in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Present on this node.
    Local,
    /// A fetch is in flight.
    Pending,
    /// Not present and not being fetched.
    Absent,
}

/// Retry/backoff policy for image pulls.
#[derive(Debug, Clone)]
pub struct ImagePullConfig {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ImagePullConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

enum Entry {
    Local,
    /// Receives `Some(outcome)` when the in-flight fetch finishes.
    Pending(watch::Receiver<Option<bool>>),
}

/// De-duplicated image fetch registry.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Arc<dyn ContainerRuntime>,
    config: ImagePullConfig,
    images: Mutex<HashMap<String, Entry>>,
}

impl ImageManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ImagePullConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                config,
                images: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Seed the registry with the images already present on the node.
    ///
    /// Both the full `repo:tag` reference and the bare repository name are
    /// recorded so either form matches later requests.
    pub async fn prime(&self) {
        let listed = match self.inner.runtime.list_images().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "Unable to list local images, starting with an empty registry");
                return;
            }
        };

        let mut images = self.inner.images.lock().await;
        for image in listed {
            if let Some(colon) = image.rfind(':') {
                if colon > 0 {
                    images.insert(image[..colon].to_string(), Entry::Local);
                }
            }
            images.insert(image, Entry::Local);
        }
        info!(count = images.len(), "Primed image registry");
    }

    pub async fn state(&self, image: &str) -> ImageState {
        match self.inner.images.lock().await.get(image) {
            Some(Entry::Local) => ImageState::Local,
            Some(Entry::Pending(_)) => ImageState::Pending,
            None => ImageState::Absent,
        }
    }

    /// Schedule a fetch for `image`. A no-op when the image is already
    /// local or a fetch is pending.
    pub async fn fetch(&self, image: &str) {
        let _ = self.ensure_fetch(image).await;
    }

    /// Block until `image` is local or its fetch has failed, starting a
    /// fetch if none is in flight. Returns whether the image is local.
    pub async fn wait_for(&self, image: &str) -> bool {
        let mut outcome_rx = match self.ensure_fetch(image).await {
            None => return true,
            Some(rx) => rx,
        };

        loop {
            let outcome = *outcome_rx.borrow();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if outcome_rx.changed().await.is_err() {
                // fetch worker died without reporting
                return false;
            }
        }
    }

    /// Returns `None` when the image is already local, otherwise the
    /// receiver for the (possibly just started) in-flight fetch. The map
    /// lock makes the check-and-spawn atomic, which is what guarantees at
    /// most one fetch per image name.
    async fn ensure_fetch(&self, image: &str) -> Option<watch::Receiver<Option<bool>>> {
        let mut images = self.inner.images.lock().await;
        match images.get(image) {
            Some(Entry::Local) => None,
            Some(Entry::Pending(rx)) => Some(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                images.insert(image.to_string(), Entry::Pending(rx.clone()));

                let inner = Arc::clone(&self.inner);
                let image = image.to_string();
                tokio::spawn(async move {
                    inner.pull_with_retry(&image, tx).await;
                });

                Some(rx)
            }
        }
    }
}

impl Inner {
    async fn pull_with_retry(&self, image: &str, outcome_tx: watch::Sender<Option<bool>>) {
        let backoff_range_ms = self
            .config
            .max_backoff
            .saturating_sub(self.config.min_backoff)
            .as_millis() as u64;

        for attempt in 0..self.config.max_attempts {
            match self.runtime.pull_image(image).await {
                Ok(()) => {
                    info!(image = %image, attempt, "Image pull succeeded");
                    self.images
                        .lock()
                        .await
                        .insert(image.to_string(), Entry::Local);
                    let _ = outcome_tx.send(Some(true));
                    return;
                }
                Err(e) => {
                    let last_attempt = attempt + 1 >= self.config.max_attempts;
                    if last_attempt {
                        warn!(image = %image, attempt, error = %e, "Last pull attempt failed");
                    } else {
                        let jitter = if backoff_range_ms == 0 {
                            0
                        } else {
                            rand::thread_rng().gen_range(0..=backoff_range_ms)
                        };
                        let delay = self.config.min_backoff + Duration::from_millis(jitter);
                        warn!(
                            image = %image,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Pull attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // give up; wake every waiter with the failure
        self.images.lock().await.remove(image);
        let _ = outcome_tx.send(Some(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerInspect, ContainerSpec, RuntimeStatsSample};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Runtime stub that counts pulls and can hold them open.
    struct MockRuntime {
        pull_count: AtomicUsize,
        pull_release: Notify,
        hold_pulls: bool,
        fail_pulls: bool,
        local_images: Vec<String>,
    }

    impl MockRuntime {
        fn new() -> Self {
            Self {
                pull_count: AtomicUsize::new(0),
                pull_release: Notify::new(),
                hold_pulls: false,
                fail_pulls: false,
                local_images: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn create_container(&self, _spec: &ContainerSpec) -> Result<String> {
            unimplemented!()
        }
        async fn start_container(&self, _id: &str) -> Result<()> {
            unimplemented!()
        }
        async fn stop_container(&self, _name: &str, _grace: Duration) -> Result<()> {
            unimplemented!()
        }
        async fn remove_container(&self, _name: &str) -> Result<()> {
            unimplemented!()
        }
        async fn container_logs(&self, _name: &str) -> Result<String> {
            unimplemented!()
        }
        async fn inspect_container(&self, _name: &str) -> Result<ContainerInspect> {
            unimplemented!()
        }
        async fn container_stats(&self, _name: &str, _nic: &str) -> Result<RuntimeStatsSample> {
            unimplemented!()
        }

        async fn pull_image(&self, image: &str) -> Result<()> {
            self.pull_count.fetch_add(1, Ordering::SeqCst);
            if self.hold_pulls {
                self.pull_release.notified().await;
            }
            if self.fail_pulls {
                bail!("pull of {} failed", image);
            }
            Ok(())
        }

        async fn list_images(&self) -> Result<Vec<String>> {
            Ok(self.local_images.clone())
        }
    }

    fn manager_with(runtime: MockRuntime, config: ImagePullConfig) -> (Arc<ImageManager>, Arc<MockRuntime>) {
        let runtime = Arc::new(runtime);
        let manager = Arc::new(ImageManager::new(runtime.clone(), config));
        (manager, runtime)
    }

    #[tokio::test]
    async fn test_concurrent_waiters_trigger_one_fetch() {
        let mut mock = MockRuntime::new();
        mock.hold_pulls = true;
        let (manager, runtime) = manager_with(mock, ImagePullConfig::default());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(
                async move { manager.wait_for("registry:5000/svc").await },
            ));
        }

        // give the waiters time to pile up, then release the pull
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state("registry:5000/svc").await, ImageState::Pending);
        runtime.pull_release.notify_waiters();

        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(runtime.pull_count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state("registry:5000/svc").await, ImageState::Local);
    }

    #[tokio::test]
    async fn test_failed_fetch_reports_to_all_waiters() {
        let mut mock = MockRuntime::new();
        mock.fail_pulls = true;
        let config = ImagePullConfig {
            max_attempts: 2,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let (manager, runtime) = manager_with(mock, config);

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_for("missing").await })
        };
        assert!(!manager.wait_for("missing").await);
        assert!(!waiter.await.unwrap());

        assert_eq!(runtime.pull_count.load(Ordering::SeqCst), 2);
        // terminal failure leaves the image absent so a later request can
        // try again
        assert_eq!(manager.state("missing").await, ImageState::Absent);
    }

    #[tokio::test]
    async fn test_wait_for_local_image_skips_pull() {
        let mut mock = MockRuntime::new();
        mock.local_images = vec!["registry:5000/svc:latest".to_string()];
        let (manager, runtime) = manager_with(mock, ImagePullConfig::default());

        manager.prime().await;
        assert!(manager.wait_for("registry:5000/svc:latest").await);
        // the tag-stripped name was recorded too
        assert!(manager.wait_for("registry:5000/svc").await);
        assert_eq!(runtime.pull_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent() {
        let (manager, runtime) = manager_with(MockRuntime::new(), ImagePullConfig::default());

        manager.wait_for("svc").await;
        manager.fetch("svc").await;
        manager.fetch("svc").await;

        assert_eq!(runtime.pull_count.load(Ordering::SeqCst), 1);
    }
}
