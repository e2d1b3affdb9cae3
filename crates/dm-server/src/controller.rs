//! Uniform policy on top of a device driver.
//!
//! The controller validates every shape command against cached actuator
//! metadata before the driver sees it, serializes actuation (at most one
//! in-flight hardware call per device), and keeps a cached [`MirrorState`]
//! so status and shape queries never touch the driver. A driver failure
//! during actuation marks the device unhealthy and is surfaced to the
//! caller; actuation is never retried automatically.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use dm_core::config::BusyPolicy;
use dm_core::protocol::MirrorStatus;
use dm_core::{DmError, DmResult};
use dm_drivers::{validate_shape, DeformableMirror, StrokeLimits};

/// Runtime state of one mirror, owned by its server process.
#[derive(Debug, Clone)]
pub struct MirrorState {
    pub shape: Vec<f64>,
    pub flat_tag: Option<String>,
    pub last_command_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub command_counter: u64,
}

pub struct MirrorController {
    name: String,
    driver: Arc<dyn DeformableMirror>,
    busy_policy: BusyPolicy,
    default_flat_tag: Option<String>,
    // Metadata cached at construction so validation never touches the
    // driver.
    n_actuators: usize,
    limits: StrokeLimits,
    actuation: Mutex<()>,
    state: RwLock<MirrorState>,
}

impl MirrorController {
    /// Wrap an initialized driver. Seeds the shape cache from the driver's
    /// current commanded shape.
    pub async fn new(
        name: String,
        busy_policy: BusyPolicy,
        default_flat_tag: Option<String>,
        driver: Arc<dyn DeformableMirror>,
    ) -> DmResult<Self> {
        let shape = driver.shape().await?;
        let n_actuators = driver.actuator_count();
        let limits = driver.stroke_limits();
        Ok(MirrorController {
            name,
            driver,
            busy_policy,
            default_flat_tag,
            n_actuators,
            limits,
            actuation: Mutex::new(()),
            state: RwLock::new(MirrorState {
                shape,
                flat_tag: None,
                last_command_at: None,
                healthy: true,
                command_counter: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actuator_count(&self) -> usize {
        self.n_actuators
    }

    /// Apply the descriptor's default flat, if one is configured.
    pub async fn apply_startup_flat(&self) -> DmResult<Option<String>> {
        match self.default_flat_tag.clone() {
            Some(tag) => {
                self.apply_flat(Some(&tag)).await?;
                Ok(Some(tag))
            }
            None => Ok(None),
        }
    }

    async fn acquire(&self) -> DmResult<MutexGuard<'_, ()>> {
        match self.busy_policy {
            BusyPolicy::Queue => Ok(self.actuation.lock().await),
            BusyPolicy::Reject => self
                .actuation
                .try_lock()
                .map_err(|_| DmError::DeviceBusy),
        }
    }

    pub async fn set_shape(&self, shape: &[f64]) -> DmResult<()> {
        // Fail fast locally rather than let the driver reject mid-call.
        validate_shape(self.n_actuators, self.limits, shape)?;
        let _guard = self.acquire().await?;
        match self.driver.apply_shape(shape).await {
            Ok(()) => {
                self.commit(shape.to_vec(), None).await;
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Apply a named flat; `None` selects the descriptor's default tag.
    pub async fn apply_flat(&self, tag: Option<&str>) -> DmResult<String> {
        let tag = match tag.or(self.default_flat_tag.as_deref()) {
            Some(tag) => tag.to_string(),
            None => return Err(DmError::UnknownFlatTag("(default)".into())),
        };
        let _guard = self.acquire().await?;
        match self.driver.apply_flat(&tag).await {
            Ok(applied) => {
                self.commit(applied, Some(tag.clone())).await;
                Ok(tag)
            }
            Err(e) => {
                self.note_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Cached read path; never touches the driver.
    pub async fn shape(&self) -> Vec<f64> {
        self.state.read().await.shape.clone()
    }

    /// Cached status; never touches the driver.
    pub async fn status(&self) -> MirrorStatus {
        let state = self.state.read().await;
        MirrorStatus {
            name: self.name.clone(),
            model: self.driver.model().to_string(),
            serial_number: self.driver.serial_number().to_string(),
            n_actuators: self.n_actuators,
            healthy: state.healthy,
            flat_tag: state.flat_tag.clone(),
            command_counter: state.command_counter,
            last_command_at: state.last_command_at,
        }
    }

    /// Prefix-keyed identity snapshot.
    pub async fn snapshot(&self, prefix: Option<&str>) -> BTreeMap<String, serde_json::Value> {
        let prefix = prefix.unwrap_or(&self.name);
        let state = self.state.read().await;
        let mut entries = BTreeMap::new();
        entries.insert(
            format!("{prefix}.serial_number"),
            self.driver.serial_number().into(),
        );
        entries.insert(format!("{prefix}.model"), self.driver.model().into());
        entries.insert(
            format!("{prefix}.command_counter"),
            state.command_counter.into(),
        );
        entries.insert(
            format!("{prefix}.reference_command_tag"),
            state
                .flat_tag
                .clone()
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
        );
        entries
    }

    pub async fn shutdown(&self) -> DmResult<()> {
        self.driver.shutdown().await
    }

    async fn commit(&self, shape: Vec<f64>, flat_tag: Option<String>) {
        let mut state = self.state.write().await;
        state.shape = shape;
        state.flat_tag = flat_tag;
        state.last_command_at = Some(Utc::now());
        state.command_counter += 1;
    }

    /// Hardware faults poison the health flag; validation and contention
    /// errors leave it untouched.
    async fn note_failure(&self, error: &DmError) {
        if error.is_validation() {
            return;
        }
        let mut state = self.state.write().await;
        state.healthy = false;
        tracing::warn!(mirror = %self.name, error = %error, "actuation fault, marking unhealthy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dm_drivers::simulated::{SimulatedConfig, SimulatedDm};
    use dm_drivers::FlatLibrary;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    async fn simulated_controller(policy: BusyPolicy) -> MirrorController {
        let config = SimulatedConfig {
            n_actuators: 4,
            stroke: 1.0,
        };
        let driver = Arc::new(SimulatedDm::new(
            "SIM-7".into(),
            config,
            FlatLibrary::with_zero(4),
        ));
        driver.initialize().await.unwrap();
        MirrorController::new("dm1".into(), policy, Some("zero".into()), driver)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_the_cache() {
        let ctrl = simulated_controller(BusyPolicy::Queue).await;
        ctrl.set_shape(&[0.1, 0.2, 0.3, 0.4]).await.unwrap();
        assert_eq!(ctrl.shape().await, vec![0.1, 0.2, 0.3, 0.4]);

        let status = ctrl.status().await;
        assert_eq!(status.command_counter, 1);
        assert!(status.healthy);
        assert!(status.last_command_at.is_some());
    }

    #[tokio::test]
    async fn rejected_commands_do_not_count() {
        let ctrl = simulated_controller(BusyPolicy::Queue).await;
        let err = ctrl.set_shape(&[0.1, 0.2]).await.unwrap_err();
        assert_eq!(err.kind(), "ShapeDimensionMismatch");

        let status = ctrl.status().await;
        assert_eq!(status.command_counter, 0);
        assert!(status.healthy);
        assert_eq!(ctrl.shape().await, vec![0.0; 4]);
    }

    #[tokio::test]
    async fn startup_flat_applies_the_default_tag() {
        let ctrl = simulated_controller(BusyPolicy::Queue).await;
        let applied = ctrl.apply_startup_flat().await.unwrap();
        assert_eq!(applied.as_deref(), Some("zero"));
        assert_eq!(ctrl.status().await.flat_tag.as_deref(), Some("zero"));
    }

    #[tokio::test]
    async fn set_shape_clears_the_flat_tag() {
        let ctrl = simulated_controller(BusyPolicy::Queue).await;
        ctrl.apply_flat(None).await.unwrap();
        assert_eq!(ctrl.status().await.flat_tag.as_deref(), Some("zero"));
        ctrl.set_shape(&[0.1, 0.0, 0.0, 0.0]).await.unwrap();
        assert!(ctrl.status().await.flat_tag.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_prefix_keyed() {
        let ctrl = simulated_controller(BusyPolicy::Queue).await;
        let snapshot = ctrl.snapshot(Some("bench")).await;
        assert_eq!(
            snapshot["bench.serial_number"],
            serde_json::Value::from("SIM-7")
        );
        assert!(snapshot.contains_key("bench.command_counter"));
    }

    /// Driver that parks in `apply_shape` until released; used to pin an
    /// actuation in flight.
    struct StalledDriver {
        release: tokio::sync::Notify,
        entered: tokio::sync::Notify,
        failing: AtomicBool,
    }

    impl StalledDriver {
        fn new() -> Self {
            StalledDriver {
                release: tokio::sync::Notify::new(),
                entered: tokio::sync::Notify::new(),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DeformableMirror for StalledDriver {
        fn model(&self) -> &'static str {
            "simulatedDM"
        }
        fn serial_number(&self) -> &str {
            "STALL-1"
        }
        fn actuator_count(&self) -> usize {
            2
        }
        fn stroke_limits(&self) -> StrokeLimits {
            StrokeLimits::symmetric(1.0)
        }
        fn is_initialized(&self) -> bool {
            true
        }
        async fn initialize(&self) -> DmResult<()> {
            Ok(())
        }
        async fn apply_shape(&self, _shape: &[f64]) -> DmResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DmError::DeviceUnavailable("link dropped".into()));
            }
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
        async fn shape(&self) -> DmResult<Vec<f64>> {
            Ok(vec![0.0; 2])
        }
        async fn apply_flat(&self, tag: &str) -> DmResult<Vec<f64>> {
            let _ = tag;
            Ok(vec![0.0; 2])
        }
        async fn shutdown(&self) -> DmResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reject_policy_reports_busy() {
        let driver = Arc::new(StalledDriver::new());
        let ctrl = Arc::new(
            MirrorController::new("dm1".into(), BusyPolicy::Reject, None, driver.clone())
                .await
                .unwrap(),
        );

        let first = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.set_shape(&[0.1, 0.1]).await })
        };
        // Wait until the first command holds the driver.
        driver.entered.notified().await;

        let err = ctrl.set_shape(&[0.2, 0.2]).await.unwrap_err();
        assert_eq!(err.kind(), "DeviceBusy");

        // Reads still proceed from the cache while actuation is in flight.
        let status = ctrl.status().await;
        assert!(status.healthy);

        driver.release.notify_one();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn hardware_fault_marks_unhealthy_and_is_not_retried() {
        let driver = Arc::new(StalledDriver::new());
        driver.failing.store(true, Ordering::SeqCst);
        let ctrl = MirrorController::new("dm1".into(), BusyPolicy::Queue, None, driver)
            .await
            .unwrap();

        let err = ctrl.set_shape(&[0.1, 0.1]).await.unwrap_err();
        assert_eq!(err.kind(), "DeviceUnavailable");
        let status = ctrl.status().await;
        assert!(!status.healthy);
        assert_eq!(status.command_counter, 0);
    }
}
