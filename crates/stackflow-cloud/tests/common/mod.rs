#![allow(dead_code)]

use async_trait::async_trait;
use stackflow_cloud::{
    MemoryStateStore, ProvisionOptions, Provisioner, ProvisionerOptions, RetryConfig,
};
use stackflow_core::{
    AppliedResource, AuthProvider, Changeset, Credential, DesiredResource, Document,
    DocumentDecoder, DriverError, Outputs, Registry, RegistryBuilder, ResourceDriver, StacksMap,
    parse_descriptor,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;

/// Driver calls in the order they happened, e.g. `apply db`
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
    /// Config the driver received, by call
    configs: Mutex<HashMap<String, Document>>,
}

impl CallLog {
    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn push_with_config(&self, call: String, config: &Document) {
        self.configs
            .lock()
            .unwrap()
            .insert(call.clone(), config.clone());
        self.push(call);
    }

    /// Config received by the last call named `call`
    pub fn config(&self, call: &str) -> Option<Document> {
        self.configs.lock().unwrap().get(call).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// Blocks `apply` of one resource until released
pub struct Gate {
    pub resource: String,
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    pub fn new(resource: &str) -> Arc<Self> {
        Arc::new(Self {
            resource: resource.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

/// Resource driver that records calls and echoes its config as outputs
#[derive(Clone)]
pub struct RecordingDriver {
    pub log: Arc<CallLog>,
    pub fail: Arc<Mutex<HashSet<String>>>,
    pub gate: Option<Arc<Gate>>,
}

impl RecordingDriver {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            fail: Arc::new(Mutex::new(HashSet::new())),
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fail_on(&self, resource: &str) {
        self.fail.lock().unwrap().insert(resource.to_string());
    }
}

#[async_trait]
impl ResourceDriver for RecordingDriver {
    fn name(&self) -> &str {
        "recording"
    }

    async fn plan(
        &self,
        desired: &DesiredResource,
        current: Option<&AppliedResource>,
    ) -> Result<Changeset, DriverError> {
        self.log.push(format!("plan {}", desired.name));
        Ok(Changeset::diff(desired, current))
    }

    async fn apply(&self, changeset: &Changeset) -> Result<Outputs, DriverError> {
        self.log
            .push_with_config(format!("apply {}", changeset.resource), &changeset.desired);
        if let Some(gate) = &self.gate
            && gate.resource == changeset.resource
        {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail.lock().unwrap().contains(&changeset.resource) {
            return Err(DriverError::ApiError(format!(
                "{} rejected",
                changeset.resource
            )));
        }

        let mut outputs: Outputs = changeset
            .desired
            .as_map()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        outputs.insert(
            "id".to_string(),
            format!("{}-id", changeset.resource).into(),
        );
        Ok(outputs)
    }

    async fn destroy(&self, applied: &AppliedResource) -> Result<(), DriverError> {
        self.log
            .push_with_config(format!("destroy {}", applied.name), &applied.config);
        if self.fail.lock().unwrap().contains(&applied.name) {
            return Err(DriverError::ApiError(format!("{} is busy", applied.name)));
        }
        Ok(())
    }
}

/// A second provisioner run by [`RacingAuth`]
pub struct Rival {
    pub provisioner: Provisioner,
    pub stack: String,
    pub environment: String,
}

/// Auth provider that, once armed, lets a rival provisioner finish a whole
/// run while the first credential is fetched
#[derive(Clone, Default)]
pub struct RacingAuth {
    rival: Arc<OnceLock<Rival>>,
    raced: Arc<AtomicBool>,
}

impl RacingAuth {
    pub fn arm(&self, rival: Rival) {
        let _ = self.rival.set(rival);
    }
}

#[async_trait]
impl AuthProvider for RacingAuth {
    fn name(&self) -> &str {
        "racing"
    }

    async fn credential(&self, _config: &Document) -> Result<Credential, DriverError> {
        if let Some(rival) = self.rival.get()
            && !self.raced.swap(true, Ordering::SeqCst)
        {
            rival
                .provisioner
                .provision(
                    std::slice::from_ref(&rival.stack),
                    &rival.environment,
                    ProvisionOptions::default(),
                )
                .await
                .map_err(|e| DriverError::ApiError(e.to_string()))?;
        }
        Ok(Credential::new("race-token"))
    }
}

/// Registry with `postgres` / `redis` / `bucket` resources, the `web`
/// application template and the local providers
pub fn registry(driver: &RecordingDriver) -> Arc<Registry> {
    Arc::new(builder(driver).build())
}

pub fn builder(driver: &RecordingDriver) -> RegistryBuilder {
    let mut builder = Registry::builder();
    builder
        .register_resource("postgres", DocumentDecoder, driver.clone())
        .unwrap()
        .register_resource("redis", DocumentDecoder, driver.clone())
        .unwrap()
        .register_resource("bucket", DocumentDecoder, driver.clone())
        .unwrap()
        .register_template("web", DocumentDecoder, Some(Arc::new(driver.clone())))
        .unwrap();
    stackflow_cloud_local::register(&mut builder).unwrap();
    builder
}

pub fn stacks(descriptors: &[(&str, &str)]) -> Arc<StacksMap> {
    let mut stacks = StacksMap::new();
    for (name, content) in descriptors {
        let path = format!(".stackflow/stacks/{name}.yaml");
        stacks
            .insert(parse_descriptor(content, Path::new(&path)).unwrap())
            .unwrap();
    }
    Arc::new(stacks)
}

pub fn options() -> ProvisionerOptions {
    ProvisionerOptions {
        owner: "test-host".to_string(),
        lock_ttl: Duration::from_secs(3600),
        call_timeout: Duration::from_secs(5),
        retry: RetryConfig::none(),
    }
}

pub fn provisioner(
    driver: &RecordingDriver,
    descriptors: &[(&str, &str)],
) -> (Provisioner, Arc<MemoryStateStore>) {
    let state = Arc::new(MemoryStateStore::new());
    let provisioner = Provisioner::new(registry(driver), stacks(descriptors), state.clone())
        .with_options(options());
    (provisioner, state)
}
