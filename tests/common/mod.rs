//! Shared fixtures for the reconciler tests.
//!
//! Every collaborator the reconcilers touch is replaced by an in-process fake: a
//! [`MemoryStore`] per kind, a fetcher and introspector that never leave the process, a step
//! runner that records what it was asked to run, and a sink that records notifications.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use astrolabe_operator::config::ControllerConfig;
use astrolabe_operator::controller::reconciler::module::{
    FetchError, IntrospectError, Introspector, ModuleInterface, SourceFetcher,
};
use astrolabe_operator::controller::reconciler::notify::{NotificationSink, ObjectRef, Severity};
use astrolabe_operator::controller::reconciler::stack::{Step, StepError, StepRunner};
use astrolabe_operator::controller::reconciler::{Reconciler, Stores};
use astrolabe_operator::crd::*;
use astrolabe_operator::store::MemoryStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "team-a";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeFetcher {
    pub fail_with: Mutex<Option<String>>,
    pub calls: Mutex<Vec<ModuleSource>>,
}

impl FakeFetcher {
    pub fn fail(&self, output: &str) {
        *self.fail_with.lock().unwrap() = Some(output.to_string());
    }

    pub fn recover(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, source: &ModuleSource, workspace: &Path) -> Result<PathBuf, FetchError> {
        self.calls.lock().unwrap().push(source.clone());
        if let Some(output) = self.fail_with.lock().unwrap().clone() {
            return Err(FetchError::Git {
                url: source.url.clone(),
                output,
            });
        }
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|source| FetchError::Io {
                path: workspace.to_path_buf(),
                source,
            })?;
        Ok(workspace.to_path_buf())
    }
}

#[derive(Debug, Default)]
pub struct FakeIntrospector {
    pub interface: Mutex<ModuleInterface>,
    pub fail: Mutex<bool>,
}

impl FakeIntrospector {
    pub fn with_inputs(inputs: Vec<ModuleInput>) -> Self {
        Self {
            interface: Mutex::new(ModuleInterface {
                description: Some("test module".to_string()),
                inputs,
                ..ModuleInterface::default()
            }),
            fail: Mutex::new(false),
        }
    }
}

#[async_trait]
impl Introspector for FakeIntrospector {
    async fn introspect(&self, _root: &Path) -> Result<ModuleInterface, IntrospectError> {
        if *self.fail.lock().unwrap() {
            return Err(IntrospectError::Failed {
                program: "terraform-docs".to_string(),
                code: 1,
                stderr: "no terraform files".to_string(),
            });
        }
        Ok(self.interface.lock().unwrap().clone())
    }
}

#[derive(Debug)]
pub struct FakeRunner {
    pub steps: Mutex<Vec<Step>>,
    pub envs: Mutex<Vec<BTreeMap<String, String>>>,
    pub fail_on: Mutex<Option<Step>>,
    pub state: Mutex<Vec<u8>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            steps: Mutex::new(Vec::new()),
            envs: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            state: Mutex::new(sample_state().to_string().into_bytes()),
        }
    }
}

impl FakeRunner {
    pub fn fail_on(&self, step: Option<Step>) {
        *self.fail_on.lock().unwrap() = step;
    }

    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.steps.lock().unwrap().clear();
        self.envs.lock().unwrap().clear();
    }
}

#[async_trait]
impl StepRunner for FakeRunner {
    async fn run_step(
        &self,
        _workspace: &Path,
        step: Step,
        env: &BTreeMap<String, String>,
    ) -> Result<String, StepError> {
        self.steps.lock().unwrap().push(step);
        self.envs.lock().unwrap().push(env.clone());
        if *self.fail_on.lock().unwrap() == Some(step) {
            return Err(StepError::Exit {
                step,
                code: 1,
                output: format!("Error: {step} exploded"),
            });
        }
        Ok(format!("{step} complete"))
    }

    async fn read_state(
        &self,
        _workspace: &Path,
        _env: &BTreeMap<String, String>,
    ) -> std::io::Result<Vec<u8>> {
        Ok(self.state.lock().unwrap().clone())
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(Severity, String, String)>>,
    /// `kind/name` of every object whose history was released
    pub forgotten: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(severity, _, _)| *severity == Severity::Warning)
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn emit(
        &self,
        _object: &ObjectRef,
        severity: Severity,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((severity, reason.to_string(), message.to_string()));
        Ok(())
    }

    async fn forget(&self, object: &ObjectRef) {
        self.forgotten
            .lock()
            .unwrap()
            .push(format!("{}/{}", object.kind, object.name));
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub modules: Arc<MemoryStore<Module>>,
    pub backend_configs: Arc<MemoryStore<BackendConfig>>,
    pub cloud_credentials: Arc<MemoryStore<CloudCredentials>>,
    pub stacks: Arc<MemoryStore<Stack>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub fetcher: Arc<FakeFetcher>,
    pub introspector: Arc<FakeIntrospector>,
    pub runner: Arc<FakeRunner>,
    pub sink: Arc<RecordingSink>,
    pub reconciler: Arc<Reconciler>,
    pub work_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_introspector(FakeIntrospector::with_inputs(vec![
            input("region", true),
            input("cidr", false),
        ]))
    }

    pub fn with_introspector(introspector: FakeIntrospector) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            work_dir: work_dir.path().to_path_buf(),
            status_retry_base_ms: 1,
            failure_requeue_secs: 60,
            ..ControllerConfig::default()
        };

        let modules = Arc::new(MemoryStore::new());
        let backend_configs = Arc::new(MemoryStore::new());
        let cloud_credentials = Arc::new(MemoryStore::new());
        let stacks = Arc::new(MemoryStore::new());
        let secrets = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(FakeFetcher::default());
        let introspector = Arc::new(introspector);
        let runner = Arc::new(FakeRunner::default());
        let sink = Arc::new(RecordingSink::default());

        let stores = Stores {
            modules: modules.clone(),
            backend_configs: backend_configs.clone(),
            cloud_credentials: cloud_credentials.clone(),
            stacks: stacks.clone(),
            secrets: secrets.clone(),
        };
        let reconciler = Arc::new(Reconciler::from_parts(
            stores,
            fetcher.clone(),
            introspector.clone(),
            runner.clone(),
            sink.clone(),
            config,
        ));

        Self {
            modules,
            backend_configs,
            cloud_credentials,
            stacks,
            secrets,
            fetcher,
            introspector,
            runner,
            sink,
            reconciler,
            work_dir,
        }
    }

    pub fn module(&self, name: &str) -> Module {
        self.modules.snapshot(NAMESPACE, name).unwrap()
    }

    pub fn stack(&self, name: &str) -> Option<Stack> {
        self.stacks.snapshot(NAMESPACE, name)
    }

    pub fn backend_config(&self, name: &str) -> BackendConfig {
        self.backend_configs.snapshot(NAMESPACE, name).unwrap()
    }

    pub fn stack_status(&self, name: &str) -> StackStatus {
        self.stack(name).and_then(|s| s.status).unwrap_or_default()
    }

    pub fn stack_workspace(&self, name: &str) -> PathBuf {
        self.reconciler.config.stack_workspace(NAMESPACE, name)
    }

    /// A Module whose interface is already published, as the Module reconciler leaves it
    pub fn insert_populated_module(&self, name: &str, inputs: Vec<ModuleInput>) -> Module {
        let mut module = module(name, "git", "https://example.com/modules/vpc.git");
        module.status = Some(ModuleStatus {
            inputs,
            last_synced: Some("2026-01-01T00:00:00Z".to_string()),
            ..ModuleStatus::default()
        });
        module
            .status
            .as_mut()
            .unwrap()
            .conditions
            .upsert(CONDITION_READY, CONDITION_TRUE, "Synced", "ok");
        self.modules.insert(module)
    }

    /// A ready s3 BackendConfig named `state` with credentials through CloudCredentials
    pub fn insert_ready_s3_backend(&self) {
        self.secrets.insert(secret(
            "aws-creds",
            &[
                ("aws_access_key_id", "AKIAEXAMPLE"),
                ("aws_secret_access_key", "s3cr3t"),
            ],
        ));
        self.cloud_credentials.insert(cloud_credentials("aws", "aws-creds"));
        let mut config = backend_config(
            "state",
            "s3",
            json!({"bucket": "tf-state", "region": "us-east-1"}),
            Some("aws"),
        );
        let mut status = BackendConfigStatus::default();
        status
            .conditions
            .upsert(CONDITION_READY, CONDITION_TRUE, "Ready", "ok");
        config.status = Some(status);
        self.backend_configs.insert(config);
    }
}

// ============================================================================
// Fixture builders
// ============================================================================

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..ObjectMeta::default()
    }
}

pub fn input(name: &str, required: bool) -> ModuleInput {
    ModuleInput {
        name: name.to_string(),
        r#type: "string".to_string(),
        description: None,
        default: if required { None } else { Some(json!("10.0.0.0/16")) },
        required,
        sensitive: false,
    }
}

pub fn module(name: &str, source_type: &str, url: &str) -> Module {
    let mut module = Module::new(
        name,
        ModuleSpec {
            source: ModuleSource {
                r#type: source_type.to_string(),
                url: url.to_string(),
                version: Some("v1.0.0".to_string()),
                path: None,
            },
        },
    );
    module.metadata = meta(name);
    module
}

pub fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: meta(name),
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Secret::default()
    }
}

pub fn cloud_credentials(name: &str, secret_name: &str) -> CloudCredentials {
    let mut credentials = CloudCredentials::new(
        name,
        CloudCredentialsSpec {
            r#type: "aws".to_string(),
            secret_ref: SecretReference {
                name: secret_name.to_string(),
                namespace: None,
            },
        },
    );
    credentials.metadata = meta(name);
    credentials
}

pub fn backend_config(
    name: &str,
    backend_type: &str,
    settings: Value,
    credentials: Option<&str>,
) -> BackendConfig {
    let mut config = BackendConfig::new(
        name,
        BackendConfigSpec {
            r#type: backend_type.to_string(),
            settings: Some(settings),
            credential_ref: credentials.map(|name| CredentialReference {
                name: name.to_string(),
            }),
        },
    );
    config.metadata = meta(name);
    config
}

pub fn stack_module(name: &str, module_ref: &str, variables: Value, depends_on: &[&str]) -> StackModule {
    StackModule {
        name: name.to_string(),
        module_ref: Some(module_ref.to_string()),
        variables: Some(variables),
        depends_on: depends_on.iter().map(|d| (*d).to_string()).collect(),
    }
}

pub fn stack(name: &str, modules: Vec<StackModule>) -> Stack {
    let mut stack = Stack::new(
        name,
        StackSpec {
            backend_config: None,
            backend_ref: Some(BackendReference {
                name: "state".to_string(),
            }),
            credential_ref: None,
            modules,
        },
    );
    stack.metadata = meta(name);
    stack
}

/// State after applying one vpc module with an aws_vpc and a data source
pub fn sample_state() -> Value {
    json!({
        "version": 4,
        "outputs": {
            "vpc_id": {"value": "vpc-123", "type": "string"}
        },
        "resources": [
            {"mode": "managed", "type": "aws_vpc", "name": "this", "module": "module.vpc"},
            {"mode": "data", "type": "aws_region", "name": "current"}
        ]
    })
}

/// Move the stored retry time into the past, as if the failure delay had elapsed
pub async fn expire_stack_retry_gate(h: &Harness, name: &str) {
    use astrolabe_operator::store::ObjectStore;
    let mut stack = h.stack(name).unwrap();
    stack.status.as_mut().unwrap().next_retry_time =
        Some((chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc3339());
    h.stacks.replace_status(&stack).await.unwrap();
}

pub async fn expire_module_retry_gate(h: &Harness, name: &str) {
    use astrolabe_operator::store::ObjectStore;
    let mut module = h.module(name);
    module.status.as_mut().unwrap().next_retry_time =
        Some((chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc3339());
    h.modules.replace_status(&module).await.unwrap();
}

static RUSTLS_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
