mod common;

use common::{CallLog, Gate, RecordingDriver, options, provisioner, registry, stacks};
use stackflow_cloud::{
    DeployOptions, ErrorKind, FileStateStore, Operation, ProvisionError, ProvisionOptions,
    ProvisionStatus, Provisioner, StateKey, StateStore, UnitStatus,
};
use stackflow_core::{ActionType, Document, obfuscate};
use stackflow_secrets::{AgeIdentity, decrypt_all, encrypt_all};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const INFRA: &str = r#"
resources:
  db:
    type: postgres
    config:
      host: 10.0.0.5
      port: 5432
"#;

const API: &str = r#"
type: web
parent: infra
uses: [db]
config:
  api_key: "${secret:API_KEY}"
  database_url: "postgres://${resource:db.host}:${resource:db.port}/app"
environments:
  staging:
    replicas: 1
  prod:
    replicas: 3
"#;

const API_KEY: &str = "sk-live-0123456789";
/// Same length and ends as `API_KEY`, so both obfuscate alike
const ROTATED_KEY: &str = "sk-live-9876543219";

fn descriptors() -> Vec<(&'static str, &'static str)> {
    vec![("infra", INFRA), ("api", API)]
}

fn deploy() -> DeployOptions {
    DeployOptions::default()
}

async fn provision_infra(provisioner: &Provisioner, env: &str) {
    provisioner
        .provision(&["infra".to_string()], env, ProvisionOptions::default())
        .await
        .unwrap();
}

fn secrets() -> Arc<stackflow_secrets::SecretsStore> {
    secrets_with(API_KEY)
}

fn secrets_with(api_key: &str) -> Arc<stackflow_secrets::SecretsStore> {
    let identity = AgeIdentity::ephemeral();
    let plaintext = BTreeMap::from([("API_KEY".to_string(), api_key.to_string())]);
    let document = encrypt_all(&plaintext, &[identity.public_key()]).unwrap();
    decrypt_all(&document, &identity, false).unwrap().store
}

#[tokio::test]
async fn test_deploy_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let state = Arc::new(FileStateStore::new(dir.path()));
    let provisioner = Provisioner::new(registry(&driver), stacks(&descriptors()), state.clone())
        .with_options(options())
        .with_secrets(secrets());

    provision_infra(&provisioner, "prod").await;
    let report = provisioner
        .deploy("api", "prod", "v1.2.0", deploy())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.succeeded(), vec!["api"]);
    assert_eq!(report.version.as_deref(), Some("v1.2.0"));
    assert_eq!(log.count("apply api"), 1);

    // Substituted config, secrets obfuscated
    let config = &report.config;
    assert_eq!(
        config.get("database_url"),
        Some(&Document::from("postgres://10.0.0.5:5432/app"))
    );
    assert_eq!(config.get("api_key"), Some(&Document::from(obfuscate(API_KEY))));
    assert_eq!(config.get("version"), Some(&Document::from("v1.2.0")));
    assert_eq!(config.get("replicas").and_then(Document::as_i64), Some(3));

    let saved = state.load(&StateKey::new("api", "prod")).await.unwrap();
    assert_eq!(saved.status, ProvisionStatus::Succeeded);
    assert_eq!(saved.last_applied_version.as_deref(), Some("v1.2.0"));
    let api = &saved.resources["api"];
    assert_eq!(api.config.get("api_key"), Some(&Document::from(obfuscate(API_KEY))));
    // The driver received the plaintext and echoed it back as an output
    let applied = log.config("apply api").unwrap();
    assert_eq!(applied.get("api_key"), Some(&Document::from(API_KEY)));
    assert_eq!(api.outputs["api_key"], Document::from(obfuscate(API_KEY)));
    let persisted = std::fs::read_to_string(dir.path().join("state/api/prod.json")).unwrap();
    assert!(!persisted.contains(API_KEY));

    // Same version again: nothing to do
    let again = provisioner
        .deploy("api", "prod", "v1.2.0", deploy())
        .await
        .unwrap();
    assert_eq!(again.summary().no_change, 1);
    assert_eq!(log.count("apply api"), 1);

    // New version: update
    let update = provisioner
        .deploy("api", "prod", "v1.3.0", deploy())
        .await
        .unwrap();
    assert_eq!(update.summary().update, 1);
    assert_eq!(log.count("apply api"), 2);
}

#[tokio::test]
async fn test_deploy_needs_applied_parent_resources() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, _state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());

    let err = provisioner
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnresolvedPlaceholder);
    assert!(err.is_preflight());
    assert!(log.calls().is_empty());
}

#[tokio::test]
async fn test_deploy_without_secrets_store() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, _state) = provisioner(&driver, &descriptors());
    provision_infra(&provisioner, "prod").await;

    let err = provisioner
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Secret);
    assert!(err.to_string().contains("API_KEY"));
    assert_eq!(log.count("apply api"), 0);
}

#[tokio::test]
async fn test_deploy_rejects_infrastructure_stack() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, _state) = provisioner(&driver, &descriptors());

    let err = provisioner
        .deploy("infra", "prod", "v1", deploy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn test_pr_deploy_uses_own_state() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "staging").await;

    let report = provisioner
        .deploy(
            "api",
            "staging",
            "pr-42",
            DeployOptions {
                preview: false,
                pr_number: Some(42),
            },
        )
        .await
        .unwrap();
    assert_eq!(report.environment, "staging-pr-42");
    assert_eq!(report.config.get("replicas").and_then(Document::as_i64), Some(1));

    let pr = state
        .load(&StateKey::new("api", "staging-pr-42"))
        .await
        .unwrap();
    assert_eq!(pr.resources.len(), 1);
    let canonical = state.load(&StateKey::new("api", "staging")).await.unwrap();
    assert!(canonical.resources.is_empty());
}

#[tokio::test]
async fn test_deploy_preview_plans_stack_unit() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "prod").await;
    let before = state.load(&StateKey::new("api", "prod")).await.unwrap();

    let report = provisioner
        .deploy(
            "api",
            "prod",
            "v2",
            DeployOptions {
                preview: true,
                pr_number: None,
            },
        )
        .await
        .unwrap();
    assert!(report.preview);
    assert_eq!(report.status_of("api"), Some(&UnitStatus::Planned));
    let changeset = report.unit("api").unwrap().changeset.as_ref().unwrap();
    assert_eq!(changeset.actions[0].action_type, ActionType::Create);
    assert_eq!(
        changeset.desired.get("api_key"),
        Some(&Document::from(obfuscate(API_KEY)))
    );

    assert_eq!(log.count("apply api"), 0);
    let after = state.load(&StateKey::new("api", "prod")).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_concurrent_deploy_conflicts() {
    let log = Arc::new(CallLog::default());
    let gate = Gate::new("api");
    let driver = RecordingDriver::new(log.clone()).with_gate(gate.clone());
    let (provisioner, _state) = provisioner(&driver, &descriptors());
    let provisioner = Arc::new(provisioner.with_secrets(secrets()));
    provision_infra(&provisioner, "prod").await;

    let first = {
        let provisioner = provisioner.clone();
        tokio::spawn(async move { provisioner.deploy("api", "prod", "v1", deploy()).await })
    };
    tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .unwrap();

    let err = provisioner
        .deploy("api", "prod", "v2", deploy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.is_preflight());
    match &err {
        ProvisionError::Conflict {
            owner, operation, ..
        } => {
            assert_eq!(owner, "test-host");
            assert_eq!(*operation, Operation::Deploy);
        }
        other => panic!("unexpected error: {other}"),
    }

    gate.release.notify_one();
    let report = first.await.unwrap().unwrap();
    assert!(report.is_success());
    assert_eq!(log.count("apply api"), 1);
}

#[tokio::test]
async fn test_destroy_uses_reverse_dependency_order() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(
        &driver,
        &[(
            "infra",
            r#"
resources:
  network:
    type: bucket
    config:
      cidr: 10.0.0.0/16
  db:
    type: postgres
    config:
      subnet: "${resource:network.cidr}"
  cache:
    type: redis
    config:
      db: "${resource:db.id}"
"#,
        )],
    );
    provision_infra(&provisioner, "prod").await;

    let planned = provisioner.destroy("infra", "prod", true).await.unwrap();
    assert_eq!(planned.summary().delete, 3);
    assert_eq!(log.count("destroy"), 0);

    let report = provisioner.destroy("infra", "prod", false).await.unwrap();
    assert_eq!(report.succeeded(), vec!["cache", "db", "network"]);
    let destroys: Vec<String> = log
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("destroy"))
        .collect();
    assert_eq!(destroys, vec!["destroy cache", "destroy db", "destroy network"]);

    let saved = state.load(&StateKey::new("infra", "prod")).await.unwrap();
    assert!(saved.resources.is_empty());
    assert_eq!(saved.status, ProvisionStatus::Succeeded);
}

#[tokio::test]
async fn test_destroy_failure_keeps_remaining_state() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "prod").await;
    driver.fail_on("db");

    let err = provisioner
        .destroy_parent("infra", "prod", true, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Apply);
    assert_eq!(err.resource(), Some("db"));

    let saved = state.load(&StateKey::new("infra", "prod")).await.unwrap();
    assert!(saved.resources.contains_key("db"));
    assert_eq!(saved.status, ProvisionStatus::Failed);
}

#[tokio::test]
async fn test_destroy_application() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "prod").await;
    provisioner
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap();

    let report = provisioner.destroy("api", "prod", false).await.unwrap();
    assert_eq!(report.operation, Operation::Destroy);
    assert_eq!(report.succeeded(), vec!["api"]);

    let saved = state.load(&StateKey::new("api", "prod")).await.unwrap();
    assert!(saved.resources.is_empty());
    assert!(saved.last_applied_version.is_none());

    // Parent resources are untouched
    let infra = state.load(&StateKey::new("infra", "prod")).await.unwrap();
    assert!(infra.resources.contains_key("db"));
}

#[tokio::test]
async fn test_destroy_parent_refuses_while_used() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "prod").await;
    provision_infra(&provisioner, "staging").await;
    provisioner
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap();

    let err = provisioner
        .destroy_parent("infra", "prod", false, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependentStacks);
    assert!(err.is_preflight());
    match &err {
        ProvisionError::DependentStacks { dependents, .. } => {
            assert_eq!(dependents, &vec!["api".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(log.count("destroy"), 0);

    // Nothing deployed in staging
    provisioner
        .destroy_parent("infra", "staging", false, false)
        .await
        .unwrap();

    let forced = provisioner
        .destroy_parent("infra", "prod", true, false)
        .await
        .unwrap();
    assert_eq!(forced.operation, Operation::DestroyParent);
    assert_eq!(forced.succeeded(), vec!["db"]);
    let infra = state.load(&StateKey::new("infra", "prod")).await.unwrap();
    assert!(infra.resources.is_empty());
}

#[tokio::test]
async fn test_echoed_secrets_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let state = Arc::new(FileStateStore::new(dir.path()));
    // `application` deploys through the static driver, which echoes config
    let descriptors = [(
        "site",
        r#"
type: application
config:
  outputs:
    token: "${secret:API_KEY}"
    dsn: "https://user:${secret:API_KEY}@example.com"
"#,
    )];
    let provisioner = Provisioner::new(registry(&driver), stacks(&descriptors), state.clone())
        .with_options(options())
        .with_secrets(secrets());

    provisioner
        .deploy("site", "prod", "v1", deploy())
        .await
        .unwrap();

    let saved = state.load(&StateKey::new("site", "prod")).await.unwrap();
    let outputs = &saved.resources["site"].outputs;
    assert_eq!(outputs["token"], Document::from(obfuscate(API_KEY)));
    assert_eq!(
        outputs["dsn"],
        Document::from(format!("https://user:{}@example.com", obfuscate(API_KEY)))
    );
    let persisted = std::fs::read_to_string(dir.path().join("state/site/prod.json")).unwrap();
    assert!(!persisted.contains(API_KEY));
}

#[tokio::test]
async fn test_rotated_secret_redeploys() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "prod").await;
    provisioner
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap();
    assert_eq!(obfuscate(API_KEY), obfuscate(ROTATED_KEY));

    let rotated = Provisioner::new(registry(&driver), stacks(&descriptors()), state.clone())
        .with_options(options())
        .with_secrets(secrets_with(ROTATED_KEY));
    let report = rotated
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap();
    assert_eq!(report.summary().update, 1);
    assert_eq!(log.count("apply api"), 2);
    let applied = log.config("apply api").unwrap();
    assert_eq!(applied.get("api_key"), Some(&Document::from(ROTATED_KEY)));

    // Unchanged secret: nothing to do
    let again = rotated
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap();
    assert_eq!(again.summary().no_change, 1);
    assert_eq!(log.count("apply api"), 2);
}

#[tokio::test]
async fn test_destroy_substitutes_secrets_again() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "prod").await;
    provisioner
        .deploy("api", "prod", "v1", deploy())
        .await
        .unwrap();

    // Without secrets the destroy fails before touching anything
    let locked_out = Provisioner::new(registry(&driver), stacks(&descriptors()), state.clone())
        .with_options(options());
    let err = locked_out.destroy("api", "prod", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Secret);
    assert!(err.is_preflight());
    assert_eq!(log.count("destroy"), 0);
    let saved = state.load(&StateKey::new("api", "prod")).await.unwrap();
    assert!(saved.resources.contains_key("api"));
    assert!(!saved.is_locked());

    let report = provisioner.destroy("api", "prod", false).await.unwrap();
    assert_eq!(report.succeeded(), vec!["api"]);
    let destroyed = log.config("destroy api").unwrap();
    assert_eq!(destroyed.get("api_key"), Some(&Document::from(API_KEY)));
    assert_eq!(
        destroyed.get("database_url"),
        Some(&Document::from("postgres://10.0.0.5:5432/app"))
    );
    // The report shows the record as persisted
    let changeset = report.unit("api").unwrap().changeset.as_ref().unwrap();
    assert_eq!(
        changeset.desired.get("api_key"),
        Some(&Document::from(obfuscate(API_KEY)))
    );
}

#[tokio::test]
async fn test_command_destroy_receives_secret() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let state = Arc::new(FileStateStore::new(dir.path().join(".stackflow")));
    let jobs = r#"
resources:
  token:
    type: command
    config:
      apply: ["true"]
      destroy: ["sh", "-c", "printf %s \"$1\" > revoked", "sh", "${secret:API_KEY}"]
      workdir: WORKDIR
"#
    .replace("WORKDIR", &dir.path().display().to_string());
    let provisioner = Provisioner::new(
        registry(&driver),
        stacks(&[("jobs", jobs.as_str())]),
        state.clone(),
    )
    .with_options(options())
        .with_secrets(secrets());

    provisioner
        .provision(&["jobs".to_string()], "prod", ProvisionOptions::default())
        .await
        .unwrap();
    let persisted =
        std::fs::read_to_string(dir.path().join(".stackflow/state/jobs/prod.json")).unwrap();
    assert!(!persisted.contains(API_KEY));

    provisioner.destroy("jobs", "prod", false).await.unwrap();
    let revoked = std::fs::read_to_string(dir.path().join("revoked")).unwrap();
    assert_eq!(revoked, API_KEY);
}

#[tokio::test]
async fn test_destroy_parent_refuses_while_pr_environment_uses_it() {
    let log = Arc::new(CallLog::default());
    let driver = RecordingDriver::new(log.clone());
    let (provisioner, _state) = provisioner(&driver, &descriptors());
    let provisioner = provisioner.with_secrets(secrets());
    provision_infra(&provisioner, "prod").await;
    provisioner
        .deploy(
            "api",
            "prod",
            "pr-7",
            DeployOptions {
                preview: false,
                pr_number: Some(7),
            },
        )
        .await
        .unwrap();

    let err = provisioner
        .destroy_parent("infra", "prod", false, false)
        .await
        .unwrap_err();
    match &err {
        ProvisionError::DependentStacks { dependents, .. } => {
            assert_eq!(dependents, &vec!["api".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(log.count("destroy"), 0);

    provisioner.destroy("api", "prod-pr-7", false).await.unwrap();
    let report = provisioner
        .destroy_parent("infra", "prod", false, false)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), vec!["db"]);
}
