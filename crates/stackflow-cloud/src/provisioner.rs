//! Provisioning orchestrator
//!
//! Drives one operation per (stack, environment) through
//! `Idle → Planning → Applying → Succeeded | Failed | Cancelled`.
//!
//! Every check that can fail without touching a cloud resource runs first:
//! inheritance, registry lookups, apply order, placeholder substitution,
//! secrets and auth credentials. Only then is the lock taken and the units
//! planned and applied one by one in dependency order. A failing unit stops
//! the run; units already applied stay applied and are reported as such.
//!
//! Outputs are persisted with every substituted secret value masked. Destroy
//! substitutes the recorded config templates again, so drivers get the same
//! values they were applied with.

use crate::cancel::{CancelSignals, CancelToken};
use crate::error::{ProvisionError, Result, StateError};
use crate::graph::{Cycle, Dependencies, dependency_order};
use crate::report::{ProvisionReport, UnitReport, UnitStatus};
use crate::retry::{CallError, CallKind, RetryConfig, call_with_retry};
use crate::state::{
    LockInfo, Operation, ProvisionState, ProvisionStatus, StateKey, StateStore,
};
use futures_util::future::join_all;
use stackflow_core::placeholder::{self, TokenKind};
use stackflow_core::{
    AppliedResource, Changeset, ConfigError, Document, DesiredResource, Mapping,
    MergedDescriptor, Namespace, Outputs, PlaceholderContext, PlaceholderError, PlaceholderToken,
    RegistryEntry, RegistryError, Registry, ResolveMode, ResourceDriver, SecretLookup,
    SensitiveValues, StackKind, StacksMap, UnitKind, inheritance,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const CAS_ATTEMPTS: usize = 16;

/// Well-known config key receiving the deployed version
pub const VERSION_KEY: &str = "version";

/// Host name used as lock owner
pub fn default_owner() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct ProvisionerOptions {
    /// Recorded in locks
    pub owner: String,
    /// Locks older than this are taken over
    pub lock_ttl: Duration,
    /// Bound on a single driver or auth call
    pub call_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            lock_ttl: Duration::from_secs(60 * 60),
            call_timeout: Duration::from_secs(5 * 60),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    pub preview: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    pub preview: bool,
    /// Deploy into `<environment>-pr-<n>` instead of the environment itself
    pub pr_number: Option<u64>,
}

/// One plannable resource, or the stack itself
struct Unit {
    name: String,
    type_key: String,
    owner: String,
    kind: UnitKind,
    /// Config before substitution
    config: Document,
    /// Field path of `config`, for error messages
    base: String,
    entry: RegistryEntry,
    driver: Arc<dyn ResourceDriver>,
    deps: BTreeSet<String>,
}

/// Everything a run needs, gathered before any mutation
struct Run {
    key: StateKey,
    operation: Operation,
    preview: bool,
    merged: MergedDescriptor,
    /// Units in apply order
    units: Vec<Unit>,
    /// Outputs of used resources owned by other stacks
    used_outputs: BTreeMap<String, Outputs>,
    /// Replaced by the record read under the lock
    current: ProvisionState,
    version: Option<String>,
}

impl Run {
    /// Outputs known before the first unit runs
    fn known_outputs(&self) -> BTreeMap<String, Outputs> {
        let mut outputs = self.current.outputs();
        outputs.extend(self.used_outputs.clone());
        outputs
    }
}

/// A unit ready to apply
struct Planned {
    desired: DesiredResource,
    changeset: Changeset,
    /// Masks substituted secrets echoed back in outputs
    sensitive: SensitiveValues,
}

/// A recorded resource to destroy
struct DestroyTarget {
    /// As persisted
    applied: AppliedResource,
    /// Handed to the driver, secrets and credentials substituted again
    resolved: AppliedResource,
    driver: Option<Arc<dyn ResourceDriver>>,
}

enum UnitFailure {
    Failed {
        message: String,
        changeset: Option<Changeset>,
    },
    Cancelled,
}

impl From<CallError> for UnitFailure {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Driver(e) => UnitFailure::Failed {
                message: e.to_string(),
                changeset: None,
            },
            CallError::Cancelled => UnitFailure::Cancelled,
        }
    }
}

/// Provisioning orchestrator
pub struct Provisioner {
    registry: Arc<Registry>,
    stacks: Arc<StacksMap>,
    state: Arc<dyn StateStore>,
    secrets: Option<Arc<dyn SecretLookup>>,
    options: ProvisionerOptions,
    signals: CancelSignals,
}

impl Provisioner {
    pub fn new(
        registry: Arc<Registry>,
        stacks: Arc<StacksMap>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            registry,
            stacks,
            state,
            secrets: None,
            options: ProvisionerOptions::default(),
            signals: CancelSignals::default(),
        }
    }

    /// Decrypted secrets for `${secret:..}`
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretLookup>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_options(mut self, options: ProvisionerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ProvisionerOptions {
        &self.options
    }

    /// Inheritance-resolved descriptor, without substitution. Read-only.
    pub fn resolve_stack(
        &self,
        name: &str,
        environment: Option<&str>,
    ) -> Result<MergedDescriptor> {
        let merged = match environment {
            Some(env) => inheritance::resolve_for_environment(name, env, &self.stacks)?,
            None => inheritance::resolve(name, &self.stacks)?,
        };
        Ok(merged)
    }

    /// Current persisted state
    pub async fn state(&self, stack: &str, environment: &str) -> Result<ProvisionState> {
        Ok(self.state.load(&StateKey::new(stack, environment)).await?)
    }

    /// Provision infrastructure stacks
    ///
    /// An empty `stacks` selects every infrastructure stack. Stacks are run
    /// level by level along the inheritance depth; stacks of one level run
    /// concurrently. A failing level stops the levels after it.
    #[instrument(skip(self, options), fields(preview = options.preview))]
    pub async fn provision(
        &self,
        stacks: &[String],
        profile: &str,
        options: ProvisionOptions,
    ) -> Result<Vec<ProvisionReport>> {
        let names: Vec<String> = if stacks.is_empty() {
            self.stacks
                .iter()
                .filter(|s| s.kind == StackKind::Infrastructure)
                .map(|s| s.name.clone())
                .collect()
        } else {
            stacks.to_vec()
        };

        let mut levels: BTreeMap<usize, Vec<MergedDescriptor>> = BTreeMap::new();
        for name in &names {
            let merged = inheritance::resolve_for_environment(name, profile, &self.stacks)?;
            if merged.kind != StackKind::Infrastructure {
                return Err(ConfigError::WrongKind {
                    stack: name.clone(),
                    expected: StackKind::Infrastructure.to_string(),
                }
                .into());
            }
            levels.entry(merged.chain.len()).or_default().push(merged);
        }

        let mut reports = Vec::with_capacity(names.len());
        for (depth, level) in levels {
            debug!(depth, stacks = level.len(), "Provisioning level");
            let results = join_all(level.into_iter().map(|merged| {
                let key = StateKey::new(&merged.name, profile);
                self.run_stack(key, profile, merged, Operation::Provision, None, options.preview)
            }))
            .await;

            let mut failure = None;
            for result in results {
                match result {
                    Ok(report) => reports.push(report),
                    Err(err) if failure.is_none() => failure = Some(err),
                    Err(err) => warn!(error = %err, "Provisioning failed"),
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(reports)
    }

    /// Deploy an application stack
    ///
    /// `version` is written to the config root. The stack's resources are
    /// applied first, then the stack itself through its template's driver.
    #[instrument(skip(self, options), fields(preview = options.preview, pr = ?options.pr_number))]
    pub async fn deploy(
        &self,
        stack: &str,
        environment: &str,
        version: &str,
        options: DeployOptions,
    ) -> Result<ProvisionReport> {
        let mut merged = inheritance::resolve_for_environment(stack, environment, &self.stacks)?;
        if merged.kind != StackKind::Application {
            return Err(ConfigError::WrongKind {
                stack: stack.to_string(),
                expected: StackKind::Application.to_string(),
            }
            .into());
        }
        if merged.config.is_null() {
            merged.config = Document::map();
        }
        if let Some(config) = merged.config.as_map_mut() {
            config.insert(VERSION_KEY, Document::String(version.to_string()));
        }

        let key = match options.pr_number {
            Some(pr) => StateKey::new(stack, format!("{environment}-pr-{pr}")),
            None => StateKey::new(stack, environment),
        };
        self.run_stack(
            key,
            environment,
            merged,
            Operation::Deploy,
            Some(version.to_string()),
            options.preview,
        )
        .await
    }

    /// Destroy everything recorded in the persisted state
    #[instrument(skip(self))]
    pub async fn destroy(
        &self,
        stack: &str,
        environment: &str,
        preview: bool,
    ) -> Result<ProvisionReport> {
        self.destroy_key(StateKey::new(stack, environment), Operation::Destroy, preview)
            .await
    }

    /// Destroy a parent stack
    ///
    /// Refuses while a stack deployed to the same environment, or to one of
    /// its PR environments, uses one of its resources, unless `force` is set.
    #[instrument(skip(self))]
    pub async fn destroy_parent(
        &self,
        stack: &str,
        environment: &str,
        force: bool,
        preview: bool,
    ) -> Result<ProvisionReport> {
        let key = StateKey::new(stack, environment);
        let current = self.state.load(&key).await?;
        let owned: BTreeSet<&str> = current.resources.keys().map(String::as_str).collect();

        let dependents = self.dependents(stack, environment, &owned).await?;
        if !dependents.is_empty() {
            if !force {
                return Err(ProvisionError::DependentStacks {
                    stack: stack.to_string(),
                    environment: environment.to_string(),
                    dependents,
                });
            }
            warn!(stack, ?dependents, "Destroying parent still used by dependent stacks");
        }

        self.destroy_key(key, Operation::DestroyParent, preview).await
    }

    /// Request cancellation of a running operation
    ///
    /// Returns whether an operation was running. Units already applying
    /// finish; no later unit starts.
    #[instrument(skip(self))]
    pub async fn cancel(&self, stack: &str, environment: &str) -> Result<bool> {
        let key = StateKey::new(stack, environment);
        let signalled = self.signals.signal(&key);

        let mut persisted = false;
        for _ in 0..CAS_ATTEMPTS {
            let mut state = self.state.load(&key).await?;
            if !state.is_locked() || state.cancel_requested {
                persisted = state.is_locked();
                break;
            }
            let expected = state.revision;
            state.cancel_requested = true;
            if self.state.compare_and_swap(&key, expected, &state).await? {
                persisted = true;
                break;
            }
        }

        info!(%key, signalled, persisted, "Cancellation requested");
        Ok(signalled || persisted)
    }

    async fn dependents(
        &self,
        stack: &str,
        environment: &str,
        owned: &BTreeSet<&str>,
    ) -> Result<Vec<String>> {
        let mut dependents = Vec::new();
        if owned.is_empty() {
            return Ok(dependents);
        }

        for descriptor in self.stacks.iter().filter(|s| s.name != stack) {
            let merged = match inheritance::resolve(&descriptor.name, &self.stacks) {
                Ok(merged) => merged,
                Err(err) => {
                    warn!(stack = %descriptor.name, error = %err, "Skipping unresolvable stack");
                    continue;
                }
            };
            let uses_owned = merged
                .uses
                .iter()
                .any(|r| r.owner == stack && owned.contains(r.name.as_str()));
            if !uses_owned {
                continue;
            }

            for deployed in self.state.environments(&descriptor.name).await? {
                let key = StateKey::new(&descriptor.name, deployed);
                if key.environment != environment && key.base_environment() != environment {
                    continue;
                }
                if !self.state.load(&key).await?.resources.is_empty() {
                    debug!(%key, "Dependent stack is deployed");
                    dependents.push(descriptor.name.clone());
                    break;
                }
            }
        }
        Ok(dependents)
    }

    // ---------------------------------------------------------------------
    // provision / deploy

    async fn run_stack(
        &self,
        key: StateKey,
        canonical_env: &str,
        merged: MergedDescriptor,
        operation: Operation,
        version: Option<String>,
        preview: bool,
    ) -> Result<ProvisionReport> {
        let signal = self.signals.register(&key);
        let mut run = self
            .prepare(key, canonical_env, merged, operation, version, preview)
            .await?;
        let credentials = self.preflight(&run, signal.token()).await?;

        if run.preview {
            return self.execute(&run, &credentials, None, signal.token()).await;
        }

        let (lock, locked) = self.acquire_lock(&run.key, operation).await?;
        // Another run may have committed since `prepare` read the record
        run.current = locked;
        self.execute(&run, &credentials, Some(&lock), signal.token())
            .await
    }

    async fn prepare(
        &self,
        key: StateKey,
        canonical_env: &str,
        merged: MergedDescriptor,
        operation: Operation,
        version: Option<String>,
        preview: bool,
    ) -> Result<Run> {
        let mut units = self.resource_units(&merged)?;
        if merged.kind == StackKind::Application
            && let Some(mut unit) = self.stack_unit(&merged)?
        {
            unit.deps.extend(units.iter().map(|u| u.name.clone()));
            units.push(unit);
        }
        let units = order_units(&merged.name, units)?;

        let current = self.state.load(&key).await?;
        let used_outputs = self.used_outputs(&merged, canonical_env).await?;

        debug!(
            %key,
            units = ?units.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
            "Prepared run"
        );
        Ok(Run {
            key,
            operation,
            preview,
            merged,
            units,
            used_outputs,
            current,
            version,
        })
    }

    fn resource_units(&self, merged: &MergedDescriptor) -> Result<Vec<Unit>> {
        merged
            .resources
            .iter()
            .map(|def| {
                let unknown = |source: RegistryError| ConfigError::UnknownResourceType {
                    stack: merged.name.clone(),
                    resource: def.name.clone(),
                    source,
                };
                let entry = self
                    .registry
                    .lookup(Namespace::Resource, &def.type_key)
                    .map_err(unknown)?;
                let driver = entry.resource_driver().cloned().ok_or_else(|| {
                    unknown(RegistryError::MissingDriver {
                        namespace: Namespace::Resource,
                        key: def.type_key.clone(),
                    })
                })?;
                Ok(Unit {
                    name: def.name.clone(),
                    type_key: def.type_key.clone(),
                    owner: def.owner.clone(),
                    kind: UnitKind::Resource,
                    config: def.config.clone(),
                    base: format!("resources.{}.config", def.name),
                    entry: entry.clone(),
                    driver,
                    deps: placeholder::resource_dependencies(&def.config),
                })
            })
            .collect()
    }

    fn stack_unit(&self, merged: &MergedDescriptor) -> Result<Option<Unit>> {
        let entry = self
            .registry
            .lookup(Namespace::Template, &merged.type_key)
            .map_err(|source| ConfigError::UnknownType {
                stack: merged.name.clone(),
                source,
            })?;
        let Some(driver) = entry.resource_driver().cloned() else {
            debug!(stack = %merged.name, template = %merged.type_key, "Template has no deployer");
            return Ok(None);
        };
        Ok(Some(Unit {
            name: merged.name.clone(),
            type_key: merged.type_key.clone(),
            owner: merged.name.clone(),
            kind: UnitKind::Stack,
            config: merged.config.clone(),
            base: "config".to_string(),
            entry: entry.clone(),
            driver,
            deps: placeholder::resource_dependencies(&merged.config),
        }))
    }

    /// Outputs of used resources owned by other stacks, read from their
    /// canonical environment.
    async fn used_outputs(
        &self,
        merged: &MergedDescriptor,
        canonical_env: &str,
    ) -> std::result::Result<BTreeMap<String, Outputs>, StateError> {
        let mut outputs = BTreeMap::new();
        let mut owner_states: HashMap<String, ProvisionState> = HashMap::new();

        for used in merged.uses.iter().filter(|r| r.owner != merged.name) {
            if !owner_states.contains_key(&used.owner) {
                let state = self
                    .state
                    .load(&StateKey::new(&used.owner, canonical_env))
                    .await?;
                owner_states.insert(used.owner.clone(), state);
            }
            if let Some(applied) = owner_states
                .get(&used.owner)
                .and_then(|s| s.resources.get(&used.name))
            {
                outputs.insert(used.name.clone(), applied.outputs.clone());
            }
        }
        Ok(outputs)
    }

    fn context<'a>(
        &'a self,
        preview: bool,
        outputs: &'a BTreeMap<String, Outputs>,
        pending: &'a BTreeSet<String>,
        credentials: &'a BTreeMap<String, String>,
    ) -> PlaceholderContext<'a> {
        let mode = if preview {
            ResolveMode::Preview
        } else {
            ResolveMode::Apply
        };
        let mut ctx = PlaceholderContext::new(mode)
            .with_outputs(outputs)
            .with_pending(pending)
            .with_credentials(credentials);
        if let Some(secrets) = &self.secrets {
            ctx = ctx.with_secrets(&**secrets);
        }
        ctx
    }

    /// Substitution check over every unit, then credential fetch.
    ///
    /// Returns the credentials to substitute. Previews get stable markers
    /// instead of real credentials.
    async fn preflight(
        &self,
        run: &Run,
        token: &CancelToken,
    ) -> Result<BTreeMap<String, String>> {
        let stack = &run.merged.name;
        let mut tokens: Vec<PlaceholderToken> = placeholder::scan(&run.merged);
        for unit in run.units.iter().filter(|u| u.kind == UnitKind::Resource) {
            tokens.extend(placeholder::scan_document(&unit.config, &unit.base));
        }

        let providers = self.auth_providers(stack, &tokens)?;
        let markers: BTreeMap<String, String> = providers
            .keys()
            .map(|name| (name.clone(), format!("<pending:auth:{name}>")))
            .collect();
        self.check_placeholders(run, &markers)?;

        if run.preview || providers.is_empty() {
            return Ok(markers);
        }
        let mut credentials = BTreeMap::new();
        self.fetch_credentials(
            &run.key,
            run.operation,
            &run.merged.auth,
            &providers,
            token,
            &mut credentials,
        )
        .await?;
        Ok(credentials)
    }

    /// Registry entries of the auth providers named by `tokens`
    fn auth_providers(
        &self,
        stack: &str,
        tokens: &[PlaceholderToken],
    ) -> Result<BTreeMap<String, RegistryEntry>> {
        let mut providers: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        for token in tokens.iter().filter(|t| t.kind == TokenKind::Auth) {
            if providers.contains_key(&token.target) {
                continue;
            }
            let entry = self
                .registry
                .lookup(Namespace::Auth, &token.target)
                .map_err(|source| ConfigError::UnknownType {
                    stack: stack.to_string(),
                    source,
                })?;
            providers.insert(token.target.clone(), entry.clone());
        }
        Ok(providers)
    }

    fn check_placeholders(&self, run: &Run, credentials: &BTreeMap<String, String>) -> Result<()> {
        let pending: BTreeSet<String> = run.units.iter().map(|u| u.name.clone()).collect();
        let outputs = run.known_outputs();
        let ctx = self.context(run.preview, &outputs, &pending, credentials);
        let scope = |name: &str| run.merged.referenceable(name).is_some();

        let mut errors = Vec::new();
        for unit in &run.units {
            if let Err(e) = placeholder::resolve_document(&unit.config, &unit.base, &scope, &ctx) {
                errors.extend(e);
            }
        }
        if !run.units.iter().any(|u| u.kind == UnitKind::Stack)
            && let Err(e) = placeholder::resolve_document(&run.merged.config, "config", &scope, &ctx)
        {
            errors.extend(e);
        }

        if errors.is_empty() {
            return Ok(());
        }
        Err(self.placeholder_failure(&run.merged.name, errors))
    }

    fn placeholder_failure(&self, stack: &str, errors: Vec<PlaceholderError>) -> ProvisionError {
        let stack = stack.to_string();

        // Undeclared resource names are config errors
        if let Some(PlaceholderError::UnknownResource { field, resource }) = errors
            .iter()
            .find(|e| matches!(e, PlaceholderError::UnknownResource { .. }))
        {
            return ConfigError::UnknownResource {
                stack,
                resource: resource.clone(),
                field: field.clone(),
            }
            .into();
        }

        let missing: Vec<&str> = errors
            .iter()
            .filter_map(|e| match e {
                PlaceholderError::MissingSecret { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        if missing.len() == errors.len() {
            let names = missing.join(", ");
            let message = if self.secrets.is_none() {
                format!("no secrets are loaded (needed: {names})")
            } else {
                format!("missing secrets: {names}")
            };
            return ProvisionError::Secret { stack, message };
        }

        ProvisionError::UnresolvedPlaceholder { stack, errors }
    }

    /// Fetch every provider's credential not already in `credentials`
    async fn fetch_credentials(
        &self,
        key: &StateKey,
        operation: Operation,
        auth: &Mapping,
        providers: &BTreeMap<String, RegistryEntry>,
        token: &CancelToken,
        credentials: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let stack = &key.stack;

        for (name, entry) in providers {
            if credentials.contains_key(name) {
                continue;
            }
            let Some(provider) = entry.auth_provider() else {
                continue;
            };
            let config = auth.get(name).cloned().unwrap_or_else(Document::map);
            entry.decode(&config).map_err(|source| ConfigError::Decode {
                stack: stack.clone(),
                target: format!("auth.{name}"),
                source,
            })?;

            let call = format!("auth {name}");
            let credential = call_with_retry(
                &call,
                CallKind::Query,
                &self.options.retry,
                self.options.call_timeout,
                Some(token),
                || provider.credential(&config),
            )
            .await
            .map_err(|err| match err {
                CallError::Driver(source) => ProvisionError::Auth {
                    stack: stack.clone(),
                    provider: name.clone(),
                    source,
                },
                CallError::Cancelled => ProvisionError::Cancelled {
                    stack: key.stack.clone(),
                    environment: key.environment.clone(),
                    report: Box::new(ProvisionReport::new(key, operation, false)),
                },
            })?;

            debug!(provider = %name, expires_at = ?credential.expires_at, "Fetched credential");
            credentials.insert(name.clone(), credential.token);
        }
        Ok(())
    }

    async fn execute(
        &self,
        run: &Run,
        credentials: &BTreeMap<String, String>,
        lock: Option<&LockInfo>,
        token: &CancelToken,
    ) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::new(&run.key, run.operation, run.preview);
        report.version = run.version.clone();
        let unit_names: BTreeSet<String> = run.units.iter().map(|u| u.name.clone()).collect();
        let mut outputs = run.known_outputs();
        let mut applying = false;

        for (index, unit) in run.units.iter().enumerate() {
            if self.is_cancelled(&run.key, lock, token).await? {
                return self
                    .abort_cancelled(run, lock, report, &run.units[index..])
                    .await;
            }

            let planned = self
                .plan_unit(run, unit, &outputs, credentials, token)
                .await;
            let Planned {
                desired,
                changeset,
                sensitive,
            } = match planned {
                Ok(planned) => planned,
                Err(UnitFailure::Cancelled) => {
                    return self
                        .abort_cancelled(run, lock, report, &run.units[index..])
                        .await;
                }
                Err(UnitFailure::Failed { message, changeset }) => {
                    return self
                        .abort_failed(run, lock, report, index, message, changeset)
                        .await;
                }
            };

            let shown = Changeset {
                desired: desired.redacted.clone(),
                ..changeset.clone()
            };
            let entry = UnitReport::new(&unit.name, &unit.type_key, unit.kind, UnitStatus::Planned)
                .with_changeset(shown.clone());

            let Some(lock) = lock else {
                report.push(entry);
                continue;
            };

            let current = run.current.resources.get(&unit.name);
            let unit_outputs = match current {
                Some(applied) if !changeset.has_changes => {
                    debug!(resource = %unit.name, "No changes");
                    applied.outputs.clone()
                }
                _ => {
                    if !applying {
                        self.update_state(&run.key, &lock.id, |s| {
                            s.status = ProvisionStatus::Applying;
                        })
                        .await?;
                        applying = true;
                    }

                    info!(resource = %unit.name, summary = %changeset.summary(), "Applying");
                    let operation = format!("apply {}", unit.name);
                    let applied = call_with_retry(
                        &operation,
                        CallKind::Mutation,
                        &self.options.retry,
                        self.options.call_timeout,
                        None,
                        || unit.driver.apply(&changeset),
                    )
                    .await;
                    match applied {
                        // Drivers may echo substituted secrets back
                        Ok(outputs) => sensitive.mask_outputs(&outputs),
                        Err(err) => {
                            let message = match err {
                                CallError::Driver(e) => e.to_string(),
                                CallError::Cancelled => "cancelled".to_string(),
                            };
                            return self
                                .abort_failed(run, Some(lock), report, index, message, Some(shown))
                                .await;
                        }
                    }
                }
            };

            let mut record = AppliedResource::new(
                &unit.name,
                &unit.type_key,
                &unit.owner,
                unit.kind,
                desired.redacted.clone(),
            );
            record.outputs = unit_outputs.clone();
            record.secret_digest = desired.secret_digest.clone();
            record.template = unit
                .config
                .any_str(&|s| placeholder::contains_placeholder(s))
                .then(|| unit.config.clone());
            record.depends_on = unit
                .deps
                .iter()
                .filter(|d| unit_names.contains(*d))
                .cloned()
                .collect();
            self.update_state(&run.key, &lock.id, |s| s.set_resource(record.clone()))
                .await?;

            outputs.insert(unit.name.clone(), unit_outputs);
            report.push(UnitReport {
                status: UnitStatus::Succeeded,
                ..entry
            });
        }

        report.config = self.final_config(run, &outputs, credentials);
        if let Some(lock) = lock {
            self.finish(&run.key, lock, ProvisionStatus::Succeeded, run.version.clone())
                .await?;
        }
        info!(key = %run.key, summary = %report.summary(), preview = run.preview, "Run finished");
        Ok(report)
    }

    async fn plan_unit(
        &self,
        run: &Run,
        unit: &Unit,
        outputs: &BTreeMap<String, Outputs>,
        credentials: &BTreeMap<String, String>,
        token: &CancelToken,
    ) -> std::result::Result<Planned, UnitFailure> {
        let pending = BTreeSet::new();
        let ctx = self.context(run.preview, outputs, &pending, credentials);
        let scope = |name: &str| run.merged.referenceable(name).is_some();
        let resolved = placeholder::resolve_document(&unit.config, &unit.base, &scope, &ctx)
            .map_err(|errors| UnitFailure::Failed {
                message: errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
                changeset: None,
            })?;
        let current = run.current.resources.get(&unit.name);
        let sensitive = resolved.sensitive_values;

        if !resolved.deferred.is_empty() {
            // Preview with unapplied references: the provider would decode markers
            let desired = DesiredResource {
                name: unit.name.clone(),
                type_key: unit.type_key.clone(),
                owner: unit.owner.clone(),
                kind: unit.kind,
                config: resolved.value,
                redacted: resolved.redacted,
                secret_digest: resolved.secret_digest,
                typed: Arc::new(()),
            };
            let changeset = Changeset::diff(&desired, current);
            return Ok(Planned {
                desired,
                changeset,
                sensitive,
            });
        }

        let typed = unit
            .entry
            .decode(&resolved.value)
            .map_err(|e| UnitFailure::Failed {
                message: format!("invalid config: {e}"),
                changeset: None,
            })?;
        let desired = DesiredResource {
            name: unit.name.clone(),
            type_key: unit.type_key.clone(),
            owner: unit.owner.clone(),
            kind: unit.kind,
            config: resolved.value,
            redacted: resolved.redacted,
            secret_digest: resolved.secret_digest,
            typed,
        };

        let operation = format!("plan {}", unit.name);
        let changeset = call_with_retry(
            &operation,
            CallKind::Query,
            &self.options.retry,
            self.options.call_timeout,
            Some(token),
            || unit.driver.plan(&desired, current),
        )
        .await?;
        debug!(resource = %unit.name, summary = %changeset.summary(), "Planned");
        Ok(Planned {
            desired,
            changeset,
            sensitive,
        })
    }

    fn final_config(
        &self,
        run: &Run,
        outputs: &BTreeMap<String, Outputs>,
        credentials: &BTreeMap<String, String>,
    ) -> Document {
        let pending = BTreeSet::new();
        let ctx = self.context(run.preview, outputs, &pending, credentials);
        match placeholder::resolve(&run.merged, &ctx) {
            Ok(substituted) => substituted.redacted().config,
            Err(errors) => {
                debug!(errors = errors.len(), "Stack config not fully resolvable");
                Document::map()
            }
        }
    }

    async fn abort_failed(
        &self,
        run: &Run,
        lock: Option<&LockInfo>,
        mut report: ProvisionReport,
        index: usize,
        message: String,
        changeset: Option<Changeset>,
    ) -> Result<ProvisionReport> {
        let unit = &run.units[index];
        warn!(resource = %unit.name, error = %message, "Unit failed");

        let mut entry = UnitReport::new(
            &unit.name,
            &unit.type_key,
            unit.kind,
            UnitStatus::Failed {
                message: message.clone(),
            },
        );
        entry.changeset = changeset;
        report.push(entry);
        skip_rest(&mut report, &run.units[index + 1..], &format!("{} failed", unit.name));

        if let Some(lock) = lock {
            self.finish(&run.key, lock, ProvisionStatus::Failed, None)
                .await?;
        }
        Err(ProvisionError::Apply {
            stack: run.key.stack.clone(),
            environment: run.key.environment.clone(),
            resource: unit.name.clone(),
            message,
            report: Box::new(report),
        })
    }

    async fn abort_cancelled(
        &self,
        run: &Run,
        lock: Option<&LockInfo>,
        mut report: ProvisionReport,
        rest: &[Unit],
    ) -> Result<ProvisionReport> {
        info!(key = %run.key, remaining = rest.len(), "Run cancelled");
        skip_rest(&mut report, rest, "cancelled");
        if let Some(lock) = lock {
            self.finish(&run.key, lock, ProvisionStatus::Cancelled, None)
                .await?;
        }
        Err(ProvisionError::Cancelled {
            stack: run.key.stack.clone(),
            environment: run.key.environment.clone(),
            report: Box::new(report),
        })
    }

    // ---------------------------------------------------------------------
    // destroy

    async fn destroy_key(
        &self,
        key: StateKey,
        operation: Operation,
        preview: bool,
    ) -> Result<ProvisionReport> {
        let signal = self.signals.register(&key);
        let snapshot = self.state.load(&key).await?;
        let mut report = ProvisionReport::new(&key, operation, preview);

        if preview {
            for (applied, _) in self.destroy_order(&key, &snapshot)? {
                report.push(
                    UnitReport::new(&applied.name, &applied.type_key, applied.kind, UnitStatus::Planned)
                        .with_changeset(Changeset::delete(&applied)),
                );
            }
            return Ok(report);
        }

        let mut credentials = BTreeMap::new();
        let mut targets = self
            .destroy_targets(&key, operation, &snapshot, &mut credentials, signal.token())
            .await?;
        if targets.is_empty() {
            return Ok(report);
        }

        let (lock, locked) = self.acquire_lock(&key, operation).await?;
        if locked.resources != snapshot.resources {
            debug!(%key, "State changed before the lock, recomputing targets");
            let recomputed = self
                .destroy_targets(&key, operation, &locked, &mut credentials, signal.token())
                .await;
            targets = match recomputed {
                Ok(targets) => targets,
                Err(err) => {
                    self.finish(&key, &lock, ProvisionStatus::Failed, None)
                        .await?;
                    return Err(err);
                }
            };
        }

        for (index, target) in targets.iter().enumerate() {
            let applied = &target.applied;
            if self.is_cancelled(&key, Some(&lock), signal.token()).await? {
                for rest in targets[index..].iter().map(|t| &t.applied) {
                    report.push(UnitReport::new(
                        &rest.name,
                        &rest.type_key,
                        rest.kind,
                        UnitStatus::Skipped {
                            reason: "cancelled".to_string(),
                        },
                    ));
                }
                self.finish(&key, &lock, ProvisionStatus::Cancelled, None)
                    .await?;
                return Err(ProvisionError::Cancelled {
                    stack: key.stack.clone(),
                    environment: key.environment.clone(),
                    report: Box::new(report),
                });
            }

            if index == 0 {
                self.update_state(&key, &lock.id, |s| s.status = ProvisionStatus::Applying)
                    .await?;
            }

            let changeset = Changeset::delete(applied);
            if let Some(driver) = &target.driver {
                info!(resource = %applied.name, "Destroying");
                let operation = format!("destroy {}", applied.name);
                let destroyed = call_with_retry(
                    &operation,
                    CallKind::Mutation,
                    &self.options.retry,
                    self.options.call_timeout,
                    None,
                    || driver.destroy(&target.resolved),
                )
                .await;
                if let Err(CallError::Driver(err)) = destroyed {
                    let message = err.to_string();
                    warn!(resource = %applied.name, error = %message, "Destroy failed");
                    report.push(
                        UnitReport::new(
                            &applied.name,
                            &applied.type_key,
                            applied.kind,
                            UnitStatus::Failed {
                                message: message.clone(),
                            },
                        )
                        .with_changeset(changeset),
                    );
                    for rest in targets[index + 1..].iter().map(|t| &t.applied) {
                        report.push(UnitReport::new(
                            &rest.name,
                            &rest.type_key,
                            rest.kind,
                            UnitStatus::Skipped {
                                reason: format!("{} failed", applied.name),
                            },
                        ));
                    }
                    self.finish(&key, &lock, ProvisionStatus::Failed, None)
                        .await?;
                    return Err(ProvisionError::Apply {
                        stack: key.stack.clone(),
                        environment: key.environment.clone(),
                        resource: applied.name.clone(),
                        message,
                        report: Box::new(report),
                    });
                }
            }

            self.update_state(&key, &lock.id, |s| {
                s.remove_resource(&applied.name);
            })
            .await?;
            report.push(
                UnitReport::new(&applied.name, &applied.type_key, applied.kind, UnitStatus::Succeeded)
                    .with_changeset(changeset),
            );
        }

        self.finish(&key, &lock, ProvisionStatus::Succeeded, None)
            .await?;
        info!(%key, destroyed = report.succeeded().len(), "Destroy finished");
        Ok(report)
    }

    /// Recorded resources in reverse dependency order, with their drivers
    fn destroy_order(
        &self,
        key: &StateKey,
        state: &ProvisionState,
    ) -> Result<Vec<(AppliedResource, Option<Arc<dyn ResourceDriver>>)>> {
        let names: Vec<String> = state.resources.keys().cloned().collect();
        let deps: Dependencies = state
            .resources
            .iter()
            .map(|(name, r)| (name.clone(), r.depends_on.iter().cloned().collect()))
            .collect();
        let mut order = dependency_order(&names, &deps).map_err(|Cycle(cycle)| {
            ConfigError::CyclicReference {
                stack: key.stack.clone(),
                cycle,
            }
        })?;
        order.reverse();

        let mut targets = Vec::with_capacity(order.len());
        for name in &order {
            let Some(applied) = state.resources.get(name) else {
                continue;
            };
            let namespace = match applied.kind {
                UnitKind::Resource => Namespace::Resource,
                UnitKind::Stack => Namespace::Template,
            };
            let entry = self
                .registry
                .lookup(namespace, &applied.type_key)
                .map_err(|source| ConfigError::UnknownResourceType {
                    stack: key.stack.clone(),
                    resource: name.clone(),
                    source,
                })?;
            targets.push((applied.clone(), entry.resource_driver().cloned()));
        }
        Ok(targets)
    }

    /// Destroy order with every recorded template substituted again
    ///
    /// Outputs come from the record itself and from used resources of the
    /// stack's canonical environment. Credentials fetched once are reused.
    async fn destroy_targets(
        &self,
        key: &StateKey,
        operation: Operation,
        state: &ProvisionState,
        credentials: &mut BTreeMap<String, String>,
        token: &CancelToken,
    ) -> Result<Vec<DestroyTarget>> {
        let order = self.destroy_order(key, state)?;
        if order.iter().all(|(applied, _)| applied.template.is_none()) {
            return Ok(order
                .into_iter()
                .map(|(applied, driver)| DestroyTarget {
                    resolved: applied.clone(),
                    applied,
                    driver,
                })
                .collect());
        }

        // The stack may be gone from the project; its record still destroys
        let canonical_env = key.base_environment();
        let merged =
            inheritance::resolve_for_environment(&key.stack, canonical_env, &self.stacks).ok();
        let mut outputs = state.outputs();
        let mut auth = Mapping::new();
        if let Some(merged) = &merged {
            outputs.extend(self.used_outputs(merged, canonical_env).await?);
            auth = merged.auth.clone();
        }

        let mut targets = Vec::with_capacity(order.len());
        for (applied, driver) in order {
            let resolved = match (&driver, &applied.template) {
                (Some(_), Some(template)) => {
                    let base = match applied.kind {
                        UnitKind::Resource => format!("resources.{}.config", applied.name),
                        UnitKind::Stack => "config".to_string(),
                    };
                    let tokens = placeholder::scan_document(template, &base);
                    let providers = self.auth_providers(&key.stack, &tokens)?;
                    self.fetch_credentials(key, operation, &auth, &providers, token, credentials)
                        .await?;
                    let config = self.substitute_recorded(
                        &key.stack,
                        &applied,
                        template,
                        &base,
                        &outputs,
                        credentials,
                    )?;
                    AppliedResource {
                        config,
                        ..applied.clone()
                    }
                }
                _ => applied.clone(),
            };
            targets.push(DestroyTarget {
                applied,
                resolved,
                driver,
            });
        }
        Ok(targets)
    }

    /// Substitute a recorded template; references that no longer resolve keep
    /// the value recorded at apply time
    fn substitute_recorded(
        &self,
        stack: &str,
        applied: &AppliedResource,
        template: &Document,
        base: &str,
        outputs: &BTreeMap<String, Outputs>,
        credentials: &BTreeMap<String, String>,
    ) -> Result<Document> {
        let pending = BTreeSet::new();
        let ctx = self.context(true, outputs, &pending, credentials);
        let resolved = placeholder::resolve_document(template, base, &|_: &str| true, &ctx)
            .map_err(|errors| self.placeholder_failure(stack, errors))?;
        if resolved.deferred.is_empty() {
            return Ok(resolved.value);
        }

        debug!(
            resource = %applied.name,
            deferred = resolved.deferred.len(),
            "Keeping recorded values for unresolved references"
        );
        Ok(resolved.value.map_strings("", &mut |path, value| {
            match applied.config.pointer(path) {
                Some(recorded) if value.contains("<pending:") => recorded.clone(),
                _ => Document::String(value.to_string()),
            }
        }))
    }

    // ---------------------------------------------------------------------
    // state

    /// Take the lock with a compare-and-swap from Idle or a terminal status
    ///
    /// Returns the record as written, which every later decision of the run
    /// must be based on.
    async fn acquire_lock(
        &self,
        key: &StateKey,
        operation: Operation,
    ) -> Result<(LockInfo, ProvisionState)> {
        for _ in 0..CAS_ATTEMPTS {
            let mut state = self.state.load(key).await?;
            if let Some(held) = state.lock.as_ref().filter(|_| state.status.is_active()) {
                if !held.is_stale(self.options.lock_ttl) {
                    return Err(ProvisionError::Conflict {
                        stack: key.stack.clone(),
                        environment: key.environment.clone(),
                        owner: held.owner.clone(),
                        operation: held.operation,
                        acquired_at: held.acquired_at,
                    });
                }
                warn!(
                    %key,
                    owner = %held.owner,
                    operation = %held.operation,
                    acquired_at = %held.acquired_at,
                    "Taking over stale lock"
                );
            }

            let lock = LockInfo::new(&self.options.owner, operation);
            let expected = state.revision;
            state.status = ProvisionStatus::Planning;
            state.lock = Some(lock.clone());
            state.cancel_requested = false;
            if self.state.compare_and_swap(key, expected, &state).await? {
                debug!(%key, %operation, lock = %lock.id, "Acquired lock");
                state.revision = expected + 1;
                return Ok((lock, state));
            }
        }
        Err(StateError::Contention(key.to_string()).into())
    }

    /// Read-modify-write under the lock
    async fn update_state<F>(
        &self,
        key: &StateKey,
        lock_id: &str,
        mut mutate: F,
    ) -> std::result::Result<ProvisionState, StateError>
    where
        F: FnMut(&mut ProvisionState),
    {
        for _ in 0..CAS_ATTEMPTS {
            let mut state = self.state.load(key).await?;
            if !state.is_locked_by(lock_id) {
                return Err(StateError::LockLost(key.to_string()));
            }
            let expected = state.revision;
            mutate(&mut state);
            if self.state.compare_and_swap(key, expected, &state).await? {
                state.revision = expected + 1;
                return Ok(state);
            }
        }
        Err(StateError::Contention(key.to_string()))
    }

    /// Record the terminal status and release the lock
    async fn finish(
        &self,
        key: &StateKey,
        lock: &LockInfo,
        status: ProvisionStatus,
        version: Option<String>,
    ) -> std::result::Result<(), StateError> {
        self.update_state(key, &lock.id, |s| {
            s.status = status;
            s.lock = None;
            s.cancel_requested = false;
            if status == ProvisionStatus::Succeeded {
                if version.is_some() {
                    s.last_applied_version = version.clone();
                } else if s.resources.is_empty() {
                    s.last_applied_version = None;
                }
            }
        })
        .await?;
        debug!(%key, %status, "Released lock");
        Ok(())
    }

    async fn is_cancelled(
        &self,
        key: &StateKey,
        lock: Option<&LockInfo>,
        token: &CancelToken,
    ) -> std::result::Result<bool, StateError> {
        if token.is_cancelled() {
            return Ok(true);
        }
        if lock.is_none() {
            return Ok(false);
        }
        Ok(self.state.load(key).await?.cancel_requested)
    }
}

fn order_units(stack: &str, units: Vec<Unit>) -> Result<Vec<Unit>> {
    let names: Vec<String> = units.iter().map(|u| u.name.clone()).collect();
    let deps: Dependencies = units
        .iter()
        .map(|u| (u.name.clone(), u.deps.clone()))
        .collect();
    let order = dependency_order(&names, &deps).map_err(|Cycle(cycle)| {
        ConfigError::CyclicReference {
            stack: stack.to_string(),
            cycle,
        }
    })?;

    let mut by_name: HashMap<String, Unit> =
        units.into_iter().map(|u| (u.name.clone(), u)).collect();
    Ok(order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect())
}

fn skip_rest(report: &mut ProvisionReport, rest: &[Unit], reason: &str) {
    for unit in rest {
        report.push(UnitReport::new(
            &unit.name,
            &unit.type_key,
            unit.kind,
            UnitStatus::Skipped {
                reason: reason.to_string(),
            },
        ));
    }
}
