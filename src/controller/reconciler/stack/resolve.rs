//! Dependency resolution for a Stack: backend, credentials, and every referenced Module.
//!
//! A missing or not-yet-usable dependency is a [`Failure`]; store errors other than `NotFound`
//! propagate. Everything is looked up again on every attempt, so a dependency created after
//! the Stack is picked up by the next retry.
//!
//! A referenced BackendConfig is validated in place with the same rules its own reconciler
//! applies. Its Ready condition is not consulted.

use super::StackError;
use super::variables::is_identifier;
use crate::controller::reconciler::backend_config::{
    check_secret_keys, parse_settings, resolve_cloud_credentials, validate_spec,
};
use crate::controller::reconciler::types::{Failure, Reconciler};
use crate::crd::{CredentialKind, Module, Stack, StackModule};
use crate::store::object_key;
use k8s_openapi::api::core::v1::Secret;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Backend block inputs
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBackend {
    pub r#type: String,
    pub settings: Map<String, Value>,
}

/// A stack module instance together with the Module it instantiates
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub instance: StackModule,
    pub module: Module,
}

impl ResolvedModule {
    pub fn name(&self) -> &str {
        &self.instance.name
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedStack {
    pub backend: ResolvedBackend,
    /// Environment for every step: backend credentials first, then Stack credentials
    pub env: BTreeMap<String, String>,
    pub modules: Vec<ResolvedModule>,
}

pub async fn resolve_stack(ctx: &Reconciler, stack: &Stack) -> Result<ResolvedStack, StackError> {
    let (backend, env) = resolve_environment(ctx, stack).await?;
    let modules = resolve_modules(ctx, stack).await?;

    debug!(
        backend_type = backend.r#type.as_str(),
        modules = modules.len(),
        env_keys = env.len(),
        "stack dependencies resolved"
    );
    Ok(ResolvedStack {
        backend,
        env,
        modules,
    })
}

/// Backend and step environment; everything a destroy needs besides the rendered workspace
pub async fn resolve_environment(
    ctx: &Reconciler,
    stack: &Stack,
) -> Result<(ResolvedBackend, BTreeMap<String, String>), StackError> {
    let (namespace, _) = object_key(stack);
    let mut env = BTreeMap::new();
    let backend = resolve_backend(ctx, stack, &namespace, &mut env).await?;
    resolve_credentials(ctx, stack, &namespace, &mut env).await?;
    Ok((backend, env))
}

async fn resolve_backend(
    ctx: &Reconciler,
    stack: &Stack,
    namespace: &str,
    env: &mut BTreeMap<String, String>,
) -> Result<ResolvedBackend, StackError> {
    if let Some(inline) = stack.spec.backend_config.as_ref() {
        if inline.r#type.trim().is_empty() {
            return Err(Failure::new("MissingBackendConfig", "Inline backendConfig has no type").into());
        }
        let settings = parse_settings(inline.settings.as_ref()).map_err(|e| {
            Failure::new(
                "InvalidBackendConfig",
                format!("Failed to parse inline backend settings: {e}"),
            )
        })?;
        check_setting_keys(&settings, "inline backendConfig")?;
        return Ok(ResolvedBackend {
            r#type: inline.r#type.trim().to_string(),
            settings,
        });
    }

    let Some(reference) = stack.spec.backend_ref.as_ref().filter(|r| !r.name.is_empty()) else {
        return Err(Failure::new(
            "MissingBackendConfig",
            "Stack declares neither backendConfig nor backendRef",
        )
        .into());
    };

    let config = match ctx.stores.backend_configs.get(namespace, &reference.name).await {
        Ok(config) => config,
        Err(e) if e.is_not_found() => {
            return Err(Failure::new(
                "MissingBackendConfig",
                format!("BackendConfig {} not found in namespace {namespace}", reference.name),
            )
            .into());
        }
        Err(e) => return Err(e.into()),
    };
    // Ready is not consulted; settings and credentials are checked on every attempt
    let settings = validate_spec(&config).map_err(|failure| {
        Failure::new(
            "InvalidBackendConfig",
            format!("BackendConfig {}: {}", reference.name, failure.message),
        )
    })?;
    check_setting_keys(&settings, &format!("BackendConfig {}", reference.name))?;

    if let Some(credential_ref) = config.spec.credential_ref.as_ref() {
        let secret = resolve_cloud_credentials(
            ctx.stores.cloud_credentials.as_ref(),
            ctx.stores.secrets.as_ref(),
            namespace,
            &credential_ref.name,
        )
        .await??;
        check_secret_keys(config.spec.r#type.trim(), &secret)?;
        env.extend(secret_env(&secret));
    }

    Ok(ResolvedBackend {
        r#type: config.spec.r#type.trim().to_string(),
        settings,
    })
}

/// Setting names become attribute names in `backend.tf`, so they must be plain identifiers
fn check_setting_keys(settings: &Map<String, Value>, origin: &str) -> Result<(), Failure> {
    match settings.keys().find(|key| !is_identifier(key)) {
        Some(bad) => Err(Failure::new(
            "InvalidBackendConfig",
            format!("{origin}: setting name {bad:?} is not a valid identifier"),
        )),
        None => Ok(()),
    }
}

async fn resolve_credentials(
    ctx: &Reconciler,
    stack: &Stack,
    namespace: &str,
    env: &mut BTreeMap<String, String>,
) -> Result<(), StackError> {
    let Some(reference) = stack.spec.credential_ref.as_ref().filter(|r| !r.name.is_empty()) else {
        return Ok(());
    };

    let secret = match reference.kind {
        CredentialKind::Secret => match ctx.stores.secrets.get(namespace, &reference.name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                return Err(Failure::new(
                    "MissingCredential",
                    format!("Secret {} not found in namespace {namespace}", reference.name),
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        },
        CredentialKind::CloudCredentials => resolve_cloud_credentials(
            ctx.stores.cloud_credentials.as_ref(),
            ctx.stores.secrets.as_ref(),
            namespace,
            &reference.name,
        )
        .await??,
    };
    env.extend(secret_env(&secret));
    Ok(())
}

pub async fn resolve_modules(
    ctx: &Reconciler,
    stack: &Stack,
) -> Result<Vec<ResolvedModule>, StackError> {
    let (namespace, _) = object_key(stack);
    let namespace = namespace.as_str();
    let mut resolved = Vec::with_capacity(stack.spec.modules.len());
    for instance in &stack.spec.modules {
        let module_name = instance.module_name();
        let module = match ctx.stores.modules.get(namespace, module_name).await {
            Ok(module) => module,
            Err(e) if e.is_not_found() => {
                return Err(Failure::new(
                    "MissingModule",
                    format!("Module {module_name} not found in namespace {namespace}"),
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        if !module.status.as_ref().is_some_and(|s| s.is_populated()) {
            return Err(Failure::new(
                "ModuleUnpopulated",
                format!("Module {module_name} has not published its inputs yet"),
            )
            .into());
        }
        resolved.push(ResolvedModule {
            instance: instance.clone(),
            module,
        });
    }
    Ok(resolved)
}

/// Secret data as environment variables; `stringData` wins over `data`
pub(crate) fn secret_env(secret: &Secret) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(key, value)| (key.clone(), String::from_utf8_lossy(&value.0).into_owned()))
        .collect();
    env.extend(
        secret
            .string_data
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    env
}
