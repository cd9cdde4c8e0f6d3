//! In-process provider
//!
//! Executes components inside the node's own process space. Also the
//! reference realisation of the provider contract: capacity
//! accounting, idempotent deploys, and language gating live here in
//! their simplest form.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{FabricError, Result};
use crate::resources::{Capacity, CapabilityTags, ResourceInfo};
use crate::store::Language;

use super::{DeployRequest, Provider, ProviderKind, BUILD_LOCK};

struct Accounting {
    used: ResourceInfo,
    deployments: HashMap<String, ResourceInfo>,
}

/// A provider backed by the local process
pub struct InProcessProvider {
    id: String,
    name: String,
    total: ResourceInfo,
    tags: CapabilityTags,
    languages: Vec<Language>,
    build_command: Option<Vec<String>>,
    accounting: RwLock<Accounting>,
}

impl InProcessProvider {
    /// Create a provider advertising the given resource envelope.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        total: ResourceInfo,
        tags: CapabilityTags,
        languages: Vec<Language>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            total,
            tags,
            languages,
            build_command: None,
            accounting: RwLock::new(Accounting { used: ResourceInfo::default(), deployments: HashMap::new() }),
        }
    }

    /// Configure an external build command run once per instance
    /// before it deploys (artefact compilation, image packing). The
    /// command runs under [`BUILD_LOCK`].
    pub fn with_build_command(mut self, command: Vec<String>) -> Self {
        self.build_command = Some(command);
        self
    }

    /// Number of live deployments
    pub async fn deployment_count(&self) -> usize {
        self.accounting.read().await.deployments.len()
    }

    async fn run_build(&self, instance_id: &str) -> Result<()> {
        let Some(command) = &self.build_command else {
            return Ok(());
        };
        let program = command
            .first()
            .ok_or_else(|| FabricError::not_configured("empty build command"))?;

        // External builders share one tool-chain lockfile.
        let _build = BUILD_LOCK.lock().await;
        debug!(provider = %self.id, instance = instance_id, builder = %program, "build started");
        let output = Command::new(program)
            .args(&command[1..])
            .output()
            .await
            .map_err(|e| FabricError::internal(format!("spawn {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FabricError::internal(format!(
                "build for {instance_id} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for InProcessProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Process
    }

    fn capability_tags(&self) -> CapabilityTags {
        self.tags
    }

    fn supported_languages(&self) -> Vec<Language> {
        self.languages.clone()
    }

    async fn capacity(&self) -> Result<Capacity> {
        let accounting = self.accounting.read().await;
        Ok(Capacity::new(self.total.clone(), accounting.used.clone()))
    }

    async fn real_time_usage(&self) -> Result<ResourceInfo> {
        Ok(self.accounting.read().await.used.clone())
    }

    async fn deploy(&self, request: DeployRequest) -> Result<()> {
        if !self.languages.contains(&request.language) {
            return Err(FabricError::unsupported(format!(
                "language {} on provider {}",
                request.language, self.id
            )));
        }

        {
            let accounting = self.accounting.read().await;
            if accounting.deployments.contains_key(&request.instance_id) {
                debug!(instance = %request.instance_id, "deploy replayed; keeping existing accounting");
                return Ok(());
            }
        }

        self.run_build(&request.instance_id).await?;

        let mut accounting = self.accounting.write().await;
        if accounting.deployments.contains_key(&request.instance_id) {
            debug!(instance = %request.instance_id, "deploy replayed; keeping existing accounting");
            return Ok(());
        }

        let available = self.total.minus(&accounting.used);
        if !available.fits(&request.resources) {
            return Err(FabricError::capacity_exhausted(format!(
                "provider {} cannot fit cpu={}m memory={}B gpu={}",
                self.id, request.resources.cpu, request.resources.memory, request.resources.gpu
            )));
        }

        accounting.used = accounting.used.plus(&request.resources);
        accounting.deployments.insert(request.instance_id.clone(), request.resources.clone());
        info!(provider = %self.id, instance = %request.instance_id, "component deployed");
        Ok(())
    }

    async fn undeploy(&self, component_id: &str) -> Result<()> {
        let mut accounting = self.accounting.write().await;
        if let Some(resources) = accounting.deployments.remove(component_id) {
            accounting.used = accounting.used.minus(&resources);
            info!(provider = %self.id, instance = %component_id, "component undeployed");
        } else {
            debug!(provider = %self.id, instance = %component_id, "undeploy for unknown component");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> InProcessProvider {
        InProcessProvider::new(
            "proc-0",
            "local process pool",
            ResourceInfo::new(4000, 8 * 1024 * 1024 * 1024, 0),
            CapabilityTags { cpu: true, memory: true, ..Default::default() },
            vec![Language::Json, Language::Python],
        )
    }

    fn request(instance: &str, cpu: i64) -> DeployRequest {
        DeployRequest {
            instance_id: instance.to_string(),
            language: Language::Python,
            resources: ResourceInfo::new(cpu, 512 * 1024 * 1024, 0),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn deploy_accounts_resources() {
        let p = provider();
        p.deploy(request("c1", 1000)).await.unwrap();
        let cap = p.capacity().await.unwrap();
        assert_eq!(cap.used.cpu, 1000);
        assert_eq!(cap.available.cpu, 3000);
    }

    #[tokio::test]
    async fn deploy_is_idempotent_per_instance() {
        let p = provider();
        p.deploy(request("c1", 1000)).await.unwrap();
        p.deploy(request("c1", 1000)).await.unwrap();
        assert_eq!(p.capacity().await.unwrap().used.cpu, 1000);
        assert_eq!(p.deployment_count().await, 1);
    }

    #[tokio::test]
    async fn over_commit_is_rejected() {
        let p = provider();
        let err = p.deploy(request("c1", 8000)).await.unwrap_err();
        assert!(err.is_capacity_exhausted());
    }

    #[tokio::test]
    async fn unsupported_language_fails_fast() {
        let p = provider();
        let mut req = request("c1", 100);
        req.language = Language::Go;
        let err = p.deploy(req).await.unwrap_err();
        assert!(matches!(err, FabricError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn undeploy_releases_and_tolerates_unknowns() {
        let p = provider();
        p.deploy(request("c1", 1000)).await.unwrap();
        p.undeploy("c1").await.unwrap();
        p.undeploy("c1").await.unwrap();
        assert_eq!(p.capacity().await.unwrap().used.cpu, 0);
    }

    #[tokio::test]
    async fn failed_builds_abort_the_deploy() {
        let p = provider().with_build_command(vec!["false".to_string()]);
        let err = p.deploy(request("c1", 1000)).await.unwrap_err();
        assert!(matches!(err, FabricError::Internal { .. }));
        assert_eq!(p.deployment_count().await, 0);
        assert_eq!(p.capacity().await.unwrap().used.cpu, 0);
    }

    #[tokio::test]
    async fn builds_wait_for_the_global_build_lock() {
        use std::sync::Arc;
        use std::time::Duration;

        let p = Arc::new(provider().with_build_command(vec!["true".to_string()]));

        let guard = crate::provider::BUILD_LOCK.lock().await;
        let deploy = {
            let p = p.clone();
            tokio::spawn(async move { p.deploy(request("c1", 1000)).await })
        };

        // The build cannot start while another builder holds the
        // tool-chain lock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!deploy.is_finished());

        drop(guard);
        deploy.await.unwrap().unwrap();
        assert_eq!(p.deployment_count().await, 1);
        assert_eq!(p.capacity().await.unwrap().used.cpu, 1000);
    }
}
