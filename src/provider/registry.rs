//! Provider registry
//!
//! Owns the binding state of every local provider: which ID is bound,
//! when the last health check arrived, and whether the binding has
//! gone stale. Capacity reported upward is health-gated; a provider
//! whose binding expired contributes zeros until it reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{FabricError, Result};
use crate::resources::{Capacity, CapabilityTags, ResourceInfo};
use crate::store::Language;

use super::{ConnectAck, DeployRequest, HealthReport, Provider, ProviderInfo, ProviderStatus};

/// Interval of the staleness sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Operator-facing events emitted by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A binding was cleared because health checks stopped arriving
    BindingExpired {
        /// Provider whose binding was cleared
        provider_id: String,
    },
}

struct Binding {
    token: String,
    last_health: Instant,
}

/// A provider plus its binding state.
pub struct ProviderHandle {
    provider: Arc<dyn Provider>,
    binding: RwLock<Option<Binding>>,
}

impl ProviderHandle {
    fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider, binding: RwLock::new(None) }
    }

    /// The wrapped provider
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Whether a live binding exists
    pub fn is_connected(&self) -> bool {
        self.binding.read().is_some()
    }

    fn authorize(&self, token: &str) -> Result<()> {
        match self.binding.read().as_ref() {
            Some(binding) if binding.token == token => Ok(()),
            Some(_) => Err(FabricError::unauthorized(format!(
                "token mismatch for provider {}",
                self.provider.id()
            ))),
            None => Err(FabricError::unauthorized(format!(
                "provider {} is not connected",
                self.provider.id()
            ))),
        }
    }

    /// Bind the provider under `desired_id`. Fails when a different ID
    /// already holds the binding; re-connecting under the same ID
    /// refreshes it.
    pub fn connect(&self, desired_id: &str) -> Result<ConnectAck> {
        let mut binding = self.binding.write();
        if let Some(existing) = binding.as_ref() {
            if existing.token != desired_id {
                return Err(FabricError::conflict(format!(
                    "provider {} already bound to {}",
                    self.provider.id(),
                    existing.token
                )));
            }
        }
        *binding = Some(Binding { token: desired_id.to_string(), last_health: Instant::now() });
        Ok(ConnectAck {
            kind: self.provider.kind(),
            supported_languages: self.provider.supported_languages(),
        })
    }

    /// Health check: authenticates, resets the staleness timer, and
    /// reports the current capacity view.
    pub async fn health_check(&self, token: &str) -> Result<HealthReport> {
        self.authorize(token)?;
        let capacity = self.provider.capacity().await?;
        if let Some(binding) = self.binding.write().as_mut() {
            binding.last_health = Instant::now();
        }
        Ok(HealthReport {
            capacity,
            capability_tags: self.provider.capability_tags(),
            supported_languages: self.provider.supported_languages(),
        })
    }

    /// Raw capacity probe; allowed pre-connect.
    pub async fn get_capacity(&self) -> Result<Capacity> {
        self.provider.capacity().await
    }

    /// Raw available-resources probe; allowed pre-connect.
    pub async fn get_available(&self) -> Result<ResourceInfo> {
        Ok(self.provider.capacity().await?.available)
    }

    /// Health-gated capacity: zeros unless a live binding exists.
    pub async fn reported_capacity(&self) -> Capacity {
        if !self.is_connected() {
            return Capacity::default();
        }
        self.provider.capacity().await.unwrap_or_default()
    }

    /// Instantaneous usage, best-effort.
    pub async fn get_real_time_usage(&self, token: &str) -> Result<ResourceInfo> {
        self.authorize(token)?;
        self.provider.real_time_usage().await
    }

    /// Authenticated deploy
    pub async fn deploy(&self, token: &str, request: DeployRequest) -> Result<()> {
        self.authorize(token)?;
        self.provider.deploy(request).await
    }

    /// Authenticated undeploy
    pub async fn undeploy(&self, token: &str, component_id: &str) -> Result<()> {
        self.authorize(token)?;
        self.provider.undeploy(component_id).await
    }

    /// Clear the binding
    pub fn disconnect(&self, token: &str) -> Result<()> {
        self.authorize(token)?;
        *self.binding.write() = None;
        Ok(())
    }

    /// Clear the binding when no health check arrived within `ttl`.
    /// Returns true when a binding was cleared.
    fn sweep_stale(&self, ttl: Duration) -> bool {
        let mut binding = self.binding.write();
        match binding.as_ref() {
            Some(b) if b.last_health.elapsed() > ttl => {
                *binding = None;
                true
            }
            _ => false,
        }
    }

    /// Snapshot for listings
    pub async fn info(&self, include_resources: bool) -> ProviderInfo {
        let status = if self.is_connected() { ProviderStatus::Connected } else { ProviderStatus::Disconnected };
        let capacity = if include_resources { Some(self.reported_capacity().await) } else { None };
        ProviderInfo {
            id: self.provider.id().to_string(),
            name: self.provider.name().to_string(),
            kind: self.provider.kind(),
            status,
            capability_tags: self.provider.capability_tags(),
            capacity,
            supported_languages: self.provider.supported_languages(),
        }
    }
}

/// All providers registered on this node.
pub struct ProviderRegistry {
    handles: RwLock<HashMap<String, Arc<ProviderHandle>>>,
    health_ttl: Duration,
    events_tx: mpsc::UnboundedSender<ProviderEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ProviderEvent>>>,
}

impl ProviderRegistry {
    /// Create a registry with the given staleness TTL.
    pub fn new(health_ttl: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            handles: RwLock::new(HashMap::new()),
            health_ttl,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Take the operator event stream; yields once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>> {
        self.events_rx.lock().take()
    }

    /// Register a provider, returning its handle.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Arc<ProviderHandle> {
        let handle = Arc::new(ProviderHandle::new(provider.clone()));
        self.handles.write().insert(provider.id().to_string(), handle.clone());
        info!(provider = %provider.id(), "provider registered");
        handle
    }

    /// Handle for a provider ID
    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderHandle>> {
        self.handles.read().get(provider_id).cloned()
    }

    /// All handles, id-keyed
    pub fn handles(&self) -> Vec<(String, Arc<ProviderHandle>)> {
        self.handles.read().iter().map(|(id, h)| (id.clone(), h.clone())).collect()
    }

    /// Handles with a live binding
    pub fn connected(&self) -> Vec<(String, Arc<ProviderHandle>)> {
        self.handles
            .read()
            .iter()
            .filter(|(_, h)| h.is_connected())
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect()
    }

    /// Listing snapshot
    pub async fn list(&self, include_resources: bool) -> Vec<ProviderInfo> {
        let handles = self.handles();
        let mut infos = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            infos.push(handle.info(include_resources).await);
        }
        infos
    }

    /// Pick the connected provider with the most headroom that fits
    /// `request` and supports `language`.
    pub async fn find_for_request(
        &self,
        request: &ResourceInfo,
        language: Option<Language>,
    ) -> Result<(String, ResourceInfo, Language)> {
        let mut best: Option<(String, ResourceInfo, Language, f64)> = None;
        for (id, handle) in self.connected() {
            let languages = handle.provider().supported_languages();
            let chosen = match language {
                Some(wanted) if languages.contains(&wanted) => wanted,
                Some(_) => continue,
                None => match languages.first() {
                    Some(first) => *first,
                    None => continue,
                },
            };
            let available = handle.reported_capacity().await.available;
            if !available.fits(request) {
                continue;
            }
            let score = available.availability_score();
            if best.as_ref().map(|(_, _, _, s)| score > *s).unwrap_or(true) {
                best = Some((id, available, chosen, score));
            }
        }

        best.map(|(id, available, lang, _)| (id, available, lang)).ok_or_else(|| {
            FabricError::capacity_exhausted(format!(
                "no connected provider fits cpu={}m memory={}B gpu={}",
                request.cpu, request.memory, request.gpu
            ))
        })
    }

    /// Component-wise sum of the health-gated capacities.
    pub async fn aggregate_capacity(&self) -> Capacity {
        let mut sum = Capacity::default();
        for (_, handle) in self.handles() {
            sum = sum.plus(&handle.reported_capacity().await);
        }
        sum
    }

    /// Union of all providers' capability bits.
    pub fn aggregate_tags(&self) -> CapabilityTags {
        self.handles
            .read()
            .values()
            .fold(CapabilityTags::default(), |acc, h| acc.union(&h.provider().capability_tags()))
    }

    /// Drive the staleness sweep until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("provider staleness sweep stopping");
                        return;
                    }
                }
            }
        }
    }

    fn sweep(&self) {
        for (id, handle) in self.handles() {
            if handle.sweep_stale(self.health_ttl) {
                warn!(provider = %id, "provider health checks stopped; binding cleared");
                let _ = self.events_tx.send(ProviderEvent::BindingExpired { provider_id: id });
            }
        }
    }

    /// Expose the sweep for tests and manual operation.
    #[doc(hidden)]
    pub fn sweep_now(&self) {
        self.sweep()
    }
}
