//! Dependency-ordered service startup and supervision.
//!
//! Services register with declared dependency names; the orchestrator
//! validates the graph is acyclic before anything starts, computes a
//! topological start order, brings services up strictly in that order
//! (each only after its dependencies are healthy) and then supervises
//! them: failing health checks degrade a service and trigger restarts
//! with exponential backoff, and a service that exhausts its restart
//! budget is marked failed and surfaced, never retried silently.

use crate::config::OrchestratorConfig;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors raised by registration and startup.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("service already registered: {0}")]
    DuplicateService(String),

    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    #[error("dependency cycle detected among: {0}")]
    DependencyCycle(String),

    #[error("service {service} failed to start: {source}")]
    StartFailed {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("service {service} did not become healthy after {attempts} checks")]
    NeverHealthy { service: String, attempts: u32 },

    #[error("orchestrator already started")]
    AlreadyStarted,
}

/// Lifecycle state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Registered,
    Starting,
    Healthy,
    Degraded,
    Failed,
}

/// A supervisable service.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);

    /// True when the service is operating normally.
    async fn health_check(&self) -> bool;
}

/// Restart behaviour for one service.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&OrchestratorConfig> for RestartPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            base_delay: config.restart_base_delay(),
            max_delay: config.restart_max_delay(),
        }
    }
}

/// Declared identity and dependencies of a service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub dependencies: Vec<String>,
    /// Overrides the orchestrator-wide restart policy when set.
    pub restart_policy: Option<RestartPolicy>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, dependencies: &[&str]) -> Self {
        Self {
            name: name.into(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            restart_policy: None,
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }
}

struct ServiceEntry {
    spec: ServiceSpec,
    service: Arc<dyn Service>,
    restarts: u32,
}

/// Registers services, validates the dependency DAG, starts everything in
/// topological order and supervises health.
pub struct ServiceOrchestrator {
    config: OrchestratorConfig,
    entries: RwLock<HashMap<String, ServiceEntry>>,
    registration_order: RwLock<Vec<String>>,
    states: RwLock<HashMap<String, ServiceState>>,
    start_order: RwLock<Vec<String>>,
    started: Mutex<bool>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: RwLock::new(HashMap::new()),
            registration_order: RwLock::new(Vec::new()),
            states: RwLock::new(HashMap::new()),
            start_order: RwLock::new(Vec::new()),
            started: Mutex::new(false),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        })
    }

    /// Register a service under its spec. Fails on duplicate names.
    pub fn register(
        &self,
        spec: ServiceSpec,
        service: Arc<dyn Service>,
    ) -> Result<(), OrchestratorError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&spec.name) {
            return Err(OrchestratorError::DuplicateService(spec.name.clone()));
        }
        self.registration_order.write().push(spec.name.clone());
        self.states
            .write()
            .insert(spec.name.clone(), ServiceState::Registered);
        entries.insert(
            spec.name.clone(),
            ServiceEntry {
                spec,
                service,
                restarts: 0,
            },
        );
        Ok(())
    }

    /// Current state of every registered service.
    pub fn status(&self) -> HashMap<String, ServiceState> {
        self.states.read().clone()
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.states.read().get(name).copied()
    }

    /// The computed start order; empty until `start_all` ran.
    pub fn start_order(&self) -> Vec<String> {
        self.start_order.read().clone()
    }

    pub fn all_healthy(&self) -> bool {
        let states = self.states.read();
        !states.is_empty() && states.values().all(|s| *s == ServiceState::Healthy)
    }

    /// Validate the dependency graph and compute a topological start
    /// order. Fails before any service starts if a dependency is unknown
    /// or the graph has a cycle.
    fn compute_start_order(&self) -> Result<Vec<String>, OrchestratorError> {
        let entries = self.entries.read();
        let registration_order = self.registration_order.read();

        for entry in entries.values() {
            for dependency in &entry.spec.dependencies {
                if !entries.contains_key(dependency) {
                    return Err(OrchestratorError::UnknownDependency {
                        service: entry.spec.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm, seeded in registration order for determinism.
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for entry in entries.values() {
            indegree.entry(entry.spec.name.as_str()).or_insert(0);
            for dependency in &entry.spec.dependencies {
                *indegree.entry(entry.spec.name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(entry.spec.name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = registration_order
            .iter()
            .map(|n| n.as_str())
            .filter(|n| indegree.get(n).copied() == Some(0))
            .collect();

        let mut order = Vec::new();
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            if let Some(children) = dependents.get(name) {
                for child in children {
                    let degree = indegree.get_mut(child).expect("child was registered");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if order.len() != entries.len() {
            let ordered: HashSet<&str> = order.iter().map(|n| n.as_str()).collect();
            let mut cyclic: Vec<&str> = entries
                .keys()
                .map(|n| n.as_str())
                .filter(|n| !ordered.contains(n))
                .collect();
            cyclic.sort_unstable();
            return Err(OrchestratorError::DependencyCycle(cyclic.join(", ")));
        }

        Ok(order)
    }

    /// Start every registered service in dependency order, then spawn the
    /// supervision loop.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(OrchestratorError::AlreadyStarted);
            }
            *started = true;
        }

        let order = self.compute_start_order()?;
        info!(order = ?order, "Service start order computed");
        *self.start_order.write() = order.clone();

        for name in &order {
            self.start_service(name).await?;
        }

        let supervisor = tokio::spawn(Self::supervise(self.clone()));
        *self.supervisor.lock() = Some(supervisor);

        info!(services = order.len(), "All services healthy");
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<(), OrchestratorError> {
        // Dependencies started earlier in the order; abort if any failed.
        {
            let entries = self.entries.read();
            let entry = entries.get(name).expect("service in start order");
            let states = self.states.read();
            for dependency in &entry.spec.dependencies {
                if states.get(dependency.as_str()).copied() != Some(ServiceState::Healthy) {
                    return Err(OrchestratorError::StartFailed {
                        service: name.to_string(),
                        source: anyhow::anyhow!("dependency {} is not healthy", dependency),
                    });
                }
            }
        }

        self.set_state(name, ServiceState::Starting);
        info!(service = name, "Starting service");

        let service = self.service_handle(name);
        if let Err(source) = service.start().await {
            self.set_state(name, ServiceState::Failed);
            return Err(OrchestratorError::StartFailed {
                service: name.to_string(),
                source,
            });
        }

        if self
            .await_healthy(name, self.config.startup_attempts, self.config.startup_base_delay())
            .await
        {
            self.set_state(name, ServiceState::Healthy);
            info!(service = name, "Service healthy");
            Ok(())
        } else {
            self.set_state(name, ServiceState::Failed);
            Err(OrchestratorError::NeverHealthy {
                service: name.to_string(),
                attempts: self.config.startup_attempts,
            })
        }
    }

    /// Poll a service's health check up to `attempts` times with linear
    /// backoff between polls.
    async fn await_healthy(&self, name: &str, attempts: u32, base_delay: Duration) -> bool {
        let service = self.service_handle(name);
        for attempt in 1..=attempts {
            if service.health_check().await {
                return true;
            }
            debug!(service = name, attempt, "Health check not passing yet");
            if attempt < attempts {
                tokio::time::sleep(base_delay * attempt).await;
            }
        }
        false
    }

    /// Stop every service in reverse start order and end supervision.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }

        let order = self.start_order.read().clone();
        for name in order.iter().rev() {
            info!(service = name, "Stopping service");
            self.service_handle(name).stop().await;
            self.set_state(name, ServiceState::Registered);
        }
        *self.started.lock() = false;
        info!("All services stopped");
    }

    async fn supervise(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval fires immediately; skip that first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let order = self.start_order.read().clone();
            for name in &order {
                let state = self.state_of(name);
                if !matches!(state, Some(ServiceState::Healthy | ServiceState::Degraded)) {
                    continue;
                }

                let service = self.service_handle(name);
                if service.health_check().await {
                    if state == Some(ServiceState::Degraded) {
                        info!(service = name.as_str(), "Service recovered");
                        self.set_state(name, ServiceState::Healthy);
                    }
                    continue;
                }

                self.handle_unhealthy(name).await;
            }
        }
    }

    /// Degrade a failing service and attempt a restart, within budget.
    async fn handle_unhealthy(&self, name: &str) {
        self.set_state(name, ServiceState::Degraded);

        let (restarts, policy) = {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(name).expect("supervised service exists");
            entry.restarts += 1;
            let policy = entry
                .spec
                .restart_policy
                .clone()
                .unwrap_or_else(|| RestartPolicy::from(&self.config));
            (entry.restarts, policy)
        };

        if restarts > policy.max_restarts {
            error!(
                service = name,
                restarts = restarts - 1,
                "Service exceeded restart budget, marking failed"
            );
            self.set_state(name, ServiceState::Failed);
            metrics::counter!("orchestrator.services.failed").increment(1);
            return;
        }

        let delay = restart_delay(policy.base_delay, policy.max_delay, restarts);
        warn!(
            service = name,
            attempt = restarts,
            delay_ms = delay.as_millis() as u64,
            "Service unhealthy, restarting"
        );
        metrics::counter!("orchestrator.services.restarted").increment(1);

        let service = self.service_handle(name);
        service.stop().await;
        tokio::time::sleep(delay).await;

        if let Err(e) = service.start().await {
            warn!(service = name, error = %e, "Restart failed");
            return;
        }
        if self
            .await_healthy(name, self.config.startup_attempts, self.config.startup_base_delay())
            .await
        {
            info!(service = name, "Service restarted");
            self.set_state(name, ServiceState::Healthy);
            if let Some(entry) = self.entries.write().get_mut(name) {
                entry.restarts = 0;
            }
        }
        // Still unhealthy: stays Degraded, the next tick tries again until
        // the restart budget runs out.
    }

    fn service_handle(&self, name: &str) -> Arc<dyn Service> {
        self.entries
            .read()
            .get(name)
            .expect("service is registered")
            .service
            .clone()
    }

    fn set_state(&self, name: &str, state: ServiceState) {
        self.states.write().insert(name.to_string(), state);
    }
}

fn restart_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(1024);
    (base * factor).min(max)
}
