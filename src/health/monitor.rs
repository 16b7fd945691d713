use chrono::{DateTime, Utc};
use kameo::error::Infallible;
use kameo::prelude::*;
use kameo::reply::ReplyError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{ComponentHealth, HealthStatus};
use crate::messaging::Broker;
use crate::metrics::Metrics;
use crate::utils::CircuitState;

// ============================================================================
// Health Monitor Actor
// ============================================================================
//
// - Keeps the last reported status of every component
// - Polls broker circuit breakers on an interval and mirrors the state
//   into the circuit breaker gauge
// - Aggregates: any unhealthy component makes the system unhealthy,
//   otherwise any degraded component makes it degraded
//
// ============================================================================

#[derive(Debug)]
pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

impl UpdateHealth {
    pub fn new(component: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            component: component.into(),
            status,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug)]
pub struct GetSystemHealth;

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub check_time: DateTime<Utc>,
}

impl Reply for SystemHealth {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

pub struct HealthMonitorActor {
    components: BTreeMap<String, ComponentHealth>,
    brokers: Vec<(String, Arc<dyn Broker>)>,
    probe_interval: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl HealthMonitorActor {
    pub fn new() -> Self {
        Self {
            components: BTreeMap::new(),
            brokers: Vec::new(),
            probe_interval: Duration::from_secs(10),
            metrics: None,
        }
    }

    /// Reports `name` from the broker's circuit breaker state on every probe.
    pub fn watch_broker(mut self, name: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        self.brokers.push((name.into(), broker));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let unhealthy: Vec<String> = self
            .components
            .iter()
            .filter_map(|(name, health)| match &health.status {
                HealthStatus::Unhealthy(reason) => Some(format!("{}: {}", name, reason)),
                _ => None,
            })
            .collect();

        if !unhealthy.is_empty() {
            return HealthStatus::Unhealthy(unhealthy.join(", "));
        }

        let degraded: Vec<&str> = self
            .components
            .iter()
            .filter(|(_, health)| matches!(health.status, HealthStatus::Degraded(_)))
            .map(|(name, _)| name.as_str())
            .collect();

        if degraded.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded(format!("degraded: {}", degraded.join(", ")))
        }
    }
}

impl Default for HealthMonitorActor {
    fn default() -> Self {
        Self::new()
    }
}

fn circuit_health(state: CircuitState) -> HealthStatus {
    match state {
        CircuitState::Closed => HealthStatus::Healthy,
        CircuitState::HalfOpen => HealthStatus::Degraded("circuit breaker half-open".to_string()),
        CircuitState::Open => HealthStatus::Unhealthy("circuit breaker open".to_string()),
    }
}

impl Actor for HealthMonitorActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!(brokers = state.brokers.len(), "HealthMonitorActor started");

        if !state.brokers.is_empty() {
            let brokers = state.brokers.clone();
            let interval = state.probe_interval;
            let monitor = actor_ref.downgrade();
            let metrics = state.metrics.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let Some(monitor) = monitor.upgrade() else {
                        break;
                    };
                    for (name, broker) in &brokers {
                        let circuit = broker.circuit_state().await;
                        if let Some(metrics) = &metrics {
                            metrics.update_circuit_breaker_state(circuit);
                        }
                        let status = circuit_health(circuit);
                        let _ = monitor.tell(UpdateHealth::new(name.clone(), status)).send().await;
                    }
                }
            });
        }

        Ok(state)
    }
}

impl Message<UpdateHealth> for HealthMonitorActor {
    type Reply = ();

    async fn handle(&mut self, msg: UpdateHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let previous = self.components.get(&msg.component).map(|h| h.status.clone());
        if previous.as_ref() != Some(&msg.status) {
            tracing::info!(
                component = %msg.component,
                status = ?msg.status,
                "Component health changed"
            );
        }

        let mut health = ComponentHealth::new(msg.component.clone(), msg.status);
        health.details = msg.details;
        self.components.insert(msg.component, health);
    }
}

impl Message<GetSystemHealth> for HealthMonitorActor {
    type Reply = SystemHealth;

    async fn handle(&mut self, _msg: GetSystemHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        SystemHealth {
            overall_status: self.compute_overall_status(),
            components: self.components.clone(),
            check_time: Utc::now(),
        }
    }
}
