use chrono::{DateTime, Utc};
use muster_core::MetricSample;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Comparison direction for a threshold rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOp {
    /// Breach when the observed value exceeds the limit.
    Above,
    /// Breach when the observed value falls below the limit.
    Below,
}

/// A configurable alerting rule over one metric of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Component the rule watches, e.g. `"scheduler"`.
    pub component: String,
    /// Metric name the rule watches, e.g. `"queue_depth"`.
    pub metric: String,
    /// Breach direction.
    pub op: ThresholdOp,
    /// Threshold value.
    pub limit: f64,
}

impl ThresholdRule {
    fn breached_by(&self, sample: &MetricSample) -> bool {
        if self.component != sample.component || self.metric != sample.name {
            return false;
        }
        match self.op {
            ThresholdOp::Above => sample.value > self.limit,
            ThresholdOp::Below => sample.value < self.limit,
        }
    }
}

/// An alert event.
///
/// Rule-driven alerts carry the breached threshold in `limit`; alerts
/// raised directly by a component (terminal task failures, agent
/// exhaustion) carry `None` and a `detail` string instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// The offending component.
    pub component: String,
    /// The metric the alert is about.
    pub metric: String,
    /// The observed value.
    pub value: f64,
    /// The breached threshold, for rule-driven alerts.
    pub limit: Option<f64>,
    /// Free-form context, for component-raised alerts.
    pub detail: Option<String>,
    /// When the breach was observed.
    pub raised_at: DateTime<Utc>,
}

/// Collects metric samples pushed by the other components and raises
/// alerts on threshold breach.
///
/// The monitor never takes corrective action itself; alert consumers
/// decide the response.
pub struct Monitor {
    latest: RwLock<HashMap<(String, String), MetricSample>>,
    rules: Vec<ThresholdRule>,
    alerts: broadcast::Sender<Alert>,
}

impl Monitor {
    /// Creates a monitor with the given threshold rules.
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            latest: RwLock::new(HashMap::new()),
            rules,
            alerts,
        }
    }

    /// Records a sample, keeping the latest value per (component, metric)
    /// and evaluating every matching threshold rule.
    pub async fn record(&self, sample: MetricSample) {
        for rule in &self.rules {
            if rule.breached_by(&sample) {
                let alert = Alert {
                    component: sample.component.clone(),
                    metric: sample.name.clone(),
                    value: sample.value,
                    limit: Some(rule.limit),
                    detail: None,
                    raised_at: Utc::now(),
                };
                tracing::warn!(
                    component = %sample.component,
                    metric = %sample.name,
                    value = sample.value,
                    limit = rule.limit,
                    "Threshold breached"
                );
                // No receivers is fine; alerts are fire-and-forget here.
                let _ = self.alerts.send(alert);
            }
        }
        let key = (sample.component.clone(), sample.name.clone());
        self.latest.write().await.insert(key, sample);
    }

    /// Raises an alert directly, outside any threshold rule. Used for
    /// conditions that are alerts by definition, such as terminal task
    /// failures and eligible-agent exhaustion.
    pub fn raise(
        &self,
        component: impl Into<String>,
        metric: impl Into<String>,
        value: f64,
        detail: impl Into<String>,
    ) {
        let alert = Alert {
            component: component.into(),
            metric: metric.into(),
            value,
            limit: None,
            detail: Some(detail.into()),
            raised_at: Utc::now(),
        };
        tracing::warn!(
            component = %alert.component,
            metric = %alert.metric,
            detail = alert.detail.as_deref().unwrap_or(""),
            "Alert raised"
        );
        let _ = self.alerts.send(alert);
    }

    /// Subscribes to alert events.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// The latest sample per (component, metric), ordered for stable output.
    pub async fn snapshot(&self) -> Vec<MetricSample> {
        let latest = self.latest.read().await;
        let mut samples: Vec<MetricSample> = latest.values().cloned().collect();
        samples.sort_by(|a, b| {
            a.component
                .cmp(&b.component)
                .then_with(|| a.name.cmp(&b.name))
        });
        samples
    }

    /// The latest value of one metric, if it was ever recorded.
    pub async fn latest(&self, component: &str, metric: &str) -> Option<f64> {
        let latest = self.latest.read().await;
        latest
            .get(&(component.to_string(), metric.to_string()))
            .map(|s| s.value)
    }

    /// The configured rules.
    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }
}
