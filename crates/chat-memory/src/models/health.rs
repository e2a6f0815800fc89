use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentCheck {
    pub fn healthy(name: &str, latency: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            latency_ms: latency.as_millis() as u64,
            message: None,
        }
    }

    pub fn with_status(
        name: &str,
        status: HealthStatus,
        latency: Duration,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            status,
            latency_ms: latency.as_millis() as u64,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub components: Vec<ComponentCheck>,
}

impl HealthReport {
    /// Overall status is the worst component status
    pub fn from_checks(components: Vec<ComponentCheck>) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status_is_worst() {
        let report = HealthReport::from_checks(vec![
            ComponentCheck::healthy("archive", Duration::from_millis(3)),
            ComponentCheck::with_status(
                "cache",
                HealthStatus::Degraded,
                Duration::ZERO,
                "using local fallback",
            ),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);

        let empty = HealthReport::from_checks(vec![]);
        assert_eq!(empty.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_serialized_status_is_lowercase() {
        let check = ComponentCheck::healthy("cache", Duration::from_millis(1));
        let value = serde_json::to_value(&check).unwrap();
        assert_eq!(value["status"], "healthy");
        assert!(value.get("message").is_none());
    }
}
