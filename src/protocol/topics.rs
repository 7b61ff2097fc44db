//! Topic construction for the coordination channel
//!
//! Commands for a cluster flow on `{base}/coordination/{cluster_id}`, metric
//! samples on `{base}/coordination/{cluster_id}/metrics`. Every topic is
//! canonicalized before use so configuration typos such as a trailing slash
//! on the base do not split a cluster across two topics.

pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    // Single leading slash
    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    // No trailing slash except for root
    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Coordination topic construction functions
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build coordination topic: `{base}/coordination/{cluster_id}`
    pub fn coordination_topic(base: &str, cluster_id: &str) -> String {
        canonicalize_topic(&format!("{base}/coordination/{cluster_id}"))
    }

    /// Build metrics topic: `{base}/coordination/{cluster_id}/metrics`
    pub fn metrics_topic(base: &str, cluster_id: &str) -> String {
        canonicalize_topic(&format!("{base}/coordination/{cluster_id}/metrics"))
    }
}
