use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// State name → ISO-8601 timestamp of the most recent entry into that state.
pub type StateTransitions = BTreeMap<String, String>;

/// ResourceSpec holds Kubernetes resource quantities for one node role.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// PortMapping pairs an internal target port with its externally reachable endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PortMapping {
    pub target: u16,
    pub endpoint: String,
}

/// Record `state` as entered now, returning the timestamp used.
pub fn record_transition(transitions: &mut StateTransitions, state: &str) -> String {
    let now = crate::helpers::utc_now_iso();
    transitions.insert(state.to_string(), now.clone());
    now
}

/// The state whose entry timestamp is the most recent, if any.
pub fn latest_transition(transitions: &StateTransitions) -> Option<&str> {
    transitions
        .iter()
        .max_by(|a, b| a.1.cmp(b.1))
        .map(|(state, _)| state.as_str())
}
