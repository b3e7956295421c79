pub mod wire;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Full fleet snapshot as pushed by the daemon on every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub daemon: Option<DaemonStatus>,
    #[serde(default, deserialize_with = "deserialize_lenient_list")]
    pub pipelines: Vec<PipelineInfo>,
    #[serde(default, deserialize_with = "deserialize_lenient_list")]
    pub queue: Vec<QueueItem>,
    #[serde(default, deserialize_with = "deserialize_lenient_list")]
    pub machines: Vec<MachineInfo>,
    #[serde(default, deserialize_with = "deserialize_lenient_list")]
    pub events: Vec<Value>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl FleetState {
    pub fn active_pipelines(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|pipeline| !pipeline.is_finished())
            .count()
    }

    pub fn online_machines(&self) -> usize {
        self.machines
            .iter()
            .filter(|machine| machine.is_online())
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    #[serde(default)]
    pub uptime_s: Option<u64>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub active_jobs: Option<u32>,
    #[serde(default)]
    pub queue_depth: Option<u32>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    #[serde(deserialize_with = "deserialize_id")]
    pub issue: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub elapsed_s: Option<u64>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl PipelineInfo {
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "completed" | "complete" | "done" | "failed" | "cancelled"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(deserialize_with = "deserialize_id")]
    pub issue: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub active_jobs: u32,
    #[serde(default)]
    pub max_workers: u32,
    #[serde(default)]
    pub last_heartbeat: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl MachineInfo {
    pub fn is_online(&self) -> bool {
        matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "online" | "active" | "busy" | "idle"
        )
    }
}

/// Dashboard tabs. The set is closed; the router keys its registry on it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TabId {
    #[default]
    Overview,
    Agents,
    Pipelines,
    Timeline,
    Activity,
    Metrics,
    Machines,
    Insights,
    Team,
}

impl TabId {
    pub const ALL: [TabId; 9] = [
        TabId::Overview,
        TabId::Agents,
        TabId::Pipelines,
        TabId::Timeline,
        TabId::Activity,
        TabId::Metrics,
        TabId::Machines,
        TabId::Insights,
        TabId::Team,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TabId::Overview => "overview",
            TabId::Agents => "agents",
            TabId::Pipelines => "pipelines",
            TabId::Timeline => "timeline",
            TabId::Activity => "activity",
            TabId::Metrics => "metrics",
            TabId::Machines => "machines",
            TabId::Insights => "insights",
            TabId::Team => "team",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            TabId::Overview => "Overview",
            TabId::Agents => "Agents",
            TabId::Pipelines => "Pipelines",
            TabId::Timeline => "Timeline",
            TabId::Activity => "Activity",
            TabId::Metrics => "Metrics",
            TabId::Machines => "Machines",
            TabId::Insights => "Insights",
            TabId::Team => "Team",
        }
    }

    pub fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|tab| *tab == self)
            .unwrap_or_default()
    }

    pub fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }

    /// `#metrics` style navigation fragment for this tab.
    pub fn fragment(self) -> String {
        format!("#{}", self.as_str())
    }

    /// Parses a navigation fragment with or without the leading `#`.
    /// Unknown or empty fragments yield `None`.
    pub fn from_fragment(fragment: &str) -> Option<Self> {
        let trimmed = fragment.trim().trim_start_matches('#');
        if trimmed.is_empty() {
            return None;
        }
        trimmed.parse().ok()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        TabId::ALL
            .iter()
            .copied()
            .find(|tab| tab.as_str() == normalized)
            .ok_or_else(|| format!("Unknown tab: {normalized}"))
    }
}

/// Deserialize an issue id that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

// Null lists read as empty; entries that do not match the record shape are skipped.
fn deserialize_lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_state_accepts_numeric_and_string_issue_ids() {
        let state: FleetState = serde_json::from_str(
            r#"{
                "timestamp": "2026-02-07T21:00:00Z",
                "pipelines": [
                    {"issue": 42, "title": "Fix login", "status": "running", "stage": "build"},
                    {"issue": "43", "title": "Docs", "status": "completed"}
                ],
                "machines": [{"name": "builder-1", "status": "online", "active_jobs": 1, "max_workers": 4}]
            }"#,
        )
        .expect("parse");
        assert_eq!(state.pipelines[0].issue, "42");
        assert_eq!(state.pipelines[1].issue, "43");
        assert_eq!(state.active_pipelines(), 1);
        assert_eq!(state.online_machines(), 1);
    }

    #[test]
    fn fleet_state_keeps_unknown_fields_and_tolerates_null_lists() {
        let state: FleetState = serde_json::from_str(
            r#"{"pipelines": null, "queue": [{"issue": 7}, {"bogus": true}], "cost": {"today": 1.5}}"#,
        )
        .expect("parse");
        assert!(state.pipelines.is_empty());
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.extra["cost"]["today"], serde_json::json!(1.5));
    }

    #[test]
    fn tab_id_parses_names_and_fragments() {
        assert_eq!("metrics".parse::<TabId>(), Ok(TabId::Metrics));
        assert_eq!(" Team ".parse::<TabId>(), Ok(TabId::Team));
        assert!("nope".parse::<TabId>().is_err());
        assert_eq!(TabId::from_fragment("#pipelines"), Some(TabId::Pipelines));
        assert_eq!(TabId::from_fragment("activity"), Some(TabId::Activity));
        assert_eq!(TabId::from_fragment("#"), None);
        assert_eq!(TabId::from_fragment("#invalid-tab"), None);
        assert_eq!(TabId::Insights.fragment(), "#insights");
    }

    #[test]
    fn tab_id_next_wraps_around() {
        assert_eq!(TabId::Overview.next(), TabId::Agents);
        assert_eq!(TabId::Team.next(), TabId::Overview);
        assert_eq!(TabId::Team.index(), 8);
    }

    #[test]
    fn default_tab_is_overview() {
        assert_eq!(TabId::default(), TabId::Overview);
        assert_eq!(TabId::default().fragment(), "#overview");
    }
}
