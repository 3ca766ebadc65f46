use crate::types::ClusterEvent;
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

static LABEL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name pattern is valid")
});

/// Whether a name is accepted as a Loki stream label.
pub fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME.is_match(name)
}

/// Which side wins when a derived label collides with a common label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelPrecedence {
    /// Operator-supplied labels cannot be overridden by event content.
    #[default]
    StaticWins,
    EventWins,
}

impl FromStr for LabelPrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static-wins" | "static" => Ok(LabelPrecedence::StaticWins),
            "event-wins" | "event" => Ok(LabelPrecedence::EventWins),
            other => Err(format!(
                "unknown label precedence '{}', expected static-wins or event-wins",
                other
            )),
        }
    }
}

pub struct LabelEnricher {
    common: Arc<BTreeMap<String, String>>,
    precedence: LabelPrecedence,
}

impl LabelEnricher {
    pub fn new(common: Arc<BTreeMap<String, String>>, precedence: LabelPrecedence) -> Self {
        Self { common, precedence }
    }

    /// Labels taken from the event itself. Empty values are left out.
    pub fn derived_labels(event: &ClusterEvent) -> BTreeMap<String, String> {
        [
            ("namespace", event.namespace.as_str()),
            ("kind", event.involved_object.kind.as_str()),
            ("reason", event.reason.as_str()),
            ("type", event.event_type.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn enrich(&self, event: &ClusterEvent) -> BTreeMap<String, String> {
        let mut labels = (*self.common).clone();
        for (key, value) in Self::derived_labels(event) {
            match self.precedence {
                LabelPrecedence::StaticWins => {
                    labels.entry(key).or_insert(value);
                }
                LabelPrecedence::EventWins => {
                    labels.insert(key, value);
                }
            }
        }
        labels
    }
}
