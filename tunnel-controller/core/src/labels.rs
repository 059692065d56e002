use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

pub const VERSION: &str = "cloudflared-controller/version";

static UNSAFE_VALUE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^_\-.a-zA-Z0-9]+").expect("regex must compile"));

/// A single `key=value` label selector identifying artifacts owned by this
/// controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    pub key: String,
    pub value: String,
}

// === impl Selector ===

impl Default for Selector {
    fn default() -> Self {
        Self {
            key: "app".to_string(),
            value: crate::CONTROLLER_NAME.to_string(),
        }
    }
}

impl Selector {
    /// Parses a `key=value` selector, falling back to the default selector
    /// when the value is malformed.
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Self {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            },
            _ => {
                tracing::warn!(selector = %s, "Invalid label selector, using default");
                Self::default()
            }
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Builds the labels carried by an artifact: the producer's labels, the
/// controller version, and the selector label.
pub fn controller_labels(
    labels: &BTreeMap<String, String>,
    version: &str,
    selector: &Selector,
) -> BTreeMap<String, String> {
    let mut out = labels.clone();
    out.insert(VERSION.to_string(), version_label(version));
    out.insert(selector.key.clone(), selector.value.clone());
    out
}

fn version_label(version: &str) -> String {
    let v = UNSAFE_VALUE_CHARS.replace_all(version, "-");
    if v.starts_with(|c: char| c.is_ascii_alphabetic()) {
        v.into_owned()
    } else {
        format!("v{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn selector_parsing() {
        assert_eq!(
            Selector::parse_or_default("team = edge"),
            Selector {
                key: "team".to_string(),
                value: "edge".to_string()
            }
        );
        assert_eq!(Selector::parse_or_default("garbage"), Selector::default());
        assert_eq!(Selector::default().to_string(), "app=cloudflared-controller");
    }

    #[test]
    fn labels_include_version_and_selector() {
        let producer = btreemap! { "tier".to_string() => "web".to_string() };
        let labels = controller_labels(&producer, "0.1.0+abc", &Selector::default());
        assert_eq!(
            labels,
            btreemap! {
                "tier".to_string() => "web".to_string(),
                VERSION.to_string() => "v0.1.0-abc".to_string(),
                "app".to_string() => "cloudflared-controller".to_string(),
            }
        );

        let labels = controller_labels(&producer, "dev", &Selector::default());
        assert_eq!(labels[VERSION], "dev");
    }
}
