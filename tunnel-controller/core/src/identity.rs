use crate::Fragments;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;

static UNSAFE_KEY_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^_\-.a-zA-Z0-9]+").expect("regex must compile"));

/// Computes the key a producer's fragment is stored under in an artifact.
///
/// Keys have the form `<kind>-<namespace>.<name>`. Namespaces are DNS labels
/// and never contain a `.`, and the kind is restricted to alphanumerics, so
/// distinct producers always map to distinct keys. Any character that may
/// not appear in a ConfigMap data key is replaced with `_`.
///
/// # Panics
///
/// If `kind` is empty or contains non-alphanumeric characters. Producer kinds
/// are compile-time constants, so this indicates a programming error.
pub fn fragment_key(kind: &str, namespace: &str, name: &str) -> String {
    assert!(
        !kind.is_empty() && kind.chars().all(|c| c.is_ascii_alphanumeric()),
        "producer kind must be a non-empty alphanumeric word: {kind:?}"
    );
    let key = format!("{kind}-{namespace}.{name}");
    UNSAFE_KEY_CHARS.replace_all(&key, "_").into_owned()
}

/// A content-derived identity for a running tunnel instance.
///
/// Two fragment sets with identical keys and values always produce the same
/// identity. It is used both as the instance's working directory name and as
/// a fast change check.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

// === impl InstanceId ===

impl InstanceId {
    pub fn from_fragments(fragments: &Fragments) -> Self {
        // `BTreeMap` iterates in key order.
        let joined = fragments
            .iter()
            .map(|(k, v)| format!("{k},{v}"))
            .collect::<Vec<_>>()
            .join(",");
        let digest = Sha256::digest(joined.as_bytes());
        Self(URL_SAFE_NO_PAD.encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
