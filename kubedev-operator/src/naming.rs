//! Deterministic names for the objects projected from a DevEnvironment.
//!
//! Every environment gets its own namespace. Readable names
//! (`ws-<owner>-<name>`) are used when they are unambiguous; anything else
//! falls back to a truncated slug plus a stable hash of the full identity.

use crate::crd::EnvironmentKey;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Namespace and object names must fit in a DNS label.
pub const MAX_DNS_LABEL: usize = 63;

/// Hex characters of identity hash appended to hashed namespace names.
const NAMESPACE_HASH_LEN: usize = 10;

/// Hex characters in the instance label value.
const INSTANCE_HASH_LEN: usize = 16;

/// Deployment, service and ingress name inside the workspace namespace.
pub const WORKSPACE: &str = "workspace";

/// Persistent volume claim name inside the workspace namespace.
pub const VOLUME_CLAIM: &str = "workspace-data";

/// Resource quota name inside the workspace namespace.
pub const QUOTA: &str = "workspace-quota";

/// Label marking objects created by this operator.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY: &str = "kubedev-operator";

/// Ownership label; value is [`instance_label`] of the DevEnvironment.
pub const INSTANCE_LABEL: &str = "kubedev.io/instance";

/// Owner label, informational.
pub const OWNER_LABEL: &str = "kubedev.io/owner";

/// Namespace annotation holding the `namespace/name` of the DevEnvironment.
pub const ENVIRONMENT_ANNOTATION: &str = "kubedev.io/environment";

macro_rules! static_regex {
    ($pattern:expr, $name:expr) => {
        ::regex::Regex::new($pattern).unwrap_or_else(|_| {
            panic!(
                "Static regex '{}' failed to compile - this is a bug in the operator",
                $name
            )
        })
    };
}

pub(crate) use static_regex;

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| static_regex!(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$", "DNS_LABEL"));

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    static_regex!(
        r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$",
        "DNS_SUBDOMAIN"
    )
});

/// Hashed names end in `-<10 hex>`; readable names must never look like that.
static HASHED_SUFFIX: Lazy<Regex> =
    Lazy::new(|| static_regex!(r"-[0-9a-f]{10}$", "HASHED_SUFFIX"));

/// RFC 1123 label: lowercase alphanumerics and `-`, at most 63 chars.
pub fn is_dns_label(s: &str) -> bool {
    s.len() <= MAX_DNS_LABEL && DNS_LABEL.is_match(s)
}

/// RFC 1123 subdomain, the format of most object names.
pub fn is_dns_subdomain(s: &str) -> bool {
    s.len() <= 253 && DNS_SUBDOMAIN.is_match(s)
}

/// Lowercase, map everything outside `[a-z0-9]` to `-`, collapse and trim dashes.
fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Namespace that holds the projection of `owner`'s environment `name`.
///
/// Pure and deterministic. `name` is a Kubernetes object name and therefore
/// never contains `/`, which keeps `owner/name` unambiguous as hash input.
pub fn workspace_namespace(owner: &str, name: &str, prefix: &str) -> String {
    let prefix = match slugify(prefix) {
        p if p.is_empty() => "ws".to_string(),
        p => p,
    };

    let readable = format!("{prefix}-{owner}-{name}");
    if !owner.contains('-')
        && is_dns_label(owner)
        && is_dns_label(name)
        && is_dns_label(&readable)
        && !HASHED_SUFFIX.is_match(&readable)
    {
        return readable;
    }

    let digest = sha256_hex(&format!("{owner}/{name}"));
    let hash = &digest[..NAMESPACE_HASH_LEN];

    // prefix + '-' + slug + '-' + hash
    let budget = MAX_DNS_LABEL
        .saturating_sub(prefix.len() + 2 + NAMESPACE_HASH_LEN);
    let mut slug = slugify(&format!("{owner}-{name}"));
    slug.truncate(budget);
    let slug = slug.trim_end_matches('-');

    let mut namespace = if slug.is_empty() {
        format!("{prefix}-{hash}")
    } else {
        format!("{prefix}-{slug}-{hash}")
    };
    if namespace.len() > MAX_DNS_LABEL {
        // Oversized prefix; keep the tail, which carries the hash.
        namespace = namespace[namespace.len() - MAX_DNS_LABEL..]
            .trim_start_matches('-')
            .to_string();
    }
    namespace
}

/// Value of the ownership label for the DevEnvironment at `key`.
pub fn instance_label(key: &EnvironmentKey) -> String {
    let digest = sha256_hex(&key.to_string());
    digest[..INSTANCE_HASH_LEN].to_string()
}

/// Label selector matching every object projected for `key`.
pub fn instance_selector(key: &EnvironmentKey) -> String {
    format!("{INSTANCE_LABEL}={}", instance_label(key))
}

/// Label selector matching every object this operator manages.
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}

/// Coerce an arbitrary string into a valid label value.
pub fn label_value(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_DNS_LABEL)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_identity_keeps_readable_name() {
        assert_eq!(workspace_namespace("u1", "env1", "ws"), "ws-u1-env1");
        assert_eq!(workspace_namespace("u1", "my-env", "ws"), "ws-u1-my-env");
    }

    #[test]
    fn ambiguous_owner_is_hashed() {
        // Both would read "ws-a-b-c" without the hash.
        let first = workspace_namespace("a-b", "c", "ws");
        let second = workspace_namespace("a", "b-c", "ws");
        assert_eq!(second, "ws-a-b-c");
        assert_ne!(first, second);
        assert!(first.starts_with("ws-a-b-c-"));
    }

    #[test]
    fn email_owner_is_sanitized() {
        let ns = workspace_namespace("Alice@Example.com", "env1", "ws");
        assert!(is_dns_label(&ns), "{ns}");
        assert!(ns.starts_with("ws-alice-example-com-env1-"));
    }

    #[test]
    fn readable_names_never_mimic_hashed_ones() {
        let ns = workspace_namespace("u1", "x-0123456789", "ws");
        assert_ne!(ns, "ws-u1-x-0123456789");
        assert!(is_dns_label(&ns));
    }

    #[test]
    fn long_identity_is_truncated_and_hashed() {
        let owner = "o".repeat(300);
        let name = "n".repeat(200);
        let ns = workspace_namespace(&owner, &name, "ws");
        assert_eq!(ns.len(), MAX_DNS_LABEL);
        assert!(is_dns_label(&ns));
        assert_eq!(ns, workspace_namespace(&owner, &name, "ws"));
    }

    #[test]
    fn symbol_only_identity_still_gets_a_name() {
        let ns = workspace_namespace("@@@", "!!!", "ws");
        assert!(is_dns_label(&ns));
        assert_eq!(ns.len(), "ws-".len() + NAMESPACE_HASH_LEN);
    }

    #[test]
    fn instance_label_is_stable_and_short() {
        let key = EnvironmentKey::new("kubedev", "env1");
        let label = instance_label(&key);
        assert_eq!(label.len(), INSTANCE_HASH_LEN);
        assert_eq!(label, instance_label(&key));
        assert_ne!(label, instance_label(&EnvironmentKey::new("kubedev", "env2")));
    }

    #[test]
    fn label_values_are_sanitized() {
        assert_eq!(label_value("alice@example.com"), "alice-example.com");
        assert_eq!(label_value("--x--"), "x");
        assert_eq!(label_value(&"a".repeat(100)).len(), MAX_DNS_LABEL);
        assert_eq!(label_value("@@"), "");
    }
}
