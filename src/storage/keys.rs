//! Key rewriting and key-shape matching.
//!
//! Keys handed to a store are relative to its logical root, e.g. `widgets/w1`
//! or `namespaces/ns1/widgets/w1`. Tenant partitions carry the tenant as the
//! first segment; the shared union layout is
//!
//! ```text
//! <prefix>/<tenant>/<resource>(/<name>)?
//! <prefix>/<tenant>/namespaces/<ns>/<resource>(/<name>)?
//! <prefix>/<tenant>/namespaces/<name>          (the namespaces resource)
//! ```

/// Resource name of namespaces themselves.
pub const NAMESPACES: &str = "namespaces";

/// Prefix `key` with `tenant`.
///
/// Identity for the root tenant. Otherwise one leading `/` is removed and the
/// result is `tenant/key`. Already-qualified keys are returned unchanged.
pub fn qualify_key(tenant: &str, key: &str) -> String {
    if tenant.is_empty() {
        return key.to_string();
    }
    let key = key.strip_prefix('/').unwrap_or(key);
    match key.strip_prefix(tenant) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => key.to_string(),
        _ => format!("{}/{}", tenant, key),
    }
}

/// Join a store prefix and a relative key with exactly one `/`.
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        format!("{}/", prefix)
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Range prefix selecting every key strictly below `key`.
pub fn children_prefix(prefix: &str, key: &str) -> String {
    let full = join_key(prefix, key);
    if full.ends_with('/') {
        full
    } else {
        format!("{}/", full)
    }
}

/// Strip a store prefix from a physical key.
pub fn relative_key<'a>(prefix: &str, full: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    full.strip_prefix(prefix)?.strip_prefix('/')
}

/// Parts of a physical key that matched a [`KeyShape`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatch<'a> {
    /// Owning tenant (first segment after the prefix).
    pub tenant: &'a str,
    /// Namespace, for namespaced resources.
    pub namespace: Option<&'a str>,
    /// Object name (may contain `/` for nested keys).
    pub name: Option<&'a str>,
    /// Key relative to the shared prefix (`<tenant>/...`).
    pub relative: &'a str,
}

/// Segment-based matcher for one resource in the shared tenant layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShape {
    prefix: String,
    resource: String,
}

impl KeyShape {
    /// Create a matcher for `resource` under `prefix` (e.g. `/tenants`).
    pub fn new(prefix: &str, resource: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            resource: resource.trim_matches('/').to_string(),
        }
    }

    /// Shared prefix without trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resource this shape matches.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Range prefix covering every tenant's data.
    pub fn scan_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// Tenant segment of a physical key, without checking the resource.
    pub fn tenant_of<'a>(&self, full: &'a str) -> Option<&'a str> {
        let rel = relative_key(&self.prefix, full)?;
        let (tenant, _) = rel.split_once('/')?;
        (!tenant.is_empty()).then_some(tenant)
    }

    /// Match a physical key. Returns `None` for other resources, for keys
    /// outside the prefix and for malformed keys.
    pub fn matches<'a>(&self, full: &'a str) -> Option<KeyMatch<'a>> {
        let relative = relative_key(&self.prefix, full)?;
        let (tenant, rest) = relative.split_once('/')?;
        if tenant.is_empty() {
            return None;
        }
        let segments: Vec<&str> = rest.splitn(2, '/').collect();
        let (namespace, name) = match segments.as_slice() {
            [NAMESPACES, tail] if self.resource == NAMESPACES => {
                // Exactly <tenant>/namespaces/<name>.
                if tail.is_empty() || tail.contains('/') {
                    return None;
                }
                (None, Some(*tail))
            }
            [NAMESPACES, tail] => {
                let (ns, after) = tail.split_once('/')?;
                if ns.is_empty() {
                    return None;
                }
                (Some(ns), self.match_resource(after)?)
            }
            _ => (None, self.match_resource(rest)?),
        };
        Some(KeyMatch {
            tenant,
            namespace,
            name,
            relative,
        })
    }

    /// Match `<resource>(/<name>)?` with an exact segment boundary.
    fn match_resource<'a>(&self, tail: &'a str) -> Option<Option<&'a str>> {
        let after = tail.strip_prefix(self.resource.as_str())?;
        if after.is_empty() {
            return Some(None);
        }
        let name = after.strip_prefix('/')?;
        Some((!name.is_empty()).then_some(name))
    }
}

/// Narrowing of a shared list or watch derived from the caller's key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListScope {
    /// Only keys in this namespace.
    pub namespace: Option<String>,
    /// Only this object name.
    pub name: Option<String>,
}

impl ListScope {
    /// Derive the scope of an unqualified list key for `resource`.
    ///
    /// `widgets` selects everything, `namespaces/ns1/widgets` one namespace,
    /// `widgets/w1` or `namespaces/ns1/widgets/w1` a single object. Keys that
    /// do not mention the resource select everything.
    pub fn from_key(resource: &str, key: &str) -> Self {
        let key = key.trim_matches('/');
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [NAMESPACES, name] if resource == NAMESPACES => Self {
                namespace: None,
                name: Some(name.to_string()),
            },
            [NAMESPACES, ns, r, rest @ ..] if *r == resource => Self {
                namespace: Some(ns.to_string()),
                name: (!rest.is_empty()).then(|| rest.join("/")),
            },
            [r, rest @ ..] if *r == resource => Self {
                namespace: None,
                name: (!rest.is_empty()).then(|| rest.join("/")),
            },
            _ => Self::default(),
        }
    }

    /// Whether a matched key falls inside this scope.
    pub fn contains(&self, m: &KeyMatch<'_>) -> bool {
        if let Some(ns) = &self.namespace {
            if m.namespace != Some(ns.as_str()) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if m.name != Some(name.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify_key() {
        assert_eq!(qualify_key("", "widgets/w1"), "widgets/w1");
        assert_eq!(qualify_key("", "/widgets/w1"), "/widgets/w1");
        assert_eq!(qualify_key("acme", "widgets/w1"), "acme/widgets/w1");
        assert_eq!(qualify_key("acme", "/secrets/x"), "acme/secrets/x");
        assert_eq!(qualify_key("acme", "acme/widgets/w1"), "acme/widgets/w1");
        // Prefix of another tenant name is not a qualification.
        assert_eq!(qualify_key("acme", "acmecorp/w1"), "acme/acmecorp/w1");
    }

    #[test]
    fn test_qualify_key_is_idempotent() {
        for key in ["widgets/w1", "/widgets/w1", "namespaces/ns1/widgets/w1", ""] {
            let once = qualify_key("beta", key);
            assert_eq!(qualify_key("beta", &once), once);
            assert!(once.starts_with("beta/") || once == "beta");
        }
    }

    #[test]
    fn test_join_and_relative() {
        assert_eq!(join_key("/registry", "widgets/w1"), "/registry/widgets/w1");
        assert_eq!(join_key("/registry/", "/widgets"), "/registry/widgets");
        assert_eq!(children_prefix("/registry", "widgets"), "/registry/widgets/");
        assert_eq!(
            relative_key("/tenants", "/tenants/acme/widgets/w1"),
            Some("acme/widgets/w1")
        );
        assert_eq!(relative_key("/tenants", "/tenantsx/acme"), None);
    }

    #[test]
    fn test_shape_exact_segment_boundary() {
        let shape = KeyShape::new("/tenants", "widgets");
        let m = shape.matches("/tenants/acme/widgets/w1").unwrap();
        assert_eq!(m.tenant, "acme");
        assert_eq!(m.name, Some("w1"));
        assert_eq!(m.relative, "acme/widgets/w1");

        assert!(shape.matches("/tenants/acme/widgetsextra/w1").is_none());
        assert!(shape.matches("/tenants/acme/gadgets/w1").is_none());
        assert!(shape.matches("/registry/widgets/w1").is_none());
        assert!(shape.matches("/tenants//widgets/w1").is_none());
    }

    #[test]
    fn test_shape_namespaced() {
        let shape = KeyShape::new("/tenants", "widgets");
        let m = shape.matches("/tenants/beta/namespaces/ns1/widgets/w2").unwrap();
        assert_eq!(m.tenant, "beta");
        assert_eq!(m.namespace, Some("ns1"));
        assert_eq!(m.name, Some("w2"));

        assert!(shape.matches("/tenants/beta/namespaces/ns1").is_none());
        assert!(shape
            .matches("/tenants/beta/namespaces/ns1/widgetsextra/w2")
            .is_none());
    }

    #[test]
    fn test_shape_namespaces_resource() {
        let shape = KeyShape::new("/tenants", "namespaces");
        let m = shape.matches("/tenants/acme/namespaces/ns1").unwrap();
        assert_eq!(m.name, Some("ns1"));
        // Objects inside a namespace are not namespaces.
        assert!(shape.matches("/tenants/acme/namespaces/ns1/widgets/w1").is_none());
    }

    #[test]
    fn test_list_scope() {
        let all = ListScope::from_key("widgets", "widgets");
        assert_eq!(all, ListScope::default());

        let ns = ListScope::from_key("widgets", "/namespaces/ns1/widgets");
        assert_eq!(ns.namespace.as_deref(), Some("ns1"));

        let shape = KeyShape::new("/tenants", "widgets");
        let inside = shape.matches("/tenants/a/namespaces/ns1/widgets/w1").unwrap();
        let outside = shape.matches("/tenants/a/namespaces/ns2/widgets/w1").unwrap();
        assert!(ns.contains(&inside));
        assert!(!ns.contains(&outside));

        let one = ListScope::from_key("widgets", "widgets/w1");
        assert_eq!(one.name.as_deref(), Some("w1"));
    }
}
