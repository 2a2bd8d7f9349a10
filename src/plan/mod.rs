//! Prepared plans and the session plan cache.

pub mod cache;

use crate::handle::Handle;
use crate::host::TypeOid;
use std::fmt;
use std::sync::Arc;

pub use cache::{PlanCache, PlanCacheStats};

/// Cache key: statement text plus the parameter type signature, compared
/// element-wise in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    text: String,
    param_types: Vec<TypeOid>,
}

impl PlanKey {
    pub fn new(text: impl Into<String>, param_types: &[TypeOid]) -> Self {
        Self {
            text: text.into(),
            param_types: param_types.to_vec(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn param_types(&self) -> &[TypeOid] {
        &self.param_types
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(", self.text)?;
        for (i, oid) in self.param_types.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{oid}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug)]
struct PlanInner {
    key: PlanKey,
    handle: Handle,
}

/// A prepared statement. Clones are the same plan; identity is
/// [`Plan::ptr_eq`].
#[derive(Debug, Clone)]
pub struct Plan {
    inner: Arc<PlanInner>,
}

impl Plan {
    pub(crate) fn new(key: PlanKey, handle: Handle) -> Self {
        Self {
            inner: Arc::new(PlanInner { key, handle }),
        }
    }

    pub fn key(&self) -> &PlanKey {
        &self.inner.key
    }

    pub fn text(&self) -> &str {
        self.inner.key.text()
    }

    pub fn param_types(&self) -> &[TypeOid] {
        self.inner.key.param_types()
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_valid(&self) -> bool {
        self.inner.handle.is_valid()
    }

    /// Valid and not waiting on a deferred invalidation or teardown.
    pub fn is_usable(&self) -> bool {
        self.inner.handle.is_valid() && !self.inner.handle.is_retiring()
    }

    pub fn ptr_eq(&self, other: &Plan) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::PlanKey;
    use crate::host::TypeOid;

    #[test]
    fn keys_compare_text_and_types_in_order() {
        let a = PlanKey::new("select $1, $2", &[TypeOid::INT4, TypeOid::TEXT]);
        assert_eq!(a, PlanKey::new("select $1, $2", &[TypeOid::INT4, TypeOid::TEXT]));
        assert_ne!(a, PlanKey::new("select $1, $2", &[TypeOid::TEXT, TypeOid::INT4]));
        assert_ne!(a, PlanKey::new("select $1,  $2", &[TypeOid::INT4, TypeOid::TEXT]));
        assert_ne!(a, PlanKey::new("select $1, $2", &[TypeOid::INT4]));
        assert_eq!(a.to_string(), "\"select $1, $2\"(23, 25)");
    }
}
