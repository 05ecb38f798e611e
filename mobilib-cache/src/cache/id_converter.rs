//! Type-namespaced ids for the shared existence index.
//!
//! Several caches can share one physical index. Each cache prefixes its bare
//! ("origin") ids with a namespace so that `User#42` and `Post#42` never
//! collide. A combo id is `namespace + SEPARATOR + origin_id`.

use mobilib_core::{validate_namespace, ConfigError, NAMESPACE_SEPARATOR};

/// Separator between the namespace and the origin id.
pub const SEPARATOR: char = NAMESPACE_SEPARATOR;

/// Bidirectional mapping between origin ids and combo ids.
///
/// Stateless apart from its prefix. Conversions are idempotent:
/// `to_combo_id` on a combo id and `to_origin_id` on an origin id are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdConverter {
    prefix: String,
}

impl IdConverter {
    /// Create a converter for an explicit namespace.
    ///
    /// Fails for a blank namespace or one containing [`SEPARATOR`].
    pub fn new(namespace: impl AsRef<str>) -> Result<Self, ConfigError> {
        validate_namespace(namespace.as_ref())?;
        Ok(Self::with_prefix(namespace.as_ref()))
    }

    /// Namespace derived from the Rust type name of `T`.
    ///
    /// `std::any::type_name` is not guaranteed stable across compiler
    /// releases. Caches whose index outlives the binary should pin a
    /// namespace with [`IdConverter::new`].
    pub fn for_type<T: ?Sized>() -> Self {
        // type names never contain the separator
        Self::with_prefix(std::any::type_name::<T>())
    }

    fn with_prefix(namespace: &str) -> Self {
        let mut prefix = namespace.to_string();
        prefix.push(SEPARATOR);
        Self { prefix }
    }

    /// The `namespace#` prefix shared by every combo id of this converter.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_combo_id(&self, id: &str) -> bool {
        id.starts_with(&self.prefix)
    }

    pub fn is_origin_id(&self, id: &str) -> bool {
        !self.is_combo_id(id)
    }

    pub fn to_combo_id(&self, id: &str) -> String {
        if self.is_combo_id(id) {
            return id.to_string();
        }
        format!("{}{}", self.prefix, id)
    }

    pub fn to_combo_ids<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        ids.iter().map(|id| self.to_combo_id(id.as_ref())).collect()
    }

    /// Strip the namespace.
    ///
    /// Returns `None` for an empty id or for a bare prefix with nothing after it.
    pub fn to_origin_id(&self, id: &str) -> Option<String> {
        match id.strip_prefix(&self.prefix) {
            Some("") => None,
            Some(origin) => Some(origin.to_string()),
            None if id.is_empty() => None,
            None => Some(id.to_string()),
        }
    }

    /// List form of [`IdConverter::to_origin_id`]; malformed entries are skipped.
    pub fn to_origin_ids<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.to_origin_id(id.as_ref()))
            .collect()
    }
}
