//! Process-wide name registry
//!
//! Pools and ownership proxies can be registered under a name so unrelated
//! tasks resolve the same runtime. Entries are inserted at startup and
//! removed at shutdown. Writes are rare; reads are concurrent.

use std::any::Any;
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

type Table = RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>;

fn table() -> &'static Table {
    static TABLE: OnceLock<Table> = OnceLock::new();
    TABLE.get_or_init(Table::default)
}

/// Register `value` under `name`. Returns `false` when the name is taken.
pub(crate) fn register<T: Clone + Send + Sync + 'static>(name: &str, value: T) -> bool {
    let mut table = table().write();
    if table.contains_key(name) {
        return false;
    }
    table.insert(name.to_string(), Box::new(value));
    true
}

/// Resolve `name` to a previously registered value of type `T`.
pub(crate) fn lookup<T: Clone + Send + Sync + 'static>(name: &str) -> Option<T> {
    table()
        .read()
        .get(name)
        .and_then(|v| v.downcast_ref::<T>())
        .cloned()
}

/// Remove `name` from the registry.
pub(crate) fn deregister(name: &str) {
    table().write().remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_deregister() {
        assert!(register("registry-test-a", 42_u32));
        assert_eq!(lookup::<u32>("registry-test-a"), Some(42));
        deregister("registry-test-a");
        assert_eq!(lookup::<u32>("registry-test-a"), None);
    }

    #[test]
    fn test_duplicate_names_refused() {
        assert!(register("registry-test-b", 1_u32));
        assert!(!register("registry-test-b", 2_u32));
        assert_eq!(lookup::<u32>("registry-test-b"), Some(1));
        deregister("registry-test-b");
    }

    #[test]
    fn test_lookup_wrong_type() {
        assert!(register("registry-test-c", 7_u32));
        assert_eq!(lookup::<String>("registry-test-c"), None);
        deregister("registry-test-c");
    }
}
