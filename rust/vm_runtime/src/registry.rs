//! Process-wide packed-function registry.
//!
//! Function-pool initialization resolves `Packed`-kind entries here after the
//! executable's own imports, and `set_instrument` accepts names that resolve
//! through this table.  The registry is expected to be populated before any
//! VM is initialized and treated as read-only afterwards.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::value::PackedFn;

fn table() -> &'static RwLock<HashMap<String, PackedFn>> {
    static TABLE: OnceLock<RwLock<HashMap<String, PackedFn>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register `func` under `name`, replacing any previous entry.
pub fn register(name: impl Into<String>, func: PackedFn) {
    let mut guard = match table().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.insert(name.into(), func);
}

/// Look up a registered function by name.
pub fn get(name: &str) -> Option<PackedFn> {
    let guard = match table().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.get(name).cloned()
}

/// Remove a registered function; reports whether an entry existed.
pub fn remove(name: &str) -> bool {
    let mut guard = match table().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.remove(name).is_some()
}
