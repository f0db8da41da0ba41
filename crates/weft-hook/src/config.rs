//! Named configuration variables with change notification
//!
//! A tiny keyed registry in the spirit of the runtime's env-driven
//! configuration: `lookup_int` creates (or returns) a named variable whose
//! initial value can be overridden from the environment, and whose later
//! `set` calls notify registered listeners with the old and new values.
//!
//! The hook layer uses exactly one key:
//!
//! | Key | Effect |
//! |---|---|
//! | `tcp.connect.timeout` (int, ms) | Default `connect` deadline for hooked sockets; default 5000. Live-updatable. |
//!
//! Environment override: the key with dots replaced by underscores,
//! upper-cased, `WEFT_` prefixed (`WEFT_TCP_CONNECT_TIMEOUT`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use weft_core::env;

type Listener = Box<dyn Fn(i64, i64) + Send + Sync>;

/// A named integer configuration variable
pub struct ConfigVar {
    name: String,
    description: String,
    value: RwLock<i64>,
    listeners: Mutex<Vec<Listener>>,
}

impl ConfigVar {
    fn new(name: &str, value: i64, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(value),
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    pub fn get(&self) -> i64 {
        *self.value.read().unwrap()
    }

    /// Update the value, notifying listeners with (old, new)
    ///
    /// Listeners run on the caller's thread. A no-op set (same value) does
    /// not notify.
    pub fn set(&self, new: i64) {
        let old = {
            let mut value = self.value.write().unwrap();
            let old = *value;
            *value = new;
            old
        };
        if old == new {
            return;
        }
        for listener in self.listeners.lock().unwrap().iter() {
            listener(old, new);
        }
    }

    /// Register a change listener
    pub fn add_listener(&self, listener: Listener) {
        self.listeners.lock().unwrap().push(listener);
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<ConfigVar>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<ConfigVar>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Create-or-fetch a named integer variable
///
/// On first lookup the default may be overridden by the environment (the
/// key's `WEFT_` variable, per [`env::var_name`]); later lookups return
/// the existing variable and ignore `default`.
pub fn lookup_int(name: &str, default: i64, description: &str) -> Arc<ConfigVar> {
    let mut vars = registry().lock().unwrap();
    if let Some(var) = vars.get(name) {
        return var.clone();
    }
    let initial = env::parse_or(name, default);
    let var = Arc::new(ConfigVar::new(name, initial, description));
    vars.insert(name.to_string(), var.clone());
    var
}
