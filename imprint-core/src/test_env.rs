#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

/// Global lock to serialize tests that mutate process-wide environment
/// variables (e.g. IMPRINT_CONFIG_DIR).
#[cfg(test)]
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub struct EnvLockGuard(#[allow(dead_code)] MutexGuard<'static, ()>);

#[cfg(test)]
pub fn lock() -> EnvLockGuard {
    let guard = match ENV_LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    EnvLockGuard(guard)
}

/// Set an environment variable for the guard's lifetime, restoring the
/// prior value (or absence) on drop. Hold [`lock`] first.
#[cfg(test)]
pub struct EnvVarGuard {
    key: String,
    prior: Option<std::ffi::OsString>,
}

#[cfg(test)]
impl EnvVarGuard {
    pub fn set(key: &str, value: &str) -> Self {
        let prior = std::env::var_os(key);
        std::env::set_var(key, value);
        Self {
            key: key.to_string(),
            prior,
        }
    }
}

#[cfg(test)]
impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prior {
            Some(value) => std::env::set_var(&self.key, value),
            None => std::env::remove_var(&self.key),
        }
    }
}
