//! Cross-crate integration tests: invariant checks and end-to-end
//! scenarios, exercised against the real `dbt-core`/
//! `dbt-decode`/`dbt-emit`/`dbt-translate`/`dbt-exec`/`vmm`/
//! `dbt-linux-user` public APIs rather than any crate's own internal
//! unit tests.

/// `vmm::VmmState` plants mappings at their literal guest address on
/// the real host (no g2h translation), so two `VmmState`s
/// live in the same process at once would fight over the same host
/// pages. Every test that constructs one takes this lock first to keep
/// the default parallel test runner from running them concurrently.
#[cfg(test)]
pub(crate) fn real_address_space_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    match LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod exec;
#[cfg(test)]
mod integration;
#[cfg(test)]
mod linux_user;
#[cfg(test)]
mod vmm_tests;
