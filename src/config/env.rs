use super::EngineConfig;

/// Applies `ACTIONKIT_*` environment overrides on top of file values.
///
/// Unparseable values are ignored and the file (or default) value is kept.
pub fn apply_env_overrides(config: &mut EngineConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

pub(crate) fn apply_overrides<F>(config: &mut EngineConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(n) = parsed(&lookup, "ACTIONKIT_MAX_ATTEMPTS") {
        config.dispatch.max_attempts = n;
    }
    if let Some(n) = parsed(&lookup, "ACTIONKIT_INITIAL_BACKOFF_MS") {
        config.dispatch.initial_backoff_ms = n;
    }
    if let Some(n) = parsed(&lookup, "ACTIONKIT_MAX_BACKOFF_MS") {
        config.dispatch.max_backoff_ms = n;
    }
    if let Some(n) = parsed(&lookup, "ACTIONKIT_REQUEST_TIMEOUT_MS") {
        config.dispatch.request_timeout_ms = n;
    }
    if let Some(n) = parsed(&lookup, "ACTIONKIT_BATCH_SIZE") {
        config.batching.default_batch_size = n;
    }
    if let Some(n) = parsed(&lookup, "ACTIONKIT_REFRESH_SKEW_SECS") {
        config.auth.refresh_skew_secs = n;
    }
    if let Some(path) = lookup("ACTIONKIT_VAULT_PATH").filter(|p| !p.is_empty()) {
        config.auth.vault_path = Some(path);
    }
    if let Some(n) = parsed(&lookup, "ACTIONKIT_PORT") {
        config.server.port = n;
    }
}

fn parsed<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(name).and_then(|v| v.trim().parse().ok())
}
