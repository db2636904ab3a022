//! Tracing/logging bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,shutrzzz_smoke=debug,client_runtime=debug";

/// Initialize global tracing subscriber with severity gating from environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `SHUTRZZZ_SMOKE_LOG`
/// 3) `SHUTRZZZ_LOG`
/// 4) internal default filter
pub fn init() {
    let env_filter = filter_from_lookup(|key| env::var(key).ok());
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_lookup<F>(mut lookup: F) -> EnvFilter
where
    F: FnMut(&str) -> Option<String>,
{
    for key in [EnvFilter::DEFAULT_ENV, "SHUTRZZZ_SMOKE_LOG", "SHUTRZZZ_LOG"] {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_for(pairs: &[(&str, &str)]) -> String {
        filter_from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_owned())
        })
        .to_string()
    }

    #[test]
    fn falls_back_to_default_filter() {
        assert_eq!(filter_for(&[]), EnvFilter::new(DEFAULT_FILTER).to_string());
    }

    #[test]
    fn rust_log_wins_over_app_specific_vars() {
        let filter = filter_for(&[
            ("RUST_LOG", "warn"),
            ("SHUTRZZZ_SMOKE_LOG", "trace"),
            ("SHUTRZZZ_LOG", "debug"),
        ]);
        assert_eq!(filter, "warn");
    }

    #[test]
    fn smoke_var_wins_over_general_var() {
        let filter = filter_for(&[("SHUTRZZZ_SMOKE_LOG", "trace"), ("SHUTRZZZ_LOG", "debug")]);
        assert_eq!(filter, "trace");
    }

    #[test]
    fn blank_values_are_skipped() {
        let filter = filter_for(&[("RUST_LOG", "  "), ("SHUTRZZZ_LOG", "error")]);
        assert_eq!(filter, "error");
    }
}
