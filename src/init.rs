//! Process bootstrap helpers.

use tracing_subscriber::EnvFilter;

use crate::config::Config;

const NOISY_TARGETS: &[&str] = &["rustls", "reqwest", "hyper", "hyper_util", "hickory_proto"];

/// Builds the directive string used when `RUST_LOG` is unset.
pub fn filter_directives(level: &str) -> String {
    let mut filter = level.to_string();
    // Silence dependency chatter unless a directive names it.
    for target in NOISY_TARGETS {
        if !filter.contains(target) {
            filter.push_str(&format!(",{}=warn", target));
        }
    }
    filter
}

/// Sets up the tracing subscriber with the configured filters.
pub fn setup_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.logging.level)));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_silence_dependencies() {
        let filter = filter_directives("info");
        assert!(filter.starts_with("info,"));
        assert!(filter.contains("rustls=warn"));
        assert!(filter.contains("reqwest=warn"));

        let explicit = filter_directives("debug,hyper=trace");
        assert!(explicit.contains("hyper=trace"));
        assert!(!explicit.contains("hyper=warn"));
    }
}
