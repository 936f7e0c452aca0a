use std::str::FromStr;
use std::time::Duration;

use beep_core::ClockConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_filter: String,
    pub clock: ClockConfig,
    pub signal_retry: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ClockConfig::default();
        let log_filter = lookup("BEEP_LOG").unwrap_or_else(|| "info".into());
        let clock = ClockConfig {
            sample_rate: parse_var(&lookup, "BEEP_SAMPLE_RATE").unwrap_or(defaults.sample_rate),
            chunk_rate: parse_var(&lookup, "BEEP_CHUNK_RATE").unwrap_or(defaults.chunk_rate),
            tone_frequency: parse_var(&lookup, "BEEP_TONE_HZ").unwrap_or(defaults.tone_frequency),
            amplitude: parse_var(&lookup, "BEEP_AMPLITUDE").unwrap_or(defaults.amplitude),
        };
        let signal_retry =
            Duration::from_millis(parse_var(&lookup, "BEEP_SIGNAL_RETRY_MS").unwrap_or(5_000));

        Self {
            log_filter,
            clock,
            signal_retry,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}
