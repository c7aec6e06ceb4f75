//! Runtime configuration, read from environment variables

use std::time::Duration;

use relay_binance::{BinanceWebSocketConfig, ReconnectPolicy};
use relay_core::{RelayError, RelayResult};
use relay_services::{OverflowPolicy, PriceParsePolicy, SubscriberConfig};

const DEFAULT_SERVER_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server_port: u16,
    pub feed: BinanceWebSocketConfig,
    pub subscriber: SubscriberConfig,
    pub overflow_policy: OverflowPolicy,
    pub parse_policy: PriceParsePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            feed: BinanceWebSocketConfig::default(),
            subscriber: SubscriberConfig::default(),
            overflow_policy: OverflowPolicy::default(),
            parse_policy: PriceParsePolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their default
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(port) = get("SERVER_PORT") {
            config.server_port = parse_number("SERVER_PORT", &port)?;
        }

        if let Some(url) = get("BINANCE_WS_URL") {
            config.feed.url = url;
        }

        let reconnect = &mut config.feed.reconnect;
        if let Some(ms) = get("RECONNECT_DELAY_BASE_MS") {
            reconnect.delay_base = Duration::from_millis(parse_number("RECONNECT_DELAY_BASE_MS", &ms)?);
        }
        if let Some(ms) = get("RECONNECT_DELAY_MAX_MS") {
            reconnect.delay_max = Duration::from_millis(parse_number("RECONNECT_DELAY_MAX_MS", &ms)?);
        }
        if let Some(attempts) = get("RECONNECT_MAX_ATTEMPTS") {
            reconnect.max_attempts = Some(parse_number("RECONNECT_MAX_ATTEMPTS", &attempts)?);
        }
        validate_reconnect(reconnect)?;

        if let Some(capacity) = get("SUBSCRIBER_QUEUE_CAPACITY") {
            let capacity: usize = parse_number("SUBSCRIBER_QUEUE_CAPACITY", &capacity)?;
            if capacity == 0 {
                return Err(RelayError::config("SUBSCRIBER_QUEUE_CAPACITY must be at least 1"));
            }
            config.subscriber.queue_capacity = capacity;
        }
        if let Some(ms) = get("SUBSCRIBER_WRITE_TIMEOUT_MS") {
            let ms: u64 = parse_number("SUBSCRIBER_WRITE_TIMEOUT_MS", &ms)?;
            if ms == 0 {
                return Err(RelayError::config("SUBSCRIBER_WRITE_TIMEOUT_MS must be positive"));
            }
            config.subscriber.write_timeout = Duration::from_millis(ms);
        }

        if let Some(policy) = get("SUBSCRIBER_OVERFLOW_POLICY") {
            config.overflow_policy = policy
                .parse::<OverflowPolicy>()
                .map_err(|e| RelayError::config(format!("SUBSCRIBER_OVERFLOW_POLICY: {}", e)))?;
        }
        if let Some(policy) = get("PRICE_PARSE_POLICY") {
            config.parse_policy = policy
                .parse::<PriceParsePolicy>()
                .map_err(|e| RelayError::config(format!("PRICE_PARSE_POLICY: {}", e)))?;
        }

        Ok(config)
    }

    pub fn feed_endpoint(&self) -> &str {
        &self.feed.url
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> RelayResult<T> {
    value
        .parse()
        .map_err(|_| RelayError::config(format!("{} must be a non-negative integer, got {:?}", key, value)))
}

fn validate_reconnect(policy: &ReconnectPolicy) -> RelayResult<()> {
    if policy.delay_base.is_zero() {
        return Err(RelayError::config("RECONNECT_DELAY_BASE_MS must be positive"));
    }
    if policy.delay_max < policy.delay_base {
        return Err(RelayError::config(
            "RECONNECT_DELAY_MAX_MS must not be below RECONNECT_DELAY_BASE_MS",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_binance::BINANCE_DEPTH_WS_URL;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_fixed_values() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.server_port, 8080);
        assert_eq!(config.feed_endpoint(), BINANCE_DEPTH_WS_URL);
        assert_eq!(config.feed.reconnect.delay_base, Duration::from_secs(1));
        assert_eq!(config.feed.reconnect.delay_max, Duration::from_secs(30));
        assert_eq!(config.feed.reconnect.max_attempts, None);
        assert_eq!(config.subscriber.queue_capacity, 256);
        assert_eq!(config.subscriber.write_timeout, Duration::from_secs(5));
        assert_eq!(config.overflow_policy, OverflowPolicy::Disconnect);
        assert_eq!(config.parse_policy, PriceParsePolicy::ZeroOnError);
    }

    #[test]
    fn test_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("SERVER_PORT", "9001"),
            ("BINANCE_WS_URL", "wss://stream.binance.com:9443/ws/ethusdt@depth"),
            ("RECONNECT_DELAY_BASE_MS", "250"),
            ("RECONNECT_DELAY_MAX_MS", "4000"),
            ("RECONNECT_MAX_ATTEMPTS", "10"),
            ("SUBSCRIBER_QUEUE_CAPACITY", "16"),
            ("SUBSCRIBER_WRITE_TIMEOUT_MS", "750"),
            ("SUBSCRIBER_OVERFLOW_POLICY", "drop_newest"),
            ("PRICE_PARSE_POLICY", "reject"),
        ]))
        .unwrap();

        assert_eq!(config.server_port, 9001);
        assert_eq!(config.feed_endpoint(), "wss://stream.binance.com:9443/ws/ethusdt@depth");
        assert_eq!(config.feed.reconnect.delay_base, Duration::from_millis(250));
        assert_eq!(config.feed.reconnect.delay_max, Duration::from_secs(4));
        assert_eq!(config.feed.reconnect.max_attempts, Some(10));
        assert_eq!(config.subscriber.queue_capacity, 16);
        assert_eq!(config.subscriber.write_timeout, Duration::from_millis(750));
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.parse_policy, PriceParsePolicy::RejectUpdate);
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[("SERVER_PORT", "  "), ("RECONNECT_MAX_ATTEMPTS", "")]))
            .unwrap();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.feed.reconnect.max_attempts, None);
    }

    #[test]
    fn test_malformed_values_rejected() {
        let cases = [
            ("SERVER_PORT", "eighty"),
            ("SERVER_PORT", "70000"),
            ("RECONNECT_DELAY_BASE_MS", "-1"),
            ("RECONNECT_DELAY_BASE_MS", "0"),
            ("SUBSCRIBER_QUEUE_CAPACITY", "0"),
            ("SUBSCRIBER_WRITE_TIMEOUT_MS", "0"),
            ("SUBSCRIBER_OVERFLOW_POLICY", "drop_oldest"),
            ("PRICE_PARSE_POLICY", "guess"),
        ];

        for (key, value) in cases {
            let result = RelayConfig::from_lookup(lookup(&[(key, value)]));
            assert!(
                matches!(result, Err(RelayError::Config(_))),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_max_delay_below_base_rejected() {
        let result = RelayConfig::from_lookup(lookup(&[
            ("RECONNECT_DELAY_BASE_MS", "5000"),
            ("RECONNECT_DELAY_MAX_MS", "1000"),
        ]));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
