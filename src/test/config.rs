#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::*;

    #[test]
    fn test_defaults() -> Result<()> {
        let config = SessionConfig::default();
        assert!(!config.poll_server);
        assert_eq!(config.poll_frequency(), Duration::from_secs(5));
        assert_eq!(config.timeout(), None);
        assert!(!config.send_digest);
        assert!(config.verify_digest);
        Ok(())
    }

    #[test]
    fn test_partial_json() -> Result<()> {
        let config = SessionConfig::from_json(r#"{ "pollServer": true, "timeoutMs": 250 }"#)?;
        assert!(config.poll_server);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.poll_frequency_ms, 5000);

        assert!(matches!(SessionConfig::from_json("{ \"pollServer\": 3 }"), Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn test_wait_interval_is_never_zero() -> Result<()> {
        let config = SessionConfig {
            wait_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.wait_interval(), Duration::from_millis(1));
        Ok(())
    }

    // All environment cases live in one test; the variables are process-wide.
    #[test]
    fn test_from_env() -> Result<()> {
        std::env::set_var("QPROXY_POLL_SERVER", "yes");
        std::env::set_var("QPROXY_POLL_FREQUENCY_MS", "1500");
        std::env::set_var("QPROXY_TIMEOUT_MS", "200");
        std::env::set_var("QPROXY_SEND_DIGEST", "on");
        std::env::set_var("QPROXY_VERIFY_DIGEST", "0");
        let config = SessionConfig::from_env()?;
        assert!(config.poll_server);
        assert_eq!(config.poll_frequency_ms, 1500);
        assert_eq!(config.timeout_ms, Some(200));
        assert!(config.send_digest);
        assert!(!config.verify_digest);

        std::env::set_var("QPROXY_TIMEOUT_MS", "soon");
        assert!(matches!(SessionConfig::from_env(), Err(Error::Config(_))));

        for name in [
            "QPROXY_POLL_SERVER",
            "QPROXY_POLL_FREQUENCY_MS",
            "QPROXY_TIMEOUT_MS",
            "QPROXY_SEND_DIGEST",
            "QPROXY_VERIFY_DIGEST",
        ] {
            std::env::remove_var(name);
        }
        assert_eq!(SessionConfig::from_env()?, SessionConfig::default());
        Ok(())
    }
}
