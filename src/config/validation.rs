use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_upstream(config)?;
    validate_sampling(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if !upstream.base_url.starts_with("http://") && !upstream.base_url.starts_with("https://") {
        return Err(validation_err(
            "upstream.base_url must start with http:// or https://",
        ));
    }
    if let Err(err) = url::Url::parse(&upstream.base_url) {
        return Err(validation_err(format!(
            "upstream.base_url is not a valid URL: {err}"
        )));
    }
    if upstream.api_key.trim().is_empty() {
        return Err(validation_err("upstream.api_key cannot be empty"));
    }
    if upstream.model.trim().is_empty() {
        return Err(validation_err("upstream.model cannot be empty"));
    }
    if upstream.connect_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.connect_timeout_secs must be greater than 0",
        ));
    }
    validate_proxy_url(upstream.proxy.as_deref())
}

fn validate_proxy_url(proxy: Option<&str>) -> Result<(), ConfigError> {
    let Some(proxy) = proxy else {
        return Ok(());
    };
    let parsed = url::Url::parse(proxy)
        .map_err(|err| validation_err(format!("upstream.proxy is not a valid URL: {err}")))?;
    match parsed.scheme() {
        "http" | "https" | "socks5" | "socks5h" => Ok(()),
        other => Err(validation_err(format!(
            "upstream.proxy has unsupported scheme '{other}'"
        ))),
    }
}

fn validate_sampling(config: &AppConfig) -> Result<(), ConfigError> {
    let sampling = &config.sampling;
    if !(0.0..=2.0).contains(&sampling.temperature) {
        return Err(validation_err(
            "sampling.temperature must be between 0 and 2",
        ));
    }
    if sampling.max_tokens == 0 {
        return Err(validation_err("sampling.max_tokens must be greater than 0"));
    }
    if !(sampling.top_p > 0.0 && sampling.top_p <= 1.0) {
        return Err(validation_err("sampling.top_p must be in (0, 1]"));
    }
    if !(-2.0..=2.0).contains(&sampling.frequency_penalty) {
        return Err(validation_err(
            "sampling.frequency_penalty must be between -2 and 2",
        ));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is invalid. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
