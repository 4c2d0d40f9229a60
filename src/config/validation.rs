use crate::config::types::{Config, CredentialEntry, FetchConfig, UserAgentConfig};
use crate::ConfigError;
use std::net::IpAddr;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(config)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_fetch_config(&config.fetch)?;
    validate_credentials(&config.credentials)?;
    Ok(())
}

/// Validates worker pool configuration
fn validate_crawler_config(config: &Config) -> Result<(), ConfigError> {
    let queues = config.crawler.max_concurrent_queues;
    if !(1..=1000).contains(&queues) {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_queues must be between 1 and 1000, got {}",
            queues
        )));
    }
    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    if let Some(template) = &config.template {
        if template.trim().is_empty() {
            return Err(ConfigError::Validation(
                "user agent template cannot be blank".to_string(),
            ));
        }
        if template.contains(['\r', '\n']) {
            return Err(ConfigError::Validation(
                "user agent template cannot contain line breaks".to_string(),
            ));
        }
    }

    // Validate contact URL
    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    // Validate contact email (basic validation)
    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates fetch engine options
fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.http_proxy_host.is_some() && config.socks_proxy_host.is_some() {
        return Err(ConfigError::Validation(
            "http_proxy_host and socks_proxy_host are mutually exclusive".to_string(),
        ));
    }

    if config.http_proxy_host.is_some() != config.http_proxy_port.is_some() {
        return Err(ConfigError::Validation(
            "http_proxy_host and http_proxy_port must be set together".to_string(),
        ));
    }

    if config.socks_proxy_host.is_some() != config.socks_proxy_port.is_some() {
        return Err(ConfigError::Validation(
            "socks_proxy_host and socks_proxy_port must be set together".to_string(),
        ));
    }

    if config.http_proxy_user.is_some() && config.http_proxy_host.is_none() {
        return Err(ConfigError::Validation(
            "http_proxy_user requires http_proxy_host".to_string(),
        ));
    }

    if let Some(addr) = &config.http_bind_address {
        addr.parse::<IpAddr>().map_err(|_| {
            ConfigError::Validation(format!("http_bind_address '{}' is not an IP address", addr))
        })?;
    }

    if config.timeout_seconds == 0 {
        return Err(ConfigError::Validation(
            "timeout_seconds must be > 0".to_string(),
        ));
    }

    if config.so_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "so_timeout_ms must be > 0".to_string(),
        ));
    }

    if encoding_rs::Encoding::for_label(config.default_charset.as_bytes()).is_none() {
        return Err(ConfigError::Validation(format!(
            "default_charset '{}' is not a recognized charset",
            config.default_charset
        )));
    }

    if let Some(headers) = &config.accept_headers {
        for header in headers {
            if !header.contains(':') || header.contains(['\r', '\n']) {
                return Err(ConfigError::Validation(format!(
                    "accept header '{}' must be a single 'Name: value' line",
                    header
                )));
            }
        }
    }

    Ok(())
}

/// Validates HTTP authentication credentials
fn validate_credentials(credentials: &[CredentialEntry]) -> Result<(), ConfigError> {
    for credential in credentials {
        if credential.domain.is_empty() {
            return Err(ConfigError::Validation(
                "credential domain cannot be empty".to_string(),
            ));
        }
        if credential.login.is_empty() {
            return Err(ConfigError::Validation(format!(
                "credential for '{}' has an empty login",
                credential.domain
            )));
        }
    }
    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    // Basic email format check: must contain @ and have text on both sides
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    let local = parts[0];
    let domain = parts[1];

    if local.is_empty() || domain.is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    // Domain part should contain at least one dot
    if !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
