//! config-rs/lib.rs
//! Shared configuration utilities for the MCP orchestration services
//! Provides typed environment accessors that warn and fall back on bad input

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;

static DOTENV: Once = Once::new();

/// Load a `.env` file from the working directory, once per process
///
/// A missing file is not an error; variables already present in the
/// environment take precedence over the file.
pub fn load_dotenv() {
    DOTENV.call_once(|| match dotenv::dotenv() {
        Ok(path) => log::debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => log::debug!("No .env file found"),
        Err(e) => log::warn!("Failed to load .env file: {}", e),
    });
}

/// Parse an environment variable, falling back to `default` when it is unset
/// or unparseable
///
/// # Arguments
/// * `var_name` - The variable to read (e.g., "MCP_POOL_SIZE")
/// * `default` - The value to use when the variable is absent or invalid
pub fn get_env_parsed<T>(var_name: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match env::var(var_name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid value '{}' in {}, using default {}", raw, var_name, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Get a string variable, treating empty values as unset
pub fn get_env_string(var_name: &str, default: &str) -> String {
    match env::var(var_name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

/// Get an optional string variable, treating empty values as unset
pub fn get_env_optional(var_name: &str) -> Option<String> {
    env::var(var_name).ok().filter(|value| !value.trim().is_empty())
}

pub fn get_env_u64(var_name: &str, default: u64) -> u64 {
    get_env_parsed(var_name, default)
}

pub fn get_env_usize(var_name: &str, default: usize) -> usize {
    get_env_parsed(var_name, default)
}

pub fn get_env_u32(var_name: &str, default: u32) -> u32 {
    get_env_parsed(var_name, default)
}

pub fn get_env_f64(var_name: &str, default: f64) -> f64 {
    get_env_parsed(var_name, default)
}

/// Get a boolean variable; accepts true/false, 1/0, yes/no and on/off
pub fn get_env_bool(var_name: &str, default: bool) -> bool {
    match env::var(var_name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                log::warn!("Invalid boolean '{}' in {}, using default {}", raw, var_name, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Get a duration expressed in whole seconds
pub fn get_env_duration_secs(var_name: &str, default: Duration) -> Duration {
    Duration::from_secs(get_env_u64(var_name, default.as_secs()))
}

/// Get a duration expressed in milliseconds
pub fn get_env_duration_ms(var_name: &str, default: Duration) -> Duration {
    Duration::from_millis(get_env_u64(var_name, default.as_millis() as u64))
}

/// Get the base URL of a tool server
///
/// # Arguments
/// * `server_name` - The name of the server (e.g., "PRIMARY", "DYNAMIC")
/// * `default_port` - The port to use if neither URL nor port is configured
/// * `host` - Optional host (default: "localhost")
///
/// # Returns
/// `{NAME}_SERVER_URL` when set, otherwise `http://{host}:{NAME}_SERVER_PORT`
pub fn get_server_url(server_name: &str, default_port: u16, host: Option<&str>) -> String {
    let url_var_name = format!("{}_SERVER_URL", server_name.to_uppercase());
    let port_var_name = format!("{}_SERVER_PORT", server_name.to_uppercase());

    if let Some(url) = get_env_optional(&url_var_name) {
        return url.trim_end_matches('/').to_string();
    }

    let port = get_env_parsed::<u16>(&port_var_name, default_port);
    let host = host.unwrap_or("localhost");
    format!("http://{}:{}", host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_u64() {
        std::env::set_var("CONFIG_RS_TEST_U64", "42");
        assert_eq!(get_env_u64("CONFIG_RS_TEST_U64", 7), 42);

        std::env::set_var("CONFIG_RS_TEST_U64_BAD", "forty-two");
        assert_eq!(get_env_u64("CONFIG_RS_TEST_U64_BAD", 7), 7);

        std::env::remove_var("CONFIG_RS_TEST_U64_MISSING");
        assert_eq!(get_env_u64("CONFIG_RS_TEST_U64_MISSING", 7), 7);
    }

    #[test]
    fn test_get_env_bool() {
        std::env::set_var("CONFIG_RS_TEST_BOOL", "Yes");
        assert!(get_env_bool("CONFIG_RS_TEST_BOOL", false));

        std::env::set_var("CONFIG_RS_TEST_BOOL_BAD", "maybe");
        assert!(get_env_bool("CONFIG_RS_TEST_BOOL_BAD", true));
    }

    #[test]
    fn test_durations() {
        std::env::set_var("CONFIG_RS_TEST_SECS", "30");
        assert_eq!(
            get_env_duration_secs("CONFIG_RS_TEST_SECS", Duration::from_secs(5)),
            Duration::from_secs(30)
        );

        std::env::remove_var("CONFIG_RS_TEST_MS");
        assert_eq!(
            get_env_duration_ms("CONFIG_RS_TEST_MS", Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_get_env_string_treats_empty_as_unset() {
        std::env::set_var("CONFIG_RS_TEST_EMPTY", "  ");
        assert_eq!(get_env_string("CONFIG_RS_TEST_EMPTY", "fallback"), "fallback");
        assert_eq!(get_env_optional("CONFIG_RS_TEST_EMPTY"), None);
    }

    #[test]
    fn test_get_server_url() {
        // Test with full URL override
        std::env::set_var("CFGTEST_SERVER_URL", "http://example.com:9000/");
        assert_eq!(get_server_url("cfgtest", 8000, None), "http://example.com:9000");

        // Test with port override
        std::env::remove_var("CFGTEST_SERVER_URL");
        std::env::set_var("CFGTEST_SERVER_PORT", "9000");
        assert_eq!(get_server_url("cfgtest", 8000, None), "http://localhost:9000");

        // Test with default and custom host
        std::env::remove_var("CFGUNKNOWN_SERVER_URL");
        std::env::remove_var("CFGUNKNOWN_SERVER_PORT");
        assert_eq!(get_server_url("cfgunknown", 8000, None), "http://localhost:8000");
        assert_eq!(
            get_server_url("cfgunknown", 8000, Some("tools.local")),
            "http://tools.local:8000"
        );
    }
}
