use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

use crate::config::VaultConfig;
use crate::errors::VaultResult;

pub const DEFAULT_CONFIG_FILE: &str = "vaultkeeper.toml";

/// Layered configuration: defaults, then TOML file, then `VAULTKEEPER_*` env.
///
/// Nested keys use `__` in env names, e.g. `VAULTKEEPER_SNAPSHOTS__MAX_AUTO=5`.
pub fn load_config(path: Option<&Path>) -> VaultResult<VaultConfig> {
    let file = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("VAULTKEEPER_CONFIG").ok().map(Into::into))
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());

    let figment = Figment::from(Serialized::defaults(VaultConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("VAULTKEEPER_").split("__"));

    let config = apply_legacy_env(figment.extract()?);
    config.validate()?;
    Ok(config)
}

/// Honour the deployment's historical `GITHUB_REPO` / `GITHUB_TOKEN` variables
/// when the mirror section leaves them unset.
fn apply_legacy_env(mut config: VaultConfig) -> VaultConfig {
    if config.mirror.repo.is_none() {
        config.mirror.repo = std::env::var("GITHUB_REPO").ok().filter(|v| !v.trim().is_empty());
    }
    if config.mirror.token.is_none() {
        config.mirror.token = std::env::var("GITHUB_TOKEN").ok().filter(|v| !v.trim().is_empty());
    }
    config
}

/// Render the effective configuration as TOML with the token masked
pub fn render_config(config: &VaultConfig) -> VaultResult<String> {
    let mut shown = config.clone();
    if shown.mirror.token.is_some() {
        shown.mirror.token = Some("********".to_string());
    }
    toml::to_string_pretty(&shown)
        .map_err(|e| crate::errors::VaultError::config(format!("failed to render config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn toml_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                [snapshots]
                auto_interval_secs = 60
                max_auto = 3
                max_manual = 4
                history_interval_secs = 10
                max_history_per_document = 2
                "#,
            )?;
            jail.set_env("VAULTKEEPER_TIMEOUTS__MIRROR_SECS", "5");

            let config = load_config(Some(Path::new("custom.toml"))).expect("config loads");
            assert_eq!(config.snapshots.max_auto, 3);
            assert_eq!(config.snapshots.max_manual, 4);
            assert_eq!(config.timeouts.mirror_secs, 5);
            assert_eq!(config.timeouts.local_secs, 60);
            Ok(())
        });
    }

    #[test]
    fn legacy_github_env_fills_mirror() {
        Jail::expect_with(|jail| {
            jail.set_env("GITHUB_REPO", "owner/bot-data");
            jail.set_env("GITHUB_TOKEN", "ghp_secret");
            jail.set_env("VAULTKEEPER_MIRROR__ENABLED", "true");

            let config = load_config(Some(Path::new("missing.toml"))).expect("config loads");
            assert!(config.mirror.is_configured());
            assert_eq!(config.mirror.repo.as_deref(), Some("owner/bot-data"));

            let rendered = render_config(&config).expect("renders");
            assert!(!rendered.contains("ghp_secret"));
            Ok(())
        });
    }

    #[test]
    fn invalid_caps_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("VAULTKEEPER_SNAPSHOTS__MAX_AUTO", "0");
            assert!(load_config(Some(Path::new("missing.toml"))).is_err());
            Ok(())
        });
    }
}
