use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::DriverSettings;
use crate::reconciler::GcSettings;

/// Default config file name, looked up in the working directory without extension.
pub const CONFIG_FILE: &str = "cattle-storage";
pub const ENV_PREFIX: &str = "CATTLE_STORAGE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub cattle: CattleConfig,
    pub docker: DockerConfig,
    pub plugin: PluginConfig,
    pub health: HealthConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub name: String,
    /// External driver executable; defaults to the driver name on `PATH`.
    pub command: Option<PathBuf>,
    pub base_dir: PathBuf,
    pub default_fs_type: String,
    pub scope: String,
    pub create_supported: bool,
    pub save_on_attach: bool,
    pub serialize_create: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CattleConfig {
    pub url: String,
    pub access_key: String,
    pub secret_key: String,
    /// Skips the metadata lookup when set.
    pub host_id: Option<String>,
    pub metadata_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub socket_dir: PathBuf,
    pub plugin_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// 0 disables the health listener.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_secs: u64,
    pub kick_delay_secs: u64,
    pub grace_secs: u64,
    pub resync_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: None,
            base_dir: PathBuf::from("/var/lib/rancher/volumes"),
            default_fs_type: "ext4".to_string(),
            scope: "flex".to_string(),
            create_supported: true,
            save_on_attach: false,
            serialize_create: true,
        }
    }
}

impl Default for CattleConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            host_id: None,
            metadata_url: "http://169.254.169.250/2015-12-19".to_string(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self { host: "unix:///var/run/docker.sock".to_string() }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/var/run/rancher/storage"),
            plugin_dir: PathBuf::from("/run/docker/plugins"),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { interval_secs: 60, kick_delay_secs: 1, grace_secs: 30, resync_interval_secs: 60 }
    }
}

impl Config {
    /// Layers an optional config file and `CATTLE_STORAGE_*` variables
    /// (`__` separates sections, e.g. `CATTLE_STORAGE_DRIVER__NAME`) over the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(CONFIG_FILE).required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn driver_settings(&self) -> DriverSettings {
        let mut settings = DriverSettings::new(&self.driver.name, &self.driver.base_dir);
        settings.default_fs_type = self.driver.default_fs_type.clone();
        settings.scope = self.driver.scope.clone();
        settings.create_supported = self.driver.create_supported;
        settings.save_on_attach = self.driver.save_on_attach;
        settings.serialize_create = self.driver.serialize_create;
        settings
    }

    pub fn gc_settings(&self) -> GcSettings {
        GcSettings {
            interval: Duration::from_secs(self.gc.interval_secs),
            kick_delay: Duration::from_secs(self.gc.kick_delay_secs),
            mount_grace: Duration::from_secs(self.gc.grace_secs),
        }
    }

    pub fn driver_command(&self) -> PathBuf {
        self.driver.command.clone().unwrap_or_else(|| PathBuf::from(&self.driver.name))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.plugin.socket_dir.join(format!("{}.sock", self.driver.name))
    }

    pub fn plugin_link(&self) -> PathBuf {
        self.plugin.plugin_dir.join(format!("{}.sock", self.driver.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.driver.base_dir, PathBuf::from("/var/lib/rancher/volumes"));
        assert_eq!(config.driver.default_fs_type, "ext4");
        assert_eq!(config.driver.scope, "flex");
        assert!(config.driver.create_supported);
        assert!(!config.driver.save_on_attach);

        assert_eq!(config.cattle.metadata_url, "http://169.254.169.250/2015-12-19");
        assert_eq!(config.docker.host, "unix:///var/run/docker.sock");
        assert_eq!(config.plugin.socket_dir, PathBuf::from("/var/run/rancher/storage"));
        assert_eq!(config.plugin.plugin_dir, PathBuf::from("/run/docker/plugins"));
        assert_eq!(config.health.port, 0);
        assert_eq!(config.gc.interval_secs, 60);
        assert_eq!(config.gc.resync_interval_secs, 60);
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.driver.name = "ebs".into();

        assert_eq!(config.socket_path(), PathBuf::from("/var/run/rancher/storage/ebs.sock"));
        assert_eq!(config.plugin_link(), PathBuf::from("/run/docker/plugins/ebs.sock"));
        assert_eq!(config.driver_command(), PathBuf::from("ebs"));

        config.driver.command = Some("/usr/bin/ebs-driver".into());
        assert_eq!(config.driver_command(), PathBuf::from("/usr/bin/ebs-driver"));
    }

    #[test]
    fn test_settings_conversion() {
        let mut config = Config::default();
        config.driver.name = "nfs".into();
        config.driver.save_on_attach = true;
        config.gc.grace_secs = 5;

        let driver = config.driver_settings();
        assert_eq!(driver.driver_name, "nfs");
        assert!(driver.save_on_attach);

        let gc = config.gc_settings();
        assert_eq!(gc.interval, Duration::from_secs(60));
        assert_eq!(gc.mount_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let json = r#"{
            "driver": { "name": "ebs", "default_fs_type": "xfs" },
            "health": { "port": 10241 }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.driver.name, "ebs");
        assert_eq!(config.driver.default_fs_type, "xfs");
        assert_eq!(config.driver.scope, "flex");
        assert_eq!(config.health.port, 10241);
        assert_eq!(config.docker.host, "unix:///var/run/docker.sock");
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(
            &path,
            r#"{ "driver": { "name": "ebs" }, "cattle": { "url": "http://cattle:8080/v2-beta" } }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.driver.name, "ebs");
        assert_eq!(config.cattle.url, "http://cattle:8080/v2-beta");
        assert_eq!(config.plugin.plugin_dir, PathBuf::from("/run/docker/plugins"));
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some(Path::new("/nonexistent/cattle-storage.toml"))).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized with every other test that touches the environment.
        unsafe {
            std::env::set_var("CATTLE_STORAGE_DRIVER__NAME", "nfs");
            std::env::set_var("CATTLE_STORAGE_GC__INTERVAL_SECS", "15");
        }

        let config = Config::load(None);

        unsafe {
            std::env::remove_var("CATTLE_STORAGE_DRIVER__NAME");
            std::env::remove_var("CATTLE_STORAGE_GC__INTERVAL_SECS");
        }

        let config = config.unwrap();
        assert_eq!(config.driver.name, "nfs");
        assert_eq!(config.gc.interval_secs, 15);
    }
}
