//! Slave startup configuration.
//!
//! Layered the way the teacher's `config::Config` is: defaults, then
//! `/etc/widgetd/config.toml`, then `$XDG_CONFIG_HOME/widgetd/config.toml`,
//! then a development override in the current directory, each layer
//! overwriting only the keys it sets. A handful of fields are not
//! TOML-configurable at all — they arrive as app-control extras / environment
//! variables at process spawn (§6) and are folded in last.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml::map::Entry;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory watched by the Update Monitor for content-updated files.
    pub image_path: PathBuf,
    /// Master's well-known UNIX socket path.
    pub master_socket_path: PathBuf,
    /// Number of extra-buffer slots each Buffer reserves.
    pub extra_buffer_slots: usize,
    /// Half of this is the ping-emission interval.
    pub ping_time: Duration,
    /// Minimum interval between two update_content calls before the
    /// "heavy updating" latch trips.
    pub min_update_interval: Duration,
    /// Default per-instance update timeout when a `new`/`renew` omits one.
    pub default_timeout: Duration,
    /// Whether a paused instance keeps ticking its periodic timer while
    /// paused. `false` (the default) freezes the timer for the duration of
    /// the pause and respawns it on resume.
    pub update_on_pause: bool,
    /// Directory native (`abi = "c"`) widget packages are loaded from, one
    /// `<package_id>.so` per package.
    pub packages_root: PathBuf,
    /// Directory adaptor shims are loaded from, one `<abi>.so` per non-native
    /// ABI, used to bridge a package written against a different runtime.
    pub adaptors_root: PathBuf,

    /// Identity handed to the slave by the master at spawn time. Not
    /// TOML-configurable; set from environment/app-control extras.
    #[serde(skip)]
    pub slave_name: String,
    #[serde(skip)]
    pub secured: bool,
    #[serde(skip)]
    pub abi: String,
    #[serde(skip)]
    pub hw_accel: Option<String>,

    #[serde(skip)]
    pub disable_call_option: bool,
    #[serde(skip)]
    pub heap_monitor_start: bool,
    #[serde(skip)]
    pub bufmgr_lock_once: bool,
    #[serde(skip)]
    pub bufmgr_map_cache: bool,
    #[serde(skip)]
    pub com_core_thread: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("/run/widgetd/images"),
            master_socket_path: PathBuf::from("/run/widgetd/master.sock"),
            extra_buffer_slots: 4,
            ping_time: Duration::from_secs(60),
            min_update_interval: Duration::from_millis(300),
            default_timeout: Duration::from_secs(5),
            update_on_pause: false,
            packages_root: PathBuf::from("/usr/lib/widgetd/packages"),
            adaptors_root: PathBuf::from("/usr/lib/widgetd/adaptors"),
            slave_name: String::new(),
            secured: false,
            abi: "c".to_string(),
            hw_accel: None,
            disable_call_option: false,
            heap_monitor_start: false,
            bufmgr_lock_once: false,
            bufmgr_map_cache: false,
            com_core_thread: false,
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    /// Runs `f` against the process-wide config, initializing it from disk
    /// and environment on first use.
    pub fn with<R>(f: impl FnOnce(&Config) -> R) -> R {
        let config = CONFIG.get_or_init(Config::init);
        f(config)
    }

    fn init() -> Self {
        let mut merged =
            toml::Value::try_from(Self::default()).expect("default config is always valid toml");

        let mut found_any = false;
        for path in [get_system_config_path(), get_user_config_path(), local_dev_override()]
            .into_iter()
            .flatten()
        {
            match std::fs::read_to_string(&path) {
                Ok(content) => match content.parse::<toml::Value>() {
                    Ok(value) => {
                        merge_value(&mut merged, value);
                        found_any = true;
                        tracing::info!("loaded config from {}", path.display());
                    }
                    Err(err) => warn!("failed to parse {}: {err}", path.display()),
                },
                Err(_) => continue,
            }
        }

        if !found_any {
            warn!("no configuration file found, using defaults");
        }

        let mut config: Config = merged.try_into().unwrap_or_else(|err| {
            warn!("falling back to default config due to invalid overrides: {err}");
            Self::default()
        });

        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        self.disable_call_option = env_flag("PROVIDER_DISABLE_CALL_OPTION");
        self.heap_monitor_start = env_flag("PROVIDER_HEAP_MONITOR_START");
        self.bufmgr_lock_once = std::env::var("BUFMGR_LOCK_TYPE")
            .map(|v| v == "once")
            .unwrap_or(false);
        self.bufmgr_map_cache = env_flag("BUFMGR_MAP_CACHE");
        self.com_core_thread = env_flag("PROVIDER_COM_CORE_THREAD");
    }

    /// Applies the identity handed down by the master at spawn time. Called
    /// once by the binary after parsing its app-control extras; distinct
    /// from the TOML layers because this is per-launch, not persisted.
    pub fn set_identity(&mut self, name: String, secured: bool, abi: String, hw_accel: Option<String>) {
        self.slave_name = name;
        self.secured = secured;
        self.abi = abi;
        self.hw_accel = hw_accel;
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "true").unwrap_or(false)
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => *base_value = override_value,
    }
}

fn get_system_config_path() -> Option<PathBuf> {
    let path = PathBuf::from("/etc/widgetd/config.toml");
    path.exists().then_some(path)
}

fn get_user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".config")))?;
    let path = config_dir.join("widgetd").join("config.toml");
    path.exists().then_some(path)
}

fn local_dev_override() -> Option<PathBuf> {
    let path = PathBuf::from("widgetd_config.toml");
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timeouts() {
        let config = Config::default();
        assert!(config.default_timeout >= Duration::from_secs(1));
        assert!(config.min_update_interval < config.default_timeout);
    }

    #[test]
    fn env_flag_parses_true_only() {
        std::env::set_var("WIDGETD_TEST_FLAG", "true");
        assert!(env_flag("WIDGETD_TEST_FLAG"));
        std::env::set_var("WIDGETD_TEST_FLAG", "yes");
        assert!(!env_flag("WIDGETD_TEST_FLAG"));
        std::env::remove_var("WIDGETD_TEST_FLAG");
        assert!(!env_flag("WIDGETD_TEST_FLAG"));
    }
}
