use serde_json::{json, Value};

pub const DEFAULT_MANIFEST_URL: &str = "https://buildbot.libretro.com/stable/";
pub const DEFAULT_PLATFORM: &str = "linux/x86_64";
pub const DEFAULT_ARCHIVE_NAME: &str = "RetroArch_cores.7z";
pub const DEFAULT_CORE_INFO_URL: &str =
    "https://github.com/libretro/libretro-core-info/archive/refs/heads/master.zip";
pub const DEFAULT_USER_AGENT: &str = "RetroArch-Core-Updater/1.0";

/// Leftovers of the upstream bundle that do not belong in a cores directory.
pub const DEFAULT_INSTALL_EXCLUDES: [&str; 5] = [
    "configure",
    "cores",
    "retroarch",
    "RetroArch-Linux-x86_64",
    "RetroArch-Linux-x86_64.AppImage.home",
];

pub fn default_config() -> Value {
    json!({
        "manifest": {
            "base_url": DEFAULT_MANIFEST_URL,
            "platform": DEFAULT_PLATFORM,
            "archive_name": DEFAULT_ARCHIVE_NAME,
            "user_agent": DEFAULT_USER_AGENT,
            "request_timeout_secs": 10,
        },
        "download": {
            "connect_timeout_secs": 30,
            "idle_timeout_secs": 30,
        },
        "install": {
            "backup_policy": "timestamp_suffix",
            "exclude": DEFAULT_INSTALL_EXCLUDES,
            "temp_root": Value::Null,
        },
        "core_info": {
            "enabled": false,
            "url": DEFAULT_CORE_INFO_URL,
        },
        "last_selection": {
            "version": Value::Null,
            "target": Value::Null,
        },
    })
}
