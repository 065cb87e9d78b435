use crate::core::gfx::BackendType;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

const CONFIG_PATH: &str = "glcore.ini";

// --- Minimal INI reader ---
#[derive(Debug, Default)]
pub struct SimpleIni {
    sections: HashMap<String, HashMap<String, String>>,
}

impl SimpleIni {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        self.parse(&content);
        Ok(())
    }

    pub fn parse(&mut self, content: &str) {
        self.sections.clear();

        let mut current_section: Option<String> = None;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            // Section header: [SectionName]
            if line.starts_with('[') && line.ends_with(']') && line.len() >= 2 {
                let name = &line[1..line.len() - 1];
                let section = name.trim().to_string();
                current_section = Some(section.clone());
                self.sections.entry(section).or_default();
                continue;
            }

            // Key/value pair: key=value
            if let Some(eq_idx) = line.find('=') {
                let (key_raw, value_raw) = line.split_at(eq_idx);
                let key = key_raw.trim();
                if key.is_empty() {
                    continue;
                }
                let value = value_raw[1..].trim().to_string();
                let section = current_section.clone().unwrap_or_default();
                self.sections
                    .entry(section)
                    .or_default()
                    .insert(key.to_string(), value);
            }
        }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.sections.get(section).and_then(|s| s.get(key)).cloned()
    }

    pub fn get_section(&self, section: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(section)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Error => "Error",
            Self::Warn => "Warn",
            Self::Info => "Info",
            Self::Debug => "Debug",
            Self::Trace => "Trace",
        }
    }

    pub const fn as_level_filter(&self) -> log::LevelFilter {
        match self {
            Self::Off => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub log_level: LogLevel,
    pub video_renderer: BackendType,
    pub vsync: bool,
    pub gfx_debug: bool,
    pub display_width: u32,
    pub display_height: u32,
    // Offscreen render threads the probe spins up next to the window thread.
    // 0 = none (window thread only).
    pub worker_threads: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            video_renderer: BackendType::OpenGL,
            vsync: true,
            gfx_debug: false,
            display_width: 1280,
            display_height: 720,
            worker_threads: 2,
        }
    }
}

impl Config {
    /// Reads `[Options]`, keeping the default for every missing or malformed key.
    pub fn from_ini(conf: &SimpleIni) -> Self {
        let default = Self::default();
        let flag = |key: &str, fallback: bool| {
            conf.get("Options", key)
                .and_then(|v| v.parse::<u8>().ok())
                .map_or(fallback, |v| v != 0)
        };

        Self {
            log_level: conf
                .get("Options", "LogLevel")
                .and_then(|v| LogLevel::from_str(&v).ok())
                .unwrap_or(default.log_level),
            video_renderer: conf
                .get("Options", "VideoRenderer")
                .and_then(|v| {
                    BackendType::from_str(&v)
                        .map_err(|e| warn!("{e}; using {}.", default.video_renderer))
                        .ok()
                })
                .unwrap_or(default.video_renderer),
            vsync: flag("Vsync", default.vsync),
            gfx_debug: flag("GfxDebug", default.gfx_debug),
            display_width: conf
                .get("Options", "DisplayWidth")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|&w| w > 0)
                .unwrap_or(default.display_width),
            display_height: conf
                .get("Options", "DisplayHeight")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|&h| h > 0)
                .unwrap_or(default.display_height),
            worker_threads: conf
                .get("Options", "WorkerThreads")
                .and_then(|v| v.parse::<u8>().ok())
                .map(|n| n.min(16))
                .unwrap_or(default.worker_threads),
        }
    }

    // [Options] section - keys in alphabetical order
    fn to_ini_string(&self) -> String {
        let mut content = String::new();
        content.push_str("[Options]\n");
        content.push_str(&format!("DisplayHeight={}\n", self.display_height));
        content.push_str(&format!("DisplayWidth={}\n", self.display_width));
        content.push_str(&format!(
            "GfxDebug={}\n",
            if self.gfx_debug { "1" } else { "0" }
        ));
        content.push_str(&format!("LogLevel={}\n", self.log_level.as_str()));
        content.push_str(&format!("VideoRenderer={}\n", self.video_renderer));
        content.push_str(&format!("Vsync={}\n", if self.vsync { "1" } else { "0" }));
        content.push_str(&format!("WorkerThreads={}\n", self.worker_threads));
        content.push('\n');
        content
    }
}

// Global, mutable configuration instance.
static CONFIG: std::sync::LazyLock<Mutex<Config>> =
    std::sync::LazyLock::new(|| Mutex::new(Config::default()));

// --- File I/O ---

fn create_default_config_file() -> Result<(), std::io::Error> {
    info!("'{CONFIG_PATH}' not found, creating with default values.");
    std::fs::write(CONFIG_PATH, Config::default().to_ini_string())
}

pub fn load() {
    if !Path::new(CONFIG_PATH).exists()
        && let Err(e) = create_default_config_file()
    {
        warn!("Failed to create default config file: {e}");
    }

    let mut conf = SimpleIni::new();
    match conf.load(CONFIG_PATH) {
        Ok(()) => {
            let cfg = Config::from_ini(&conf);
            *CONFIG.lock() = cfg;
            info!("Configuration loaded from '{CONFIG_PATH}'.");
        }
        Err(e) => {
            warn!("Failed to load '{CONFIG_PATH}': {e}. Using default values.");
        }
    }
}

fn save() {
    let content = CONFIG.lock().to_ini_string();
    if let Err(e) = std::fs::write(CONFIG_PATH, content) {
        warn!("Failed to save config file: {e}");
    }
}

pub fn get() -> Config {
    *CONFIG.lock()
}

pub fn update_display_resolution(width: u32, height: u32) {
    let mut dirty = false;
    {
        let mut cfg = CONFIG.lock();
        if cfg.display_width != width {
            cfg.display_width = width;
            dirty = true;
        }
        if cfg.display_height != height {
            cfg.display_height = height;
            dirty = true;
        }
    }
    if dirty {
        save();
    }
}

pub fn update_vsync(enabled: bool) {
    {
        let mut cfg = CONFIG.lock();
        if cfg.vsync == enabled {
            return;
        }
        cfg.vsync = enabled;
    }
    save();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ini_sections_comments_and_whitespace() {
        let mut ini = SimpleIni::new();
        ini.parse(
            "; comment\n# another\nTop = level\n[Options]\n  Vsync = 0 \nbroken line\n=novalue\n[Empty]\n",
        );
        assert_eq!(ini.get("", "Top").as_deref(), Some("level"));
        assert_eq!(ini.get("Options", "Vsync").as_deref(), Some("0"));
        assert_eq!(ini.get_section("Options").map(|s| s.len()), Some(1));
        assert!(ini.get_section("Empty").is_some_and(|s| s.is_empty()));
    }

    #[test]
    fn config_reads_options_and_keeps_defaults_for_bad_values() {
        let mut ini = SimpleIni::new();
        ini.parse(
            "[Options]\nLogLevel=debug\nVideoRenderer=Recording\nVsync=0\nGfxDebug=1\n\
             DisplayWidth=0\nDisplayHeight=1080\nWorkerThreads=200\n",
        );
        let cfg = Config::from_ini(&ini);
        let default = Config::default();
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.video_renderer, BackendType::Recording);
        assert!(!cfg.vsync);
        assert!(cfg.gfx_debug);
        assert_eq!(cfg.display_width, default.display_width);
        assert_eq!(cfg.display_height, 1080);
        assert_eq!(cfg.worker_threads, 16);
    }

    #[test]
    fn unknown_renderer_falls_back_to_default() {
        let mut ini = SimpleIni::new();
        ini.parse("[Options]\nVideoRenderer=Vulkan\nLogLevel=loud\n");
        let cfg = Config::from_ini(&ini);
        assert_eq!(cfg.video_renderer, Config::default().video_renderer);
        assert_eq!(cfg.log_level, Config::default().log_level);
    }

    #[test]
    fn written_defaults_parse_back_to_defaults() {
        let mut ini = SimpleIni::new();
        ini.parse(&Config::default().to_ini_string());
        assert_eq!(Config::from_ini(&ini), Config::default());
    }
}
