//! `ocrd-browser.conf` loading.
//!
//! The file is INI-style. `[FileGroups]` configures which file groups provide page
//! images, and each `[Tool <name>]` section declares an external program that can be
//! launched on the current page's file.

use std::env;
use std::path::PathBuf;

use directories::BaseDirs;
use ini::{Ini, ParseOption};
use thiserror::Error;
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "ocrd-browser.conf";
const TOOL_PREFIX: &str = "Tool ";
const FILE_GROUPS_SECTION: &str = "FileGroups";
const DEFAULT_PREFERRED_IMAGES: &str = "OCR-D-IMG, OCR-D-IMG.*";
const DEFAULT_SYSTEM_CONFIG_DIRS: &str = "/etc/xdg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("tool {tool:?} has no `commandline` option")]
    MissingCommandline { tool: String },
    #[error("tool {tool:?} has an empty or unbalanced commandline")]
    InvalidCommandline { tool: String },
    #[error("could not locate executable {executable:?} for tool {tool:?}")]
    ExecutableNotFound { tool: String, executable: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroups {
    /// Group name patterns, most preferred first.
    pub preferred_images: Vec<String>,
}

impl Default for FileGroups {
    fn default() -> Self {
        Self {
            preferred_images: split_list(DEFAULT_PREFERRED_IMAGES),
        }
    }
}

impl FileGroups {
    fn from_options(options: &[(String, String)]) -> Self {
        let preferred = lookup(options, "preferredImages").unwrap_or(DEFAULT_PREFERRED_IMAGES);
        Self {
            preferred_images: split_list(preferred),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub name: String,
    pub commandline: String,
    pub shortcut: Option<String>,
    /// Where the first word of `commandline` resolved to.
    pub executable: PathBuf,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        commandline: impl Into<String>,
        shortcut: Option<String>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let commandline = commandline.into();
        let executable = shlex::split(&commandline)
            .and_then(|words| words.into_iter().next())
            .ok_or_else(|| ConfigError::InvalidCommandline { tool: name.clone() })?;
        let resolved = which::which(&executable).map_err(|_| ConfigError::ExecutableNotFound {
            tool: name.clone(),
            executable: executable.clone(),
        })?;
        Ok(Self {
            name,
            commandline,
            shortcut,
            executable: resolved,
        })
    }

    fn from_section(name: &str, options: &[(String, String)]) -> Result<Self, ConfigError> {
        let commandline =
            lookup(options, "commandline").ok_or_else(|| ConfigError::MissingCommandline {
                tool: name.to_string(),
            })?;
        let shortcut = lookup(options, "shortcut").map(str::to_string);
        Self::new(name, commandline, shortcut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedTool {
    pub name: String,
    pub reason: String,
}

/// Sections merged from every config file read, in first-seen order.
#[derive(Debug, Default)]
struct RawConfig {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl RawConfig {
    fn merge(&mut self, ini: &Ini) {
        for (name, properties) in ini.iter() {
            let Some(name) = name else {
                continue;
            };
            let position = match self.sections.iter().position(|(known, _)| known == name) {
                Some(position) => position,
                None => {
                    self.sections.push((name.to_string(), Vec::new()));
                    self.sections.len() - 1
                }
            };
            let options = &mut self.sections[position].1;
            for (key, value) in properties.iter() {
                match options.iter_mut().find(|(known, _)| known == key) {
                    Some(slot) => slot.1 = value.to_string(),
                    None => options.push((key.to_string(), value.to_string())),
                }
            }
        }
    }

    fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections
            .iter()
            .find(|(known, _)| known == name)
            .map(|(_, options)| options.as_slice())
    }
}

fn lookup<'a>(options: &'a [(String, String)], key: &str) -> Option<&'a str> {
    options
        .iter()
        .find(|(known, _)| known == key)
        .map(|(_, value)| value.as_str())
}

fn parse_option() -> ParseOption {
    ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    }
}

/// Process-wide settings. Built once at startup and handed to whoever needs them.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub file_groups: FileGroups,
    pub tools: Vec<Tool>,
    pub rejected_tools: Vec<RejectedTool>,
    searched: Vec<PathBuf>,
    read: Vec<PathBuf>,
}

impl Settings {
    /// System config dirs, then the user config dir, then the working directory.
    pub fn default_config_dirs() -> Vec<PathBuf> {
        let system = env::var("XDG_CONFIG_DIRS")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_CONFIG_DIRS.to_string());
        let mut dirs: Vec<PathBuf> = env::split_paths(&system).collect();
        if let Some(base) = BaseDirs::new() {
            dirs.push(base.config_dir().to_path_buf());
        }
        if let Ok(cwd) = env::current_dir() {
            dirs.push(cwd);
        }
        dirs
    }

    pub fn build_default() -> Result<Self, ConfigError> {
        let files: Vec<PathBuf> = Self::default_config_dirs()
            .into_iter()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .collect();
        Self::build_from_files(&files)
    }

    /// Reads every existing file of `files`; later files override earlier ones.
    pub fn build_from_files(files: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::default();
        let mut read = Vec::new();
        for path in files.iter().filter(|path| path.is_file()) {
            let ini = Ini::load_from_file_opt(path, parse_option()).map_err(|err| {
                ConfigError::Read {
                    path: path.clone(),
                    message: err.to_string(),
                }
            })?;
            raw.merge(&ini);
            read.push(path.clone());
        }
        info!(
            "Read config files: {}, tried {}",
            display_paths(&read),
            display_paths(files)
        );
        let mut settings = Self::from_raw(&raw);
        settings.searched = files.to_vec();
        settings.read = read;
        Ok(settings)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str_opt(text, parse_option()).map_err(|err| ConfigError::Read {
            path: PathBuf::from("<memory>"),
            message: err.to_string(),
        })?;
        let mut raw = RawConfig::default();
        raw.merge(&ini);
        Ok(Self::from_raw(&raw))
    }

    /// Re-reads the files this instance was built from.
    pub fn reload(&self) -> Result<Self, ConfigError> {
        Self::build_from_files(&self.searched)
    }

    pub fn read_files(&self) -> &[PathBuf] {
        &self.read
    }

    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    fn from_raw(raw: &RawConfig) -> Self {
        let file_groups = raw
            .section(FILE_GROUPS_SECTION)
            .map(FileGroups::from_options)
            .unwrap_or_default();

        let mut tools: Vec<Tool> = Vec::new();
        let mut rejected_tools = Vec::new();
        for (section, options) in &raw.sections {
            let Some(name) = section.strip_prefix(TOOL_PREFIX) else {
                continue;
            };
            match Tool::from_section(name, options) {
                Ok(tool) => tools.push(tool),
                Err(err) => {
                    warn!(tool = %name, %err, "skipping tool section");
                    rejected_tools.push(RejectedTool {
                        name: name.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Self {
            file_groups,
            tools,
            rejected_tools,
            searched: Vec::new(),
            read: Vec::new(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
