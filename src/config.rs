/// Configuración de PortDigger.
///
/// Se guarda en YAML en `~/.config/portdigger/config.yaml`. Si el
/// archivo no existe se usan los valores por defecto (servicio de
/// nombres deshabilitado).
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directorio de configuración relativo al home del usuario
const CONFIG_DIR: &str = ".config/portdigger";
const CONFIG_FILE: &str = "config.yaml";

pub const DEFAULT_LLM_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no se pudo determinar el directorio home")]
    NoHomeDir,
    #[error("error de E/S en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config.yaml inválido: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuración completa
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmSettings,
}

/// Ajustes del servicio de nombres (API tipo chat completions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default, rename = "apikey")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_url() -> String {
    DEFAULT_LLM_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_LLM_MODEL.to_string()
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_url(),
            api_key: String::new(),
            model: default_model(),
        }
    }
}

impl LlmSettings {
    /// Habilitado y con URL y clave: el único caso en que se hacen peticiones.
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.url.is_empty() && !self.api_key.is_empty()
    }
}

/// `~/.config/portdigger`
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR))
        .ok_or(ConfigError::NoHomeDir)
}

/// `~/.config/portdigger/config.yaml`
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Carga la configuración desde la ruta por defecto.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path()?)
}

/// Carga la configuración desde `path`; si no existe devuelve la de
/// por defecto.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(serde_yaml::from_str(&text)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Config::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Guarda la configuración en `path`, creando el directorio si hace falta.
/// Contiene la clave de la API, así que se escribe con permisos 0600.
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }

    let text = serde_yaml::to_string(config)?;
    fs::write(path, text).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }

    Ok(())
}

/// Crea `config.yaml` con valores por defecto si todavía no existe,
/// para que el usuario tenga un archivo que editar.
pub fn ensure_default_config() -> Result<PathBuf, ConfigError> {
    let path = config_path()?;
    ensure_default_config_at(&path)?;
    Ok(path)
}

fn ensure_default_config_at(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    save_config_to(&Config::default(), path)?;
    log::info!("Configuración por defecto creada en {}", path.display());
    Ok(true)
}
