/// Caché persistente de nombres de servicio.
///
/// Asocia la línea de comando completa de un proceso con el nombre de
/// servicio que devolvió el servicio de nombres. Se guarda como JSON
/// en `~/.config/portdigger/cache.json`.
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::config;

/// Resultado reservado para "no se pudo determinar el servicio".
/// Nunca se guarda en la caché.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Nombre del archivo de caché dentro del directorio de configuración
const CACHE_FILE: &str = "cache.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("error de E/S en la caché {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("caché con formato inválido: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Caché `comando completo -> nombre de servicio`, segura entre hilos.
#[derive(Debug)]
pub struct ServiceCache {
    /// Ruta del archivo donde se persiste
    path: PathBuf,
    items: RwLock<HashMap<String, String>>,
    /// Serializa las escrituras a disco para que una instantánea vieja
    /// nunca pise a una más nueva
    persist_lock: Mutex<()>,
}

impl ServiceCache {
    /// Crea una caché vacía que se persistirá en `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_items(path.into(), HashMap::new())
    }

    fn with_items(path: PathBuf, items: HashMap<String, String>) -> Self {
        Self {
            path,
            items: RwLock::new(items),
            persist_lock: Mutex::new(()),
        }
    }

    /// Ruta por defecto: `~/.config/portdigger/cache.json`.
    pub fn default_path() -> Result<PathBuf, CacheError> {
        Ok(config::config_dir()?.join(CACHE_FILE))
    }

    /// Carga la caché desde su ruta por defecto.
    pub fn load_default() -> Result<Self, CacheError> {
        Self::load(Self::default_path()?)
    }

    /// Carga la caché desde `path`.
    ///
    /// Si el archivo no existe devuelve una caché vacía; si existe
    /// pero no es JSON válido devuelve error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Sin caché previa en {}", path.display());
                return Ok(Self::new(path));
            }
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        let items: HashMap<String, String> = serde_json::from_slice(&data)?;
        log::info!("Caché cargada: {} entradas desde {}", items.len(), path.display());
        Ok(Self::with_items(path, items))
    }

    /// Ruta del archivo de la caché.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Nombre de servicio cacheado, o `None` si no hay entrada.
    pub fn get(&self, command: &str) -> Option<String> {
        self.read().get(command).cloned()
    }

    /// Guarda un nombre de servicio. No hace nada con [`UNKNOWN_SERVICE`]
    /// ni con nombres vacíos.
    pub fn set(&self, command: &str, service_name: &str) {
        if service_name == UNKNOWN_SERVICE || service_name.is_empty() {
            return;
        }
        self.write()
            .insert(command.to_string(), service_name.to_string());
    }

    pub fn has(&self, command: &str) -> bool {
        self.read().contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copia del contenido actual.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.read().clone()
    }

    /// Escribe la caché completa a disco.
    ///
    /// Se escribe a un archivo temporal en el mismo directorio y luego
    /// se renombra, así un lector nunca ve un archivo a medias.
    pub fn persist(&self) -> Result<(), CacheError> {
        let _guard = self
            .persist_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let data = serde_json::to_vec_pretty(&self.snapshot())?;
        let io_err = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&data).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        restrict_permissions(tmp.path()).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        log::debug!("Caché guardada en {}", self.path.display());
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.items.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// El archivo puede contener rutas y argumentos privados: solo el dueño lo lee.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
