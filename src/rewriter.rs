/// Coordinador de nombres de servicio.
///
/// Sirve nombres ya cacheados al instante y, para los comandos sin
/// nombre, lanza en segundo plano una única petición por comando al
/// servicio de nombres. Al terminar con éxito actualiza y persiste la
/// caché; el siguiente escaneo ya ve el nombre.
///
/// Estados por comando: ausente → pendiente → cacheado. Un fallo (o
/// una respuesta "unknown") vuelve a ausente y permite reintentar.
use std::sync::Arc;
use std::thread;

use dashmap::DashSet;

use crate::cache::{CacheError, ServiceCache};
use crate::config::LlmSettings;
use crate::naming::{LlmClient, ServiceNamer};

pub struct Rewriter {
    enabled: bool,
    namer: Option<Arc<dyn ServiceNamer>>,
    cache: Arc<ServiceCache>,
    /// Comandos con una petición en curso
    pending: Arc<DashSet<String>>,
}

impl Rewriter {
    /// Crea el coordinador con el cliente HTTP real.
    ///
    /// Queda inerte si los ajustes no están completos o si no se pudo
    /// construir el cliente.
    pub fn new(settings: &LlmSettings, cache: ServiceCache) -> Self {
        if !settings.is_configured() {
            log::info!("Servicio de nombres deshabilitado");
            return Self::disabled(cache);
        }

        match LlmClient::new(settings.clone()) {
            Ok(client) => Self::with_namer(true, Arc::new(client), cache),
            Err(e) => {
                log::error!("No se pudo crear el cliente del servicio de nombres: {}", e);
                Self::disabled(cache)
            }
        }
    }

    /// Carga la caché de su ruta por defecto y crea el coordinador.
    ///
    /// Una caché corrupta es un error de arranque; que no exista no lo es.
    pub fn load(settings: &LlmSettings) -> Result<Self, CacheError> {
        let cache = ServiceCache::load_default()?;
        if cache.is_empty() {
            log::info!("Caché de nombres vacía en {}", cache.path().display());
        } else {
            log::info!(
                "Caché de nombres: {} entradas en {}",
                cache.len(),
                cache.path().display()
            );
        }
        Ok(Self::new(settings, cache))
    }

    /// Crea el coordinador con cualquier servicio de nombres.
    pub fn with_namer(enabled: bool, namer: Arc<dyn ServiceNamer>, cache: ServiceCache) -> Self {
        Self {
            enabled,
            namer: Some(namer),
            cache: Arc::new(cache),
            pending: Arc::new(DashSet::new()),
        }
    }

    fn disabled(cache: ServiceCache) -> Self {
        Self {
            enabled: false,
            namer: None,
            cache: Arc::new(cache),
            pending: Arc::new(DashSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.namer.is_some()
    }

    /// Nombre cacheado para `command`. Nunca dispara trabajo.
    pub fn get_service_name(&self, command: &str) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        self.cache.get(command)
    }

    /// Hay una petición en curso para `command`.
    pub fn is_pending(&self, command: &str) -> bool {
        self.pending.contains(command)
    }

    /// Lanza en segundo plano la búsqueda del nombre de `command`.
    ///
    /// Vuelve de inmediato. No hace nada si está deshabilitado, si el
    /// comando ya está cacheado o si ya hay una petición en curso.
    pub fn trigger_rewrite(&self, command: &str) {
        if !self.is_enabled() || command.is_empty() {
            return;
        }
        let Some(namer) = self.namer.clone() else {
            return;
        };

        if self.cache.has(command) {
            return;
        }

        // insert() es el test-and-set: solo el primero que inserta sigue
        if !self.pending.insert(command.to_string()) {
            return;
        }

        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            command: command.to_string(),
        };

        // Otra petición pudo terminar entre has() e insert()
        if self.cache.has(command) {
            return;
        }

        let cache = Arc::clone(&self.cache);

        let spawned = thread::Builder::new()
            .name("portdigger-rewrite".into())
            .spawn(move || rewrite_in_background(namer.as_ref(), &cache, guard));

        // Si el hilo no arrancó, el guard ya se liberó dentro del closure
        if let Err(e) = spawned {
            log::error!("No se pudo lanzar la búsqueda para {}: {}", command, e);
        }
    }
}

/// Quita el comando del conjunto de pendientes al salir, pase lo que pase.
struct PendingGuard {
    pending: Arc<DashSet<String>>,
    command: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.command);
    }
}

fn rewrite_in_background(namer: &dyn ServiceNamer, cache: &ServiceCache, guard: PendingGuard) {
    let command = guard.command.as_str();

    let service_name = match namer.rewrite_name(command) {
        Ok(name) => name,
        Err(e) => {
            log::warn!("Búsqueda de nombre fallida para {}: {}", command, e);
            return;
        }
    };

    // set() ignora "unknown": el comando queda libre para reintentar
    cache.set(command, &service_name);
    if !cache.has(command) {
        log::debug!("Sin nombre de servicio para {}", command);
        return;
    }

    if let Err(e) = cache.persist() {
        log::error!("No se pudo guardar la caché: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UNKNOWN_SERVICE;
    use crate::naming::NamingError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    /// Servicio de nombres falso que cuenta las llamadas
    struct FakeNamer {
        calls: AtomicUsize,
        answer: Result<&'static str, ()>,
        delay: Duration,
    }

    impl FakeNamer {
        fn answering(answer: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer: Ok(answer),
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer: Err(()),
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ServiceNamer for FakeNamer {
        fn rewrite_name(&self, _command: &str) -> Result<String, NamingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            match self.answer {
                Ok(name) => Ok(name.to_string()),
                Err(()) => Err(NamingError::NoChoices),
            }
        }
    }

    fn temp_cache() -> (tempfile::TempDir, ServiceCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ServiceCache::new(dir.path().join("cache.json"));
        (dir, cache)
    }

    /// Espera a que no quede ninguna petición en curso
    fn wait_idle(rewriter: &Rewriter) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !rewriter.pending.is_empty() {
            assert!(Instant::now() < deadline, "la petición no terminó");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_success_is_cached_and_persisted() {
        let (dir, cache) = temp_cache();
        let namer = FakeNamer::answering("claude-code-ui");
        let rewriter = Rewriter::with_namer(true, namer.clone(), cache);

        let command = "node /opt/homebrew/bin/claude-code-ui";
        assert_eq!(rewriter.get_service_name(command), None);

        rewriter.trigger_rewrite(command);
        wait_idle(&rewriter);

        assert_eq!(rewriter.get_service_name(command).as_deref(), Some("claude-code-ui"));
        assert_eq!(namer.calls(), 1);

        let on_disk = ServiceCache::load(dir.path().join("cache.json")).unwrap();
        assert_eq!(on_disk.get(command).as_deref(), Some("claude-code-ui"));

        // Ya cacheado: no se vuelve a preguntar
        rewriter.trigger_rewrite(command);
        wait_idle(&rewriter);
        assert_eq!(namer.calls(), 1);
    }

    /// N disparos concurrentes del mismo comando hacen una sola llamada
    #[test]
    fn test_concurrent_triggers_deduplicated() {
        let (_dir, cache) = temp_cache();
        let namer = Arc::new(FakeNamer {
            calls: AtomicUsize::new(0),
            answer: Ok("my-service"),
            delay: Duration::from_millis(200),
        });
        let rewriter = Arc::new(Rewriter::with_namer(true, namer.clone(), cache));

        const N: usize = 16;
        let barrier = Arc::new(Barrier::new(N));
        let handles: Vec<_> = (0..N)
            .map(|_| {
                let rewriter = Arc::clone(&rewriter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let start = Instant::now();
                    rewriter.trigger_rewrite("node server.js");
                    start.elapsed()
                })
            })
            .collect();

        for handle in handles {
            let elapsed = handle.join().unwrap();
            assert!(elapsed < Duration::from_millis(150), "trigger bloqueó {elapsed:?}");
        }

        wait_idle(&rewriter);
        assert_eq!(namer.calls(), 1);
        assert_eq!(rewriter.get_service_name("node server.js").as_deref(), Some("my-service"));
    }

    #[test]
    fn test_pending_while_in_flight() {
        let (_dir, cache) = temp_cache();
        let namer = Arc::new(FakeNamer {
            calls: AtomicUsize::new(0),
            answer: Ok("svc"),
            delay: Duration::from_millis(100),
        });
        let rewriter = Rewriter::with_namer(true, namer, cache);

        rewriter.trigger_rewrite("java -jar app.jar");
        assert!(rewriter.is_pending("java -jar app.jar"));
        wait_idle(&rewriter);
        assert!(!rewriter.is_pending("java -jar app.jar"));
    }

    /// "unknown" no se cachea y el comando puede reintentarse
    #[test]
    fn test_unknown_allows_retry() {
        let (dir, cache) = temp_cache();
        let namer = FakeNamer::answering(UNKNOWN_SERVICE);
        let rewriter = Rewriter::with_namer(true, namer.clone(), cache);

        rewriter.trigger_rewrite("node app.js");
        wait_idle(&rewriter);
        assert!(!rewriter.cache.has("node app.js"));
        assert_eq!(rewriter.get_service_name("node app.js"), None);
        assert!(!dir.path().join("cache.json").exists());

        rewriter.trigger_rewrite("node app.js");
        wait_idle(&rewriter);
        assert_eq!(namer.calls(), 2);
    }

    /// Un error tampoco deja marca de pendiente ni entrada en caché
    #[test]
    fn test_error_allows_retry() {
        let (_dir, cache) = temp_cache();
        let namer = FakeNamer::failing();
        let rewriter = Rewriter::with_namer(true, namer.clone(), cache);

        rewriter.trigger_rewrite("ruby app.rb");
        wait_idle(&rewriter);
        assert!(!rewriter.is_pending("ruby app.rb"));
        assert!(!rewriter.cache.has("ruby app.rb"));

        rewriter.trigger_rewrite("ruby app.rb");
        wait_idle(&rewriter);
        assert_eq!(namer.calls(), 2);
    }

    /// Un fallo al persistir no afecta a la entrada en memoria
    #[test]
    fn test_persist_failure_keeps_memory_entry() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let cache = ServiceCache::new(blocker.join("cache.json"));
        let rewriter = Rewriter::with_namer(true, FakeNamer::answering("svc"), cache);

        rewriter.trigger_rewrite("deno run main.ts");
        wait_idle(&rewriter);
        assert_eq!(rewriter.get_service_name("deno run main.ts").as_deref(), Some("svc"));
    }

    #[test]
    fn test_disabled_is_inert() {
        let (_dir, cache) = temp_cache();
        cache.set("node app.js", "my-app");
        let namer = FakeNamer::answering("svc");
        let rewriter = Rewriter::with_namer(false, namer.clone(), cache);

        assert!(!rewriter.is_enabled());
        assert_eq!(rewriter.get_service_name("node app.js"), None);

        rewriter.trigger_rewrite("python3 main.py");
        assert!(!rewriter.is_pending("python3 main.py"));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(namer.calls(), 0);
    }

    /// Ajustes incompletos dejan el coordinador deshabilitado
    #[test]
    fn test_new_without_settings_is_disabled() {
        let (_dir, cache) = temp_cache();
        let settings = LlmSettings {
            enabled: true,
            ..LlmSettings::default()
        };
        let rewriter = Rewriter::new(&settings, cache);
        assert!(!rewriter.is_enabled());
        rewriter.trigger_rewrite("node app.js");
        assert!(!rewriter.is_pending("node app.js"));
    }

    #[test]
    fn test_independent_commands_run_in_parallel() {
        let (_dir, cache) = temp_cache();
        let namer = FakeNamer::answering("svc");
        let rewriter = Rewriter::with_namer(true, namer.clone(), cache);

        for i in 0..5 {
            rewriter.trigger_rewrite(&format!("worker --id {i}"));
        }
        wait_idle(&rewriter);
        assert_eq!(namer.calls(), 5);
        assert_eq!(rewriter.cache.len(), 5);
    }
}
