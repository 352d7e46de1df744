//! # PortDigger ⛏️
//!
//! Aplicación de bandeja del sistema (system tray) que lista los
//! puertos TCP en escucha y el proceso dueño de cada uno, y les pone
//! un nombre de servicio legible usando una API de generación de texto.
//!
//! ## Características
//! - Ícono en la bandeja del sistema con menú contextual
//! - Lista de puertos TCP en LISTEN obtenida con `lsof`
//! - Nombres de servicio cacheados en `~/.config/portdigger/cache.json`
//! - Abrir en navegador, copiar puerto o comando, terminar el proceso
//! - Actualización automática periódica
//!
//! ## Uso
//! Ejecutar el binario para que aparezca en la bandeja del sistema.
//! `portdigger --list` imprime los puertos una vez y sale.

mod actions;
mod cache;
mod config;
mod naming;
mod port_scanner;
mod rewriter;
mod tray;

use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::naming::ServiceNamer;
use crate::rewriter::Rewriter;

/// Lista los puertos TCP en escucha y el servicio que hay detrás
#[derive(Debug, Parser)]
#[command(name = "portdigger", version, about)]
struct Args {
    /// Imprime los puertos en escucha y sale (sin system tray)
    #[arg(long, conflicts_with = "rewrite")]
    list: bool,

    /// Pide al servicio de nombres el nombre de este comando y sale
    #[arg(long, num_args = 1.., value_name = "COMMAND", allow_hyphen_values = true)]
    rewrite: Option<Vec<String>>,

    /// Segundos entre actualizaciones automáticas del menú
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,
}

/// Inicializa el logging (nivel INFO por defecto, configurable con RUST_LOG).
///
/// En modo tray se escribe a `~/.config/portdigger/logs/portdigger.log`
/// porque el proceso se desengancha de la terminal.
fn init_logging(to_file: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if to_file {
        let log_dir = config::config_dir().map(|dir| dir.join("logs"));
        let file = log_dir.ok().and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("portdigger.log"))
                .ok()
        });
        if let Some(file) = file {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }

    builder.init();
}

/// Desvincula el proceso de la terminal que lo inició.
///
/// Llama a `setsid()` para crear una nueva sesión de proceso sin
/// terminal de control, así `portdigger &` sobrevive al cierre de la
/// terminal sin necesitar `nohup`.
fn daemonize() {
    // setsid() falla si el proceso ya es líder de sesión; en ese caso
    // ya está desenganchado
    if let Err(err) = nix::unistd::setsid() {
        log::debug!("setsid() no aplicable en este contexto: {err}");
    }
}

/// Imprime un escaneo en la salida estándar, con los nombres que ya
/// estén en caché (no lanza búsquedas nuevas).
fn print_ports(rewriter: &Rewriter) -> ExitCode {
    match tray::scan_entries() {
        Ok(entries) if entries.is_empty() => {
            println!("No hay puertos en escucha");
            ExitCode::SUCCESS
        }
        Ok(entries) => {
            for entry in &entries {
                let service = rewriter.get_service_name(&entry.full_command);
                println!(
                    "{}  [PID {}] {}",
                    tray::format_port_item_with_rewrite(&entry.info, service.as_deref()),
                    entry.info.pid,
                    entry.full_command
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error al escanear puertos: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Consulta única al servicio de nombres, para probar la configuración.
fn rewrite_once(settings: &config::LlmSettings, command: &str) -> ExitCode {
    let config_path = config::config_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "~/.config/portdigger/config.yaml".into());

    if !settings.enabled {
        eprintln!("El servicio de nombres está deshabilitado. Actívalo en {}", config_path);
        return ExitCode::FAILURE;
    }
    if settings.api_key.is_empty() {
        eprintln!("La clave de la API está vacía. Configúrala en {}", config_path);
        return ExitCode::FAILURE;
    }

    println!("Config: URL={}, Model={}", settings.url, settings.model);
    println!("Command: {}", command);
    println!("---");

    let result = naming::LlmClient::new(settings.clone())
        .and_then(|client| client.rewrite_name(command));
    match result {
        Ok(name) => {
            println!("Result: {}", name);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Punto de entrada principal de PortDigger.
///
/// Carga configuración y caché, construye el coordinador de nombres y
/// lanza el modo pedido (tray por defecto).
fn main() -> ExitCode {
    let args = Args::parse();
    let tray_mode = !args.list && args.rewrite.is_none();

    init_logging(tray_mode);
    log::info!("⛏️  PortDigger v{} iniciando...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config::ensure_default_config() {
        log::warn!("No se pudo crear la configuración por defecto: {}", e);
    }

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Error cargando la configuración: {}", e);
            eprintln!("Error cargando la configuración: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(words) = args.rewrite {
        return rewrite_once(&config.llm, &words.join(" "));
    }

    let rewriter = match Rewriter::load(&config.llm) {
        Ok(rewriter) => Arc::new(rewriter),
        Err(e) => {
            log::error!("Error cargando la caché de nombres: {}", e);
            eprintln!("Error cargando la caché de nombres: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.list {
        return print_ports(&rewriter);
    }

    // Desengancharse de la terminal para sobrevivir al cierre de la sesión
    daemonize();

    // Bloquea el hilo principal
    tray::run_tray(rewriter, Duration::from_secs(args.interval));
    ExitCode::SUCCESS
}
