/// Módulo del system tray (bandeja del sistema).
///
/// Implementa el ícono y menú contextual de PortDigger usando el
/// protocolo StatusNotifierItem/AppIndicator de Linux.
///
/// ## Características del menú:
/// - Lista de puertos TCP en escucha, ordenada por puerto
/// - Nombre de servicio junto al proceso cuando ya se conoce
/// - Por puerto: abrir en navegador, copiar puerto/comando, terminar
/// - Acceso directo a `config.yaml`
/// - Actualización automática periódica
use ksni::{self, menu::StandardItem, menu::SubMenu, Tray};
use std::collections::HashMap;
use std::process;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::actions;
use crate::cache::UNKNOWN_SERVICE;
use crate::config;
use crate::port_scanner::{self, PortInfo};
use crate::rewriter::Rewriter;

/// Un puerto junto con la línea de comando completa de su proceso.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub info: PortInfo,
    /// Comando completo; si no se pudo obtener, el nombre corto
    pub full_command: String,
}

/// Resultado del último escaneo: la lista o el texto del error.
pub type ScanState = Result<Vec<PortEntry>, String>;

/// Escanea, ordena por puerto y completa cada entrada con su comando.
pub fn scan_entries() -> ScanState {
    let mut ports = port_scanner::scan_open_ports().map_err(|e| e.to_string())?;

    ports.sort_by_key(|p| (p.port, p.pid));
    // IPv4 e IPv6 del mismo proceso aparecen dos veces
    ports.dedup_by(|a, b| a.port == b.port && a.pid == b.pid);

    let mut commands: HashMap<u32, String> = HashMap::new();
    let entries: Vec<PortEntry> = ports
        .into_iter()
        .map(|info| {
            let full_command = commands
                .entry(info.pid)
                .or_insert_with(|| port_scanner::get_full_command(info.pid))
                .clone();
            with_full_command(info, full_command)
        })
        .collect();

    Ok(entries)
}

/// Escanea y dispara en segundo plano la búsqueda de nombre de cada
/// comando que aún no lo tiene; el siguiente escaneo ya lo mostrará.
fn scan_and_enrich(rewriter: &Rewriter) -> ScanState {
    let entries = scan_entries()?;
    for entry in &entries {
        if rewriter.get_service_name(&entry.full_command).is_none() {
            rewriter.trigger_rewrite(&entry.full_command);
        }
    }
    Ok(entries)
}

fn with_full_command(info: PortInfo, full_command: String) -> PortEntry {
    let full_command = if full_command.is_empty() {
        info.command.clone()
    } else {
        full_command
    };
    PortEntry { info, full_command }
}

/// Formatea un puerto como `"  PORT • proceso"` (puerto alineado a 5).
pub fn format_port_item(info: &PortInfo) -> String {
    format!("{:5} • {}", info.port, info.process_name)
}

/// Como [`format_port_item`], añadiendo el nombre de servicio si lo hay.
pub fn format_port_item_with_rewrite(info: &PortInfo, service_name: Option<&str>) -> String {
    match service_name {
        Some(name) if !name.is_empty() && name != UNKNOWN_SERVICE => {
            format!("{} ({}✨)", format_port_item(info), name)
        }
        _ => format_port_item(info),
    }
}

/// Bloquea el estado; un mutex envenenado se recupera con su último valor.
fn lock_state(state: &Mutex<ScanState>) -> MutexGuard<'_, ScanState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Estado compartido del tray con el último escaneo y el coordinador
/// de nombres de servicio.
pub struct PortDiggerTray {
    state: Arc<Mutex<ScanState>>,
    rewriter: Arc<Rewriter>,
}

impl PortDiggerTray {
    /// Crea una nueva instancia del tray con escaneo inicial.
    pub fn new(rewriter: Arc<Rewriter>) -> Self {
        let state = scan_and_enrich(&rewriter);
        match &state {
            Ok(entries) => log::info!("Escaneo inicial: {} puertos detectados", entries.len()),
            Err(e) => log::error!("Escaneo inicial fallido: {}", e),
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            rewriter,
        }
    }

    /// Referencia compartida al estado, para el hilo de actualización.
    pub fn state_handle(&self) -> Arc<Mutex<ScanState>> {
        Arc::clone(&self.state)
    }

    fn refresh_ports(&mut self) {
        log::info!("Actualizando lista de puertos...");
        let new_state = scan_and_enrich(&self.rewriter);
        *lock_state(&self.state) = new_state;
    }

    fn current_state(&self) -> ScanState {
        lock_state(&self.state).clone()
    }

    /// Etiqueta de un puerto; ⏳ mientras se busca su nombre.
    fn label_for(&self, entry: &PortEntry) -> String {
        let service = self.rewriter.get_service_name(&entry.full_command);
        let label = format_port_item_with_rewrite(&entry.info, service.as_deref());
        if service.is_none() && self.rewriter.is_pending(&entry.full_command) {
            format!("{} ⏳", label)
        } else {
            label
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Implementación del menú contextual del tray
// ─────────────────────────────────────────────────────────────

impl Tray for PortDiggerTray {
    fn icon_name(&self) -> String {
        "network-server".into()
    }

    fn title(&self) -> String {
        "PortDigger ⛏️".into()
    }

    fn id(&self) -> String {
        "portdigger".into()
    }

    /// Construye el menú contextual dinámico.
    ///
    /// ```text
    /// 🔄 Actualizar
    /// ⚙️ Abrir configuración
    /// ──────────
    /// 📡 N puertos en escucha
    ///  3000 • node (claude-code-ui✨) ▸
    ///  5432 • postgres ▸
    /// ──────────
    /// ❌ Salir
    /// ```
    fn menu(&self) -> Vec<ksni::MenuItem<Self>> {
        let mut items: Vec<ksni::MenuItem<Self>> = vec![
            build_refresh_item(),
            build_open_config_item(),
            ksni::MenuItem::Separator,
        ];

        items.extend(build_scan_items(&self.current_state(), |entry| {
            self.label_for(entry)
        }));

        items.push(ksni::MenuItem::Separator);
        items.push(build_exit_item());
        items
    }
}

fn build_refresh_item() -> ksni::MenuItem<PortDiggerTray> {
    StandardItem {
        label: "🔄 Actualizar".into(),
        activate: Box::new(|tray: &mut PortDiggerTray| {
            tray.refresh_ports();
        }),
        ..Default::default()
    }
    .into()
}

/// Abre `config.yaml` (creándolo si falta) con el editor por defecto.
fn build_open_config_item() -> ksni::MenuItem<PortDiggerTray> {
    StandardItem {
        label: "⚙️ Abrir configuración".into(),
        activate: Box::new(|_: &mut PortDiggerTray| {
            let result = config::ensure_default_config()
                .map_err(|e| e.to_string())
                .and_then(|path| actions::open_path(&path));
            if let Err(e) = result {
                log::error!("No se pudo abrir la configuración: {}", e);
            }
        }),
        ..Default::default()
    }
    .into()
}

/// Items que corresponden al último escaneo: un único item de error,
/// un aviso si no hay puertos, o el encabezado y un submenu por puerto.
fn build_scan_items(
    state: &ScanState,
    label_for: impl Fn(&PortEntry) -> String,
) -> Vec<ksni::MenuItem<PortDiggerTray>> {
    match state {
        Err(e) => vec![build_disabled_item(format!("⚠️ Error al escanear: {}", e))],
        Ok(entries) if entries.is_empty() => {
            vec![build_disabled_item("✅ No hay puertos en escucha".into())]
        }
        Ok(entries) => {
            let mut items = vec![build_disabled_item(format!(
                "📡 {} puertos en escucha",
                entries.len()
            ))];
            items.extend(
                entries
                    .iter()
                    .map(|entry| build_port_submenu(entry, label_for(entry))),
            );
            items
        }
    }
}

/// Item informativo, no clickeable.
fn build_disabled_item(label: String) -> ksni::MenuItem<PortDiggerTray> {
    StandardItem {
        label,
        enabled: false,
        ..Default::default()
    }
    .into()
}

/// Submenu de un puerto con sus acciones.
fn build_port_submenu(entry: &PortEntry, label: String) -> ksni::MenuItem<PortDiggerTray> {
    let port = entry.info.port;
    let pid = entry.info.pid;
    let command = entry.full_command.clone();

    let submenu: Vec<ksni::MenuItem<PortDiggerTray>> = vec![
        build_disabled_item(format!("PID {} · {}", pid, entry.info.protocol)),
        ksni::MenuItem::Separator,
        StandardItem {
            label: format!("🌐 Abrir {}", actions::browser_url(port)),
            activate: Box::new(move |_: &mut PortDiggerTray| {
                if let Err(e) = actions::open_in_browser(port) {
                    log::error!("{}", e);
                }
            }),
            ..Default::default()
        }
        .into(),
        StandardItem {
            label: "📋 Copiar puerto".into(),
            activate: Box::new(move |_: &mut PortDiggerTray| {
                if let Err(e) = actions::copy_to_clipboard(&port.to_string()) {
                    log::error!("{}", e);
                }
            }),
            ..Default::default()
        }
        .into(),
        StandardItem {
            label: "📋 Copiar comando".into(),
            activate: Box::new(move |_: &mut PortDiggerTray| {
                if let Err(e) = actions::copy_to_clipboard(&command) {
                    log::error!("{}", e);
                }
            }),
            ..Default::default()
        }
        .into(),
        ksni::MenuItem::Separator,
        StandardItem {
            label: format!("⚔️ Terminar proceso (PID {})", pid),
            activate: Box::new(move |tray: &mut PortDiggerTray| {
                log::info!("Cerrando puerto {} (PID: {})", port, pid);
                match actions::kill_process(pid) {
                    Ok(()) => log::info!("Puerto {} cerrado exitosamente", port),
                    Err(e) => log::error!("Error cerrando puerto {}: {}", port, e),
                }
                tray.refresh_ports();
            }),
            ..Default::default()
        }
        .into(),
    ];

    SubMenu {
        label,
        submenu,
        ..Default::default()
    }
    .into()
}

fn build_exit_item() -> ksni::MenuItem<PortDiggerTray> {
    StandardItem {
        label: "❌ Salir".into(),
        activate: Box::new(|_: &mut PortDiggerTray| {
            log::info!("PortDigger cerrándose...");
            process::exit(0);
        }),
        ..Default::default()
    }
    .into()
}

// ─────────────────────────────────────────────────────────────
// Inicio del servicio system tray
// ─────────────────────────────────────────────────────────────

/// Inicia el system tray y ejecuta el loop principal.
///
/// Lanza un hilo que re-escanea los puertos cada `interval` y pide al
/// tray que reconstruya el menú.
pub fn run_tray(rewriter: Arc<Rewriter>, interval: Duration) {
    log::info!("Iniciando PortDigger system tray...");

    let tray = PortDiggerTray::new(Arc::clone(&rewriter));
    let state_handle = tray.state_handle();

    let service = ksni::TrayService::new(tray);
    let handle = service.handle();

    std::thread::spawn(move || loop {
        std::thread::sleep(interval);

        let new_state = scan_and_enrich(&rewriter);
        *lock_state(&state_handle) = new_state;

        handle.update(|_tray: &mut PortDiggerTray| {
            log::debug!("Menú actualizado automáticamente");
        });
    });

    // Bloquea el hilo principal
    if let Err(e) = service.run() {
        log::error!("Error ejecutando el servicio de tray: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_scanner::Protocol;

    fn info(port: u16, process_name: &str) -> PortInfo {
        PortInfo {
            port,
            process_name: process_name.into(),
            pid: 1,
            command: process_name.into(),
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_format_port_item() {
        assert_eq!(format_port_item(&info(3000, "node")), " 3000 • node");
        assert_eq!(format_port_item(&info(27017, "mongod")), "27017 • mongod");
        assert_eq!(format_port_item(&info(80, "nginx")), "   80 • nginx");
    }

    #[test]
    fn test_format_with_rewrite() {
        assert_eq!(
            format_port_item_with_rewrite(&info(3000, "node"), Some("claude-code-ui")),
            " 3000 • node (claude-code-ui✨)"
        );
        assert_eq!(
            format_port_item_with_rewrite(&info(3000, "node"), None),
            " 3000 • node"
        );
        assert_eq!(
            format_port_item_with_rewrite(&info(3000, "node"), Some("")),
            " 3000 • node"
        );
        assert_eq!(
            format_port_item_with_rewrite(&info(8080, "python"), Some(UNKNOWN_SERVICE)),
            " 8080 • python"
        );
    }

    fn entry(port: u16, process_name: &str) -> PortEntry {
        with_full_command(info(port, process_name), String::new())
    }

    /// Devuelve (label, enabled, es_submenu) de cada item
    fn describe(items: &[ksni::MenuItem<PortDiggerTray>]) -> Vec<(String, bool, bool)> {
        items
            .iter()
            .map(|item| match item {
                ksni::MenuItem::Standard(item) => (item.label.clone(), item.enabled, false),
                ksni::MenuItem::SubMenu(sub) => (sub.label.clone(), sub.enabled, true),
                _ => (String::new(), false, false),
            })
            .collect()
    }

    /// Un escaneo fallido se muestra como un único item deshabilitado
    #[test]
    fn test_scan_error_single_entry() {
        let state: ScanState = Err("lsof terminó con código Some(2): bad option".into());
        let items = describe(&build_scan_items(&state, |e| format_port_item(&e.info)));
        assert_eq!(items.len(), 1);
        let (label, enabled, submenu) = &items[0];
        assert!(label.contains("Error al escanear"));
        assert!(label.contains("bad option"));
        assert!(!enabled);
        assert!(!submenu);
    }

    #[test]
    fn test_no_ports_single_entry() {
        let items = describe(&build_scan_items(&Ok(Vec::new()), |e| {
            format_port_item(&e.info)
        }));
        assert_eq!(items.len(), 1);
        assert!(items[0].0.contains("No hay puertos en escucha"));
        assert!(!items[0].1);
    }

    #[test]
    fn test_ports_header_and_submenus() {
        let state: ScanState = Ok(vec![entry(3000, "node"), entry(5432, "postgres")]);
        let items = describe(&build_scan_items(&state, |e| format_port_item(&e.info)));
        assert_eq!(items.len(), 3);
        assert!(items[0].0.contains("2 puertos"));
        assert!(!items[0].1);
        assert_eq!(items[1], (" 3000 • node".to_string(), true, true));
        assert_eq!(items[2], (" 5432 • postgres".to_string(), true, true));
    }

    /// Un mutex envenenado no pierde escaneos ni muestra una lista vacía
    #[test]
    fn test_poisoned_state_recovered() {
        let state: Arc<Mutex<ScanState>> = Arc::new(Mutex::new(Ok(vec![entry(80, "nginx")])));
        let poisoner = Arc::clone(&state);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("envenenar el mutex");
        })
        .join();
        assert!(state.is_poisoned());

        assert_eq!(lock_state(&state).as_ref().map(Vec::len), Ok(1));

        *lock_state(&state) = Err("falló".into());
        assert_eq!(*lock_state(&state), Err("falló".to_string()));
    }

    /// Sin comando completo se usa el nombre corto
    #[test]
    fn test_full_command_fallback() {
        let entry = with_full_command(info(3000, "node"), String::new());
        assert_eq!(entry.full_command, "node");

        let entry = with_full_command(info(3000, "node"), "node server.js".into());
        assert_eq!(entry.full_command, "node server.js");
        assert_eq!(entry.info.command, "node");
    }
}
