/// Acciones sobre un puerto desde el menú: terminar el proceso, abrirlo
/// en el navegador y copiar datos al portapapeles.
use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// URL local de un puerto.
pub fn browser_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Termina un proceso por su PID.
///
/// Primero intenta `kill -15` (SIGTERM). Si falla, normalmente por
/// falta de permisos, fuerza `kill -9` con permisos elevados:
/// `pkexec` en Linux, `osascript` en macOS (ambos piden la contraseña
/// con un diálogo gráfico).
///
/// # Returns
/// `Ok(())` si el proceso fue terminado,
/// `Err(String)` con el mensaje de error en caso contrario.
pub fn kill_process(pid: u32) -> Result<(), String> {
    log::info!("Intentando terminar proceso con PID: {}", pid);

    let result = Command::new("kill")
        .args(["-15", &pid.to_string()])
        .output()
        .map_err(|e| format!("Error ejecutando kill: {}", e))?;

    if result.status.success() {
        log::info!("Proceso {} terminado (SIGTERM)", pid);
        return Ok(());
    }

    log::warn!("SIGTERM sin permisos falló, reintentando con permisos elevados...");
    let elevated = elevated_kill_command(pid)
        .output()
        .map_err(|e| format!("Error solicitando permisos elevados: {}", e))?;

    if elevated.status.success() {
        log::info!("Proceso {} terminado con permisos elevados", pid);
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&elevated.stderr);
        Err(format!("No se pudo terminar el proceso {}: {}", pid, stderr.trim()))
    }
}

#[cfg(target_os = "macos")]
fn elevated_kill_command(pid: u32) -> Command {
    let mut cmd = Command::new("osascript");
    cmd.args([
        "-e",
        &format!(
            "do shell script \"kill -9 {}\" with administrator privileges",
            pid
        ),
    ]);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn elevated_kill_command(pid: u32) -> Command {
    let mut cmd = Command::new("pkexec");
    cmd.args(["kill", "-9", &pid.to_string()]);
    cmd
}

/// Abre `http://localhost:PORT` en el navegador por defecto.
pub fn open_in_browser(port: u16) -> Result<(), String> {
    let url = browser_url(port);
    spawn_opener(&url)?;
    log::info!("Abriendo {} en el navegador", url);
    Ok(())
}

/// Abre un archivo con la aplicación por defecto del escritorio.
pub fn open_path(path: &Path) -> Result<(), String> {
    spawn_opener(path.as_os_str())?;
    log::info!("Abriendo {}", path.display());
    Ok(())
}

/// `xdg-open <target>` (o `open` en macOS), sin salida.
fn open_command(target: impl AsRef<OsStr>) -> Command {
    let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
    let mut cmd = Command::new(opener);
    cmd.arg(target).stdout(Stdio::null()).stderr(Stdio::null());
    cmd
}

fn spawn_opener(target: impl AsRef<OsStr>) -> Result<(), String> {
    let mut cmd = open_command(target);
    // No se espera a la aplicación: solo a que el lanzador arranque
    cmd.spawn().map_err(|e| {
        format!("Error ejecutando {}: {}", cmd.get_program().to_string_lossy(), e)
    })?;
    Ok(())
}

/// Herramientas de portapapeles a probar, en orden.
fn clipboard_commands() -> &'static [(&'static str, &'static [&'static str])] {
    if cfg!(target_os = "macos") {
        &[("pbcopy", &[])]
    } else {
        &[
            ("wl-copy", &[]),
            ("xclip", &["-selection", "clipboard"]),
            ("xsel", &["--clipboard", "--input"]),
        ]
    }
}

/// Copia `text` al portapapeles del sistema.
pub fn copy_to_clipboard(text: &str) -> Result<(), String> {
    let mut errors: Vec<String> = Vec::new();

    for (program, args) in clipboard_commands() {
        match pipe_to(program, args, text) {
            Ok(()) => {
                log::info!("Copiado al portapapeles con {}: {}", program, text);
                return Ok(());
            }
            Err(e) => errors.push(format!("{}: {}", program, e)),
        }
    }

    Err(format!("No se pudo copiar al portapapeles ({})", errors.join("; ")))
}

fn pipe_to(program: &str, args: &[&str], text: &str) -> std::io::Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    feed_and_wait(&mut child, text)
}

/// Escribe `text` en el stdin del hijo y siempre lo espera, aunque la
/// escritura falle. Un estado de salida fallido tiene prioridad.
fn feed_and_wait(child: &mut Child, text: &str) -> std::io::Result<()> {
    // stdin se cierra al salir del bloque para que el hijo vea EOF
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(text.as_bytes()),
        None => Ok(()),
    };

    let status = child.wait()?;
    if !status.success() {
        return Err(std::io::Error::other(format!("terminó con {}", status)));
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_url() {
        assert_eq!(browser_url(3000), "http://localhost:3000");
        assert_eq!(browser_url(65535), "http://localhost:65535");
    }

    #[test]
    fn test_clipboard_commands_not_empty() {
        assert!(!clipboard_commands().is_empty());
    }

    #[test]
    fn test_open_command() {
        let cmd = open_command(Path::new("/tmp/portdigger/config.yaml"));
        let expected = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
        assert_eq!(cmd.get_program(), expected);
        let args: Vec<&OsStr> = cmd.get_args().collect();
        assert_eq!(args, vec![OsStr::new("/tmp/portdigger/config.yaml")]);
    }

    /// El hijo que sale sin leer su entrada se espera igual: se conoce su
    /// estado de salida en vez de quedar solo el error de escritura
    #[test]
    fn test_pipe_child_exits_without_reading() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        let text = "x".repeat(1 << 20);

        let err = feed_and_wait(&mut child, &text).unwrap_err();
        assert!(err.to_string().contains('3'), "{}", err);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_pipe_to_reads_input() {
        assert!(pipe_to("cat", &[], "hola").is_ok());
    }

    /// Un programa inexistente da error en vez de pánico
    #[test]
    fn test_pipe_to_missing_program() {
        assert!(pipe_to("portdigger-no-such-program", &[], "x").is_err());
    }
}
