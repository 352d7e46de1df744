/// Módulo de escaneo de puertos de red.
/// Lee los puertos TCP en estado LISTEN usando el comando `lsof` del
/// sistema y parsea la salida para obtener información estructurada.
use std::process::Command;

use thiserror::Error;

/// Argumentos de `lsof`: solo TCP en LISTEN, sin resolver hosts ni
/// nombres de puerto, y sin truncar la columna COMMAND.
const LSOF_ARGS: [&str; 6] = ["-iTCP", "-sTCP:LISTEN", "-n", "-P", "+c", "0"];

/// Código de salida con el que `lsof` indica "no se encontró nada".
const LSOF_NOTHING_FOUND: i32 = 1;

/// Primer token de la línea de encabezado de `lsof`.
const LSOF_HEADER: &str = "COMMAND";

/// Número mínimo de columnas de una línea válida de `lsof`.
const MIN_FIELDS: usize = 9;

/// Índice a partir del cual se busca el literal de protocolo.
const PROTOCOL_SCAN_START: usize = 7;

/// Protocolo de un socket en escucha
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP sobre IPv4 (o genérico, según plataforma)
    Tcp,
    /// TCP sobre IPv6
    Tcp6,
}

impl Protocol {
    /// Convierte el literal de la columna NODE de `lsof` en protocolo.
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "TCP" => Some(Protocol::Tcp),
            "TCP6" => Some(Protocol::Tcp6),
            _ => None,
        }
    }

    /// Literal tal como lo imprime `lsof`.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Tcp6 => "TCP6",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Información de un puerto abierto en el sistema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Número del puerto (1-65535)
    pub port: u16,
    /// Nombre corto del proceso (columna COMMAND)
    pub process_name: String,
    /// PID del proceso que usa el puerto (siempre > 0)
    pub pid: u32,
    /// Nombre disponible en la línea; el comando completo se obtiene aparte
    pub command: String,
    /// Protocolo del socket
    pub protocol: Protocol,
}

impl std::fmt::Display for PortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {} (PID: {})",
            self.protocol, self.port, self.process_name, self.pid
        )
    }
}

/// Motivo por el que una línea de `lsof` no produce un registro.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("campos insuficientes ({0})")]
    InsufficientFields(usize),
    #[error("línea de encabezado")]
    HeaderLine,
    #[error("PID inválido: {0}")]
    InvalidPid(String),
    #[error("protocolo/puerto no encontrado")]
    ProtocolNotFound,
    #[error("puerto inválido: {0}")]
    InvalidPort(String),
}

/// Error al ejecutar el escaneo completo.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no se pudo ejecutar lsof: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("lsof terminó con código {code:?}: {stderr}")]
    UnexpectedExit { code: Option<i32>, stderr: String },
}

/// Escanea los puertos TCP en escucha del sistema.
///
/// Ejecuta `lsof -iTCP -sTCP:LISTEN -n -P +c 0`. El orden de los
/// registros es el de `lsof`; quien necesite orden estable debe
/// ordenar por puerto.
///
/// # Returns
/// Vector con los puertos encontrados (vacío si `lsof` no encontró
/// ninguno), o `ScanError` si el comando falló.
pub fn scan_open_ports() -> Result<Vec<PortInfo>, ScanError> {
    let result = Command::new("lsof").args(LSOF_ARGS).output();

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            log::error!("Consulta lsof fallida: args={:?}, error={}", LSOF_ARGS, e);
            return Err(ScanError::Spawn(e));
        }
    };

    let ports = ports_from_lsof(output.status.code(), &output.stdout, &output.stderr);
    match &ports {
        Ok(found) => log::info!(
            "Consulta lsof correcta: args={:?}, {} puertos",
            LSOF_ARGS,
            found.len()
        ),
        Err(e) => log::error!("Consulta lsof fallida: args={:?}, error={}", LSOF_ARGS, e),
    }
    ports
}

/// Interpreta el resultado de una ejecución de `lsof`.
///
/// El código 1 significa "ningún socket coincide" y
/// no es un error. Cualquier otro código distinto de 0 sí lo es.
fn ports_from_lsof(
    code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<Vec<PortInfo>, ScanError> {
    match code {
        Some(0) => Ok(parse_lsof_output(&String::from_utf8_lossy(stdout))),
        Some(LSOF_NOTHING_FOUND) => Ok(Vec::new()),
        code => Err(ScanError::UnexpectedExit {
            code,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }),
    }
}

/// Parsea la salida completa de `lsof`, descartando las líneas que no
/// forman un registro (encabezado, líneas vacías o malformadas).
pub fn parse_lsof_output(output: &str) -> Vec<PortInfo> {
    output
        .lines()
        .filter_map(|line| match parse_lsof_line(line) {
            Ok(info) => Some(info),
            Err(e) => {
                if !line.trim().is_empty() && e != ParseError::HeaderLine {
                    log::debug!("Línea de lsof descartada ({}): {:?}", e, line);
                }
                None
            }
        })
        .collect()
}

/// Parsea una línea individual de la salida de `lsof`.
///
/// Formato esperado:
/// ```text
/// node      12345 user   23u  IPv4 0x1234      0t0  TCP *:3000 (LISTEN)
/// ```
///
/// Las columnas no tienen ancho fijo y varían entre plataformas, así
/// que el protocolo se localiza por contenido a partir de la columna 7
/// y la dirección es el token siguiente.
pub fn parse_lsof_line(line: &str) -> Result<PortInfo, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_FIELDS {
        return Err(ParseError::InsufficientFields(fields.len()));
    }

    if fields[0] == LSOF_HEADER {
        return Err(ParseError::HeaderLine);
    }

    let pid = match fields[1].parse::<u32>() {
        Ok(pid) if pid > 0 => pid,
        _ => return Err(ParseError::InvalidPid(fields[1].to_string())),
    };

    let (protocol, address) = fields[PROTOCOL_SCAN_START..]
        .windows(2)
        .find_map(|pair| Protocol::from_token(pair[0]).map(|proto| (proto, pair[1])))
        .ok_or(ParseError::ProtocolNotFound)?;

    let port = extract_port(address)?;
    let process_name = unescape_lsof(fields[0]);

    Ok(PortInfo {
        port,
        command: process_name.clone(),
        process_name,
        pid,
        protocol,
    })
}

/// Extrae el puerto de un campo `dirección:puerto`.
///
/// Se usa el último ':' para no partir direcciones IPv6 como `[::1]:8080`.
fn extract_port(address: &str) -> Result<u16, ParseError> {
    let invalid = || ParseError::InvalidPort(address.to_string());
    let (_, port_str) = address.rsplit_once(':').ok_or_else(invalid)?;
    match port_str.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(invalid()),
    }
}

/// Decodifica las secuencias `\xHH` con las que `lsof` escapa
/// caracteres especiales en la columna COMMAND.
///
/// Las secuencias incompletas o con dígitos no hexadecimales se
/// conservan tal cual. Los bytes resultantes se interpretan como UTF-8
/// (con reemplazo si no son válidos).
pub fn unescape_lsof(name: &str) -> String {
    // Camino rápido: sin escapes no hay nada que hacer
    if !name.contains("\\x") {
        return name.to_string();
    }

    let bytes = name.as_bytes();
    let mut decoded: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 2]), hex_value(bytes[i + 3])) {
                decoded.push(hi << 4 | lo);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

/// Obtiene la línea de comando completa de un proceso.
///
/// Ejecuta `ps -p PID -o command=`. Devuelve cadena vacía ante
/// cualquier fallo; el llamador usa entonces el nombre corto.
pub fn get_full_command(pid: u32) -> String {
    let result = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .output();

    match result {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(_) => String::new(),
        Err(e) => {
            log::debug!("No se pudo obtener el comando del PID {}: {}", pid, e);
            String::new()
        }
    }
}
