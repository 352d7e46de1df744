/// Cliente del servicio de nombres.
///
/// Pide a una API compatible con OpenAI chat completions un nombre
/// corto de servicio a partir de la línea de comando de un proceso.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::UNKNOWN_SERVICE;
use crate::config::LlmSettings;

/// Tiempo máximo de una petición al servicio de nombres
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NamingError {
    #[error("servicio de nombres no configurado")]
    NotConfigured,
    #[error("petición fallida: {0}")]
    Http(#[from] reqwest::Error),
    #[error("error de la API (estado {status}): {body}")]
    Status { status: u16, body: String },
    #[error("respuesta inválida: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("la respuesta no contiene opciones")]
    NoChoices,
}

/// Quien sabe ponerle nombre de servicio a una línea de comando.
///
/// Devuelve [`UNKNOWN_SERVICE`] cuando no puede identificarlo.
pub trait ServiceNamer: Send + Sync {
    fn rewrite_name(&self, command: &str) -> Result<String, NamingError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    /// Puede llegar como `null` (p. ej. en rechazos)
    #[serde(default)]
    content: Option<String>,
}

/// Cliente HTTP bloqueante del servicio de nombres.
pub struct LlmClient {
    http: reqwest::blocking::Client,
    settings: LlmSettings,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, NamingError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, settings })
    }

    fn request(&self, command: &str) -> Result<String, NamingError> {
        if self.settings.url.is_empty() || self.settings.api_key.is_empty() {
            return Err(NamingError::NotConfigured);
        }

        let body = ChatRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: build_prompt(command),
            }],
        };

        log::debug!(
            "Enviando petición a {} con modelo {}",
            self.settings.url,
            self.settings.model
        );

        let response = self
            .http
            .post(&self.settings.url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(NamingError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        extract_service_name(&text)
    }
}

impl ServiceNamer for LlmClient {
    fn rewrite_name(&self, command: &str) -> Result<String, NamingError> {
        let result = self.request(command);
        match &result {
            Ok(name) => log::info!(
                "Nombre de servicio obtenido: command={}, service_name={}",
                command,
                name
            ),
            Err(e) => log::error!(
                "Petición de nombre fallida: command={}, error={}",
                command,
                e
            ),
        }
        result
    }
}

/// Construye el prompt para extraer el nombre de servicio.
fn build_prompt(command: &str) -> String {
    format!(
        r#"You are an expert at analysing process command lines. Extract a short service name from the raw command.

Rules:
1. Identify the service or tool the command actually runs
2. The answer must be short, usually one word or a short name
3. If the specific service cannot be identified, answer "{unknown}"
4. Answer only with the service name, no explanation

Examples:
- Input: node /opt/homebrew/bin/claude-code-ui --database-path /Users/xxx/.config/claude-code-ui/db.db
- Output: claude-code-ui

- Input: /usr/bin/python3 -m http.server 8000
- Output: http.server

- Input: /Applications/Antigravity.app/Contents/MacOS/Electron .
- Output: Antigravity

- Input: node a.js
- Output: {unknown}

Now analyse this command:
{command}"#,
        unknown = UNKNOWN_SERVICE,
        command = command
    )
}

/// Extrae el nombre de la primera opción de la respuesta.
///
/// Se recortan espacios, comillas y puntuación final. Una respuesta
/// vacía, nula o que sea "unknown" en cualquier forma cuenta como
/// [`UNKNOWN_SERVICE`].
fn extract_service_name(body: &str) -> Result<String, NamingError> {
    let response: ChatResponse = serde_json::from_str(body)?;
    let choice = response.choices.into_iter().next().ok_or(NamingError::NoChoices)?;
    let content = choice.message.content.unwrap_or_default();

    let name = content
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ',' | ';' | ':'))
        .trim();

    if name.is_empty() || name.eq_ignore_ascii_case(UNKNOWN_SERVICE) {
        Ok(UNKNOWN_SERVICE.to_string())
    } else {
        Ok(name.to_string())
    }
}
