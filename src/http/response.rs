//! # Construcción de Respuestas HTTP
//! src/http/response.rs
//!
//! API para construir respuestas y serializarlas con la versión de
//! protocolo que anuncia el servidor.
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-Type: application/json\r\n
//! Content-Length: 13\r\n
//! Connection: keep-alive\r\n
//! \r\n
//! {"ok": true}
//! ```
//!
//! ## Ejemplo de uso
//!
//! ```
//! use http_frontend::http::{Response, StatusCode};
//!
//! let response = Response::new(StatusCode::Ok)
//!     .with_header("Content-Type", "text/plain")
//!     .with_body("Hello");
//!
//! let bytes = response.to_bytes("1.1");
//! assert!(bytes.starts_with(b"HTTP/1.1 200 OK\r\n"));
//! ```

use serde_json::{json, Value};

use super::StatusCode;

/// Respuesta HTTP completa
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    /// En orden de inserción; un nombre repetido reemplaza al anterior
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Respuesta sin headers ni body
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.add_header(name, value);
        self
    }

    /// Agrega o reemplaza un header (sin distinguir mayúsculas)
    pub fn add_header(&mut self, name: &str, value: &str) {
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(header) => header.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Body de texto; calcula `Content-Length`
    pub fn with_body(self, body: &str) -> Self {
        self.with_body_bytes(body.as_bytes().to_vec())
    }

    pub fn with_body_bytes(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        let length = self.body.len().to_string();
        self.add_header("Content-Length", &length);
        self
    }

    /// Respuesta JSON con el status dado
    pub fn json(status: StatusCode, value: &Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(&value.to_string())
    }

    /// Respuesta de error: `{"error": "mensaje"}`
    ///
    /// # Ejemplo
    /// ```
    /// use http_frontend::http::{Response, StatusCode};
    ///
    /// let response = Response::error(StatusCode::NotFound, "Route not found: /x");
    /// assert_eq!(response.body(), br#"{"error":"Route not found: /x"}"#);
    /// ```
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::json(status, &json!({ "error": message }))
    }

    /// Quita el body pero conserva `Content-Length` (respuestas a HEAD)
    pub fn without_body(mut self) -> Self {
        self.body.clear();
        self
    }

    /// Serializa la respuesta con `HTTP/{version}` en el status line
    pub fn to_bytes(&self, version: &str) -> Vec<u8> {
        let mut result = format!("HTTP/{} {}\r\n", version, self.status).into_bytes();
        for (name, value) in &self.headers {
            result.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        result.extend_from_slice(b"\r\n");
        result.extend_from_slice(&self.body);
        result
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body interpretado como JSON (tests y diagnósticos)
    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}
