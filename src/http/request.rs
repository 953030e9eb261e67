//! # Parsing de Requests HTTP/1.x
//! src/http/request.rs
//!
//! Parser mínimo de HTTP/1.0 y HTTP/1.1 para la aplicación por defecto.
//!
//! ## Formato de un Request
//!
//! ```text
//! GET /path?param1=value1&param2=value2 HTTP/1.1\r\n
//! Host: localhost:8080\r\n
//! Connection: keep-alive\r\n
//! \r\n
//! ```
//!
//! Los nombres de header no distinguen mayúsculas. El body se toma de los
//! bytes que siguen a la línea vacía, hasta `Content-Length`.

use std::collections::HashMap;

use thiserror::Error;

/// Métodos HTTP soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    /// Como GET pero sin body en la respuesta
    HEAD,
    POST,
}

impl Method {
    fn parse(s: &str) -> Result<Self, ParseError> {
        match s {
            "GET" => Ok(Method::GET),
            "HEAD" => Ok(Method::HEAD),
            "POST" => Ok(Method::POST),
            _ => Err(ParseError::UnsupportedMethod(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
        }
    }
}

/// Versión del protocolo del request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    fn parse(s: &str) -> Result<Self, ParseError> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(ParseError::InvalidHttpVersion(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Request HTTP parseado
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query_params: HashMap<String, String>,
    /// Nombres tal como llegaron
    headers: HashMap<String, String>,
    version: Version,
    body: Vec<u8>,
}

/// Errores de parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Incomplete HTTP request")]
    IncompleteRequest,

    #[error("Invalid request line format")]
    InvalidRequestLine,

    #[error("Unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidHttpVersion(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Empty request")]
    EmptyRequest,
}

/// Posición del fin de los headers (después de `\r\n\r\n`)
pub fn head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

impl Request {
    /// Parsea un request completo (headers y body)
    ///
    /// # Ejemplo
    ///
    /// ```
    /// use http_frontend::http::Request;
    ///
    /// let raw = b"GET /status?verbose=1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
    /// let request = Request::parse(raw).unwrap();
    ///
    /// assert_eq!(request.path(), "/status");
    /// assert_eq!(request.query_param("verbose"), Some("1"));
    /// assert!(request.keep_alive());
    /// ```
    pub fn parse(buffer: &[u8]) -> Result<Self, ParseError> {
        if buffer.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::EmptyRequest);
        }

        let end = head_end(buffer).ok_or(ParseError::IncompleteRequest)?;
        let mut request = Self::parse_head(&buffer[..end])?;

        let length = request.content_length()?;
        let available = &buffer[end..];
        if available.len() < length {
            return Err(ParseError::IncompleteRequest);
        }
        request.body = available[..length].to_vec();
        Ok(request)
    }

    /// Parsea solo la línea de request y los headers; el body queda vacío
    ///
    /// Sirve para conocer el `Content-Length` antes de leer el body.
    pub fn parse_head(head: &[u8]) -> Result<Self, ParseError> {
        let head = std::str::from_utf8(head).map_err(|_| ParseError::InvalidRequestLine)?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or(ParseError::IncompleteRequest)?;
        let (method, path, query_params, version) = Self::parse_request_line(request_line)?;
        let headers = Self::parse_headers(lines)?;

        Ok(Request {
            method,
            path,
            query_params,
            headers,
            version,
            body: Vec::new(),
        })
    }

    /// Formato: `GET /path?query HTTP/1.1`
    fn parse_request_line(line: &str) -> Result<(Method, String, HashMap<String, String>, Version), ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [method, target, version] = parts.as_slice() else {
            return Err(ParseError::InvalidRequestLine);
        };

        let method = Method::parse(method)?;
        let version = Version::parse(version)?;
        let (path, query_params) = Self::parse_path_and_query(target);
        Ok((method, path, query_params, version))
    }

    fn parse_path_and_query(target: &str) -> (String, HashMap<String, String>) {
        match target.split_once('?') {
            Some((path, query)) => (url_decode(path), Self::parse_query_string(query)),
            None => (url_decode(target), HashMap::new()),
        }
    }

    fn parse_query_string(query: &str) -> HashMap<String, String> {
        query
            .split('&')
            .filter(|param| !param.is_empty())
            .map(|param| match param.split_once('=') {
                Some((key, value)) => (url_decode(key), url_decode(value)),
                // Parámetro sin valor (ej: "?debug")
                None => (url_decode(param), String::new()),
            })
            .collect()
    }

    fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HashMap<String, String>, ParseError> {
        let mut headers = HashMap::new();
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(headers)
    }

    /// Largo del body declarado (0 si no hay header)
    pub fn content_length(&self) -> Result<usize, ParseError> {
        match self.header("Content-Length") {
            Some(value) => value
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string())),
            None => Ok(0),
        }
    }

    /// Si el cliente quiere mantener la conexión abierta
    ///
    /// HTTP/1.1 es persistente salvo `Connection: close`; HTTP/1.0 solo con
    /// `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").map(|v| v.to_ascii_lowercase());
        match self.version {
            Version::Http11 => connection.as_deref() != Some("close"),
            Version::Http10 => connection.as_deref() == Some("keep-alive"),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|s| s.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Busca un header sin distinguir mayúsculas
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Decodifica `%XX` y `+`; las secuencias inválidas quedan tal cual
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
