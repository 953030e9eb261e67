//! # Construcción de URLs
//! src/url.rs
//!
//! Compone URLs visibles desde afuera a partir de la URL base resuelta por
//! `ServerConfig::resolve_external_url`, un recurso u objeto y un mapa de
//! parámetros JSON.
//!
//! Reglas de los parámetros:
//! - `null` se descarta (y al parchear, elimina el parámetro existente)
//! - `nocache: true` se reemplaza por un nonce temporal `_nc=<ms>`
//! - strings, números y booleanos se codifican con percent-encoding

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

/// Parámetro booleano que fuerza a saltar caches
pub const CACHE_BUST_KEY: &str = "nocache";

/// Nombre del parámetro que reemplaza a `nocache`
pub const NONCE_KEY: &str = "_nc";

/// URL de un recurso: `{base}/{path}?{params}`
///
/// # Ejemplo
/// ```
/// use http_frontend::url::build_resource_url;
/// use serde_json::json;
///
/// let params = json!({"page": 2, "filter": null});
/// let url = build_resource_url("http://localhost:8080", "/static/app.css", params.as_object().unwrap());
/// assert_eq!(url, "http://localhost:8080/static/app.css?page=2");
/// ```
pub fn build_resource_url(base: &str, path: &str, params: &Map<String, Value>) -> String {
    let mut url = join(base, path);
    append_query(&mut url, &serialize(params));
    url
}

/// URL de un objeto: `{base}/{id}[/{action}]?{params}`
pub fn build_object_url(base: &str, object_id: &str, action: Option<&str>, params: &Map<String, Value>) -> String {
    let mut url = join(base, &encode_component(object_id));
    if let Some(action) = action.filter(|a| !a.is_empty()) {
        url = join(&url, action);
    }
    append_query(&mut url, &serialize(params));
    url
}

/// Reemplaza o agrega parámetros en una URL existente
///
/// Los parámetros con valor `null` se eliminan de la URL.
pub fn patch_url_parameters(url: &str, params: &Map<String, Value>) -> String {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    };

    // Pares existentes, en orden
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (p.to_string(), String::new()),
        })
        .collect();

    for (key, value) in params {
        let encoded_key = encode_component(key);
        match render(key, value) {
            Some((new_key, new_value)) => {
                pairs.retain(|(k, _)| *k != encoded_key);
                let new_key = encode_component(&new_key);
                match pairs.iter_mut().find(|(k, _)| *k == new_key) {
                    Some(pair) => pair.1 = new_value,
                    None => pairs.push((new_key, new_value)),
                }
            }
            None => pairs.retain(|(k, _)| *k != encoded_key),
        }
    }

    let mut patched = path.to_string();
    let query = pairs
        .into_iter()
        .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
        .collect::<Vec<_>>();
    append_query(&mut patched, &query);
    patched
}

/// Une base y path con exactamente una barra
fn join(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn append_query(url: &mut String, pairs: &[String]) {
    if pairs.is_empty() {
        return;
    }
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&pairs.join("&"));
}

fn serialize(params: &Map<String, Value>) -> Vec<String> {
    params
        .iter()
        .filter_map(|(key, value)| render(key, value))
        .map(|(k, v)| format!("{}={}", encode_component(&k), v))
        .collect()
}

/// Convierte un parámetro a (clave, valor codificado); `None` = descartar
fn render(key: &str, value: &Value) -> Option<(String, String)> {
    if key == CACHE_BUST_KEY {
        return match value {
            Value::Bool(true) => Some((NONCE_KEY.to_string(), nonce())),
            _ => None,
        };
    }

    let raw = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    Some((key.to_string(), encode_component(&raw)))
}

/// Nonce basado en el tiempo actual (milisegundos)
fn nonce() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

/// Percent-encoding de un componente de URL (RFC 3986, caracteres no reservados)
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
