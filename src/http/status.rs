//! # Códigos de Estado HTTP
//! src/http/status.rs
//!
//! Subconjunto de códigos que usa la aplicación por defecto:
//!
//! - **2xx**: Éxito (200)
//! - **4xx**: Error del cliente (400, 404, 405, 413)
//! - **5xx**: Error del servidor (500)

/// Códigos de estado soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,

    /// Request malformado
    BadRequest = 400,

    /// Ruta no registrada
    NotFound = 404,

    /// La ruta existe pero no acepta el método
    MethodNotAllowed = 405,

    /// Headers más largos que el buffer del handler
    PayloadTooLarge = 413,

    InternalServerError = 500,
}

impl StatusCode {
    /// # Ejemplo
    /// ```
    /// use http_frontend::http::StatusCode;
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.as_u16())
    }
}

impl std::fmt::Display for StatusCode {
    /// Formato: "200 OK"
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason_phrase())
    }
}
