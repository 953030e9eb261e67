//! # Módulo HTTP
//! src/http/mod.rs
//!
//! Protocolo de la aplicación por defecto que corre sobre el front-end.
//! El front-end en sí no conoce HTTP: solo ve un `HandlerFactory`.
//!
//! - Parsing de requests HTTP/1.0 y HTTP/1.1
//! - Construcción de responses
//! - Status codes
//! - `HttpHandler`: lee un request del socket, lo rutea y responde,
//!   negociando keep-alive

pub mod handler;
pub mod request;
pub mod response;
pub mod status;

pub use handler::{HttpHandler, HttpHandlerFactory};
pub use request::{Method, ParseError, Request, Version};
pub use response::Response;
pub use status::StatusCode;
