//! # Sistema de Routing
//! src/router/mod.rs
//!
//! ```text
//! Request → Router → Handler(&Request, &Context) → Response
//! ```
//!
//! El router examina el path del request y lo dirige al handler apropiado.
//! Si no hay handler para ese path retorna 404; si el método no es GET ni
//! HEAD retorna 405.

use std::sync::Arc;

use crate::app::HitStore;
use crate::config::ServerConfig;
use crate::http::{Method, Request, Response, StatusCode};
use crate::metrics::ServerStats;
use crate::server::Mode;
use crate::workers::WorkerPool;

/// Valor del header `Server`
pub const SERVER_NAME: &str = concat!("http_frontend/", env!("CARGO_PKG_VERSION"));

/// Estado compartido que ven los handlers
pub struct Context {
    pub config: ServerConfig,
    pub mode: Mode,
    pub stats: Arc<ServerStats>,
    pub pool: Option<Arc<dyn WorkerPool>>,
    pub hits: Arc<HitStore>,
}

/// Un handler recibe el request y el contexto y retorna una respuesta
pub type Handler = fn(&Request, &Context) -> Response;

/// Router que mapea paths a handlers
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, Handler)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra una ruta; un path repetido reemplaza al anterior
    pub fn register(&mut self, path: &str, handler: Handler) {
        match self.routes.iter_mut().find(|(p, _)| p == path) {
            Some(route) => route.1 = handler,
            None => self.routes.push((path.to_string(), handler)),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(p, _)| p.as_str())
    }

    /// Encuentra y ejecuta el handler del request
    pub fn route(&self, request: &Request, ctx: &Context) -> Response {
        let path = request.path();

        let mut response = match self.routes.iter().find(|(p, _)| p == path) {
            None => Response::error(StatusCode::NotFound, &format!("Route not found: {}", path)),
            Some(_) if !matches!(request.method(), Method::GET | Method::HEAD) => Response::error(
                StatusCode::MethodNotAllowed,
                &format!("Method not allowed: {}", request.method().as_str()),
            ),
            Some((_, handler)) => handler(request, ctx),
        };

        response.add_header("Server", SERVER_NAME);
        response
    }
}
