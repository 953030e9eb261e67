//! # Comandos del Servidor
//! src/commands/mod.rs
//!
//! Rutas de la aplicación por defecto. Todas responden JSON.
//!
//! | Ruta      | Descripción                                         |
//! |-----------|-----------------------------------------------------|
//! | `/status` | modo, contadores del front-end, pool y URL externa  |
//! | `/stats`  | hits por ruta (`?path=` filtra, `?top=N` limita)    |
//! | `/help`   | lista de rutas                                      |

use serde_json::{json, Map, Value};

use crate::http::{Request, Response, StatusCode};
use crate::router::{Context, Handler, Router};
use crate::url::{build_object_url, build_resource_url, patch_url_parameters};

/// Tabla de rutas: (path, handler, descripción)
pub const ROUTES: &[(&str, Handler, &str)] = &[
    ("/status", status_handler, "Server mode, counters, worker pool and external URL"),
    ("/stats", stats_handler, "Hits per route (?path=ROUTE filters, ?top=N limits)"),
    ("/help", help_handler, "This list"),
];

/// Registra todas las rutas
pub fn register_all(router: &mut Router) {
    for (path, handler, _) in ROUTES {
        router.register(path, *handler);
    }
}

/// URL base externa del request (`?relative` la deja vacía)
fn external_base(req: &Request, ctx: &Context) -> String {
    ctx.config.resolve_external_url(req.headers(), req.query_param("relative").is_some())
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// GET /status
pub fn status_handler(req: &Request, ctx: &Context) -> Response {
    let base = external_base(req, ctx);
    let body = json!({
        "mode": ctx.mode.as_str(),
        "protocol_version": ctx.config.protocol_version_string(),
        "external_url": base,
        "counters": ctx.stats.to_json(),
        "pool": ctx.pool.as_ref().map(|pool| pool.status()),
        "links": {
            "self": build_resource_url(&base, "status", &Map::new()),
            "stats": build_resource_url(&base, "stats", &params(json!({"nocache": true}))),
            "help": build_resource_url(&base, "help", &Map::new()),
        },
    });
    Response::json(StatusCode::Ok, &body)
}

/// GET /stats
pub fn stats_handler(req: &Request, ctx: &Context) -> Response {
    let base = external_base(req, ctx);

    let top = match req.query_param("top").map(str::parse::<usize>) {
        Some(Ok(top)) => Some(top),
        Some(Err(_)) => return Response::error(StatusCode::BadRequest, "top must be a non-negative integer"),
        None => None,
    };

    let mut hits = ctx.hits.snapshot();
    if let Some(path) = req.query_param("path") {
        hits.retain(|(p, _)| p == path);
    }
    let total: u64 = hits.iter().map(|(_, n)| n).sum();
    if let Some(top) = top {
        hits.truncate(top);
    }

    let routes: Vec<Value> = hits
        .iter()
        .map(|(path, count)| {
            json!({
                "path": path,
                "hits": count,
                "url": build_object_url(&base, "stats", None, &params(json!({"path": path}))),
            })
        })
        .collect();

    let mut body = json!({
        "total": total,
        "routes": routes,
    });
    if top.is_some() {
        let current = build_resource_url(&base, "stats", &params(Value::Object(query_map(req))));
        body["all"] = Value::String(patch_url_parameters(&current, &params(json!({"top": null}))));
    }
    Response::json(StatusCode::Ok, &body)
}

/// GET /help
pub fn help_handler(_req: &Request, _ctx: &Context) -> Response {
    let routes: Vec<Value> = ROUTES
        .iter()
        .map(|(path, _, description)| json!({"path": path, "description": description}))
        .collect();
    Response::json(StatusCode::Ok, &json!({ "routes": routes }))
}

fn query_map(req: &Request) -> Map<String, Value> {
    let mut keys: Vec<&String> = req.query_params().keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| (k.clone(), Value::String(req.query_params()[k].clone())))
        .collect()
}
