//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Routes translate
//! transport requests into service calls and map structured errors back to
//! status codes. The authentication collaborator in front of this gateway
//! supplies `X-Actor-Id` and `X-Actor-Role`; the core trusts both.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Args;
use crate::ledger::LedgerStage;
use crate::services::{AnnotationInput, ProvenanceService, RegisterProductInput, StageInput};
use crate::types::{Actor, ActorRole, Result, TraceError};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub service: ProvenanceService,
}

impl AppState {
    pub fn new(args: Args, service: ProvenanceService) -> Self {
        Self { args, service }
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Fieldtrace listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - missing actor headers fall back to a dev identity");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "node_id": state.args.node_id,
            }),
        ),

        // Version info for deployment verification
        (Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }),
        ),

        // CORS preflight
        (Method::OPTIONS, _) => preflight_response(),

        // Register a product: stage 0 plus the seeded record
        (Method::POST, "/api/products") => handle_register(state, req).await,

        // Tag discovery
        (Method::GET, "/api/products") => match state.service.list_tags().await {
            Ok(tags) => json_response(StatusCode::OK, serde_json::json!({ "tags": tags })),
            Err(e) => error_response(&e),
        },

        // Ledger history for one tag
        (Method::GET, p)
            if p.starts_with("/api/products/") && p.ends_with("/stages") =>
        {
            let tag = p
                .strip_prefix("/api/products/")
                .and_then(|s| s.strip_suffix("/stages"))
                .unwrap_or("");
            match state.service.get_stages(tag).await {
                Ok(stages) => {
                    let stages: Vec<serde_json::Value> = stages
                        .iter()
                        .map(|s| stage_with_locator(s, |h| state.service.media_locator(h)))
                        .collect();
                    json_response(StatusCode::OK, serde_json::json!({ "stages": stages }))
                }
                Err(e) => error_response(&e),
            }
        }

        // Intermediate handling stage
        (Method::POST, p)
            if p.starts_with("/api/products/") && p.ends_with("/stages") =>
        {
            let tag = p
                .strip_prefix("/api/products/")
                .and_then(|s| s.strip_suffix("/stages"))
                .unwrap_or("")
                .to_string();
            handle_stage(state, req, &tag, false).await
        }

        // Final delivery stage, closes the tag
        (Method::POST, p)
            if p.starts_with("/api/products/") && p.ends_with("/final") =>
        {
            let tag = p
                .strip_prefix("/api/products/")
                .and_then(|s| s.strip_suffix("/final"))
                .unwrap_or("")
                .to_string();
            handle_stage(state, req, &tag, true).await
        }

        // Reconciled journey for one tag
        (Method::GET, p) if p.starts_with("/api/journey/") => {
            let tag = p.strip_prefix("/api/journey/").unwrap_or("");
            match state.service.journey(tag).await {
                Ok(view) => json_response(StatusCode::OK, serde_json::json!(view)),
                Err(e) => error_response(&e),
            }
        }

        // Product record with its annotation log
        (Method::GET, p) if p.starts_with("/api/records/") && !p.contains("/annotations") => {
            let product_id = p.strip_prefix("/api/records/").unwrap_or("");
            match state.service.get_record(product_id).await {
                Ok(Some(record)) => json_response(StatusCode::OK, serde_json::json!(record)),
                Ok(None) => error_response(&TraceError::NotFound(format!(
                    "record {}",
                    product_id
                ))),
                Err(e) => error_response(&e),
            }
        }

        // Append an annotation
        (Method::POST, p)
            if p.starts_with("/api/records/") && p.ends_with("/annotations") =>
        {
            let product_id = p
                .strip_prefix("/api/records/")
                .and_then(|s| s.strip_suffix("/annotations"))
                .unwrap_or("")
                .to_string();
            handle_annotate(state, req, &product_id).await
        }

        // Delist a product, releasing its media
        (Method::DELETE, p) if p.starts_with("/api/records/") => {
            let product_id = p.strip_prefix("/api/records/").unwrap_or("").to_string();
            handle_delist(state, req, &product_id).await
        }

        // Raw media upload for the upload collaborator
        (Method::PUT, "/store") => handle_store_put(state, req).await,

        // Media fetch by content hash
        (Method::GET, p) if p.starts_with("/store/") => {
            let hash = p.strip_prefix("/store/").unwrap_or("");
            match state.service.media(hash).await {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/octet-stream")
                    .header("Cache-Control", "public, max-age=31536000, immutable")
                    .body(Full::new(bytes))
                    .unwrap_or_else(|_| {
                        error_response(&TraceError::Internal("response build failed".into()))
                    }),
                Err(e) => error_response(&e),
            }
        }

        // Not found
        _ => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Not Found", "path": path }),
        ),
    };

    Ok(response)
}

/// Registration request body
#[derive(Deserialize)]
struct RegisterRequest {
    tag: String,
    name: String,
    product_type: String,
    origin: String,
    harvest_date: DateTime<Utc>,
    location: String,
    description: String,
    #[serde(default)]
    image_base64: Option<String>,
}

/// Stage request body, shared by intermediate and final
#[derive(Deserialize)]
struct StageRequest {
    location: String,
    description: String,
    #[serde(default)]
    image_base64: Option<String>,
}

/// Annotation request body
#[derive(Deserialize)]
struct AnnotationRequest {
    location: String,
    description: String,
    #[serde(default)]
    image_base64: Option<String>,
}

async fn handle_register(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let actor = match actor_from(&req, &state.args) {
        Ok(actor) => actor,
        Err(e) => return error_response(&e),
    };
    let request: RegisterRequest = match read_json(req).await {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let image = match decode_image(request.image_base64.as_deref()) {
        Ok(image) => image,
        Err(e) => return error_response(&e),
    };

    let input = RegisterProductInput {
        tag: request.tag,
        name: request.name,
        product_type: request.product_type,
        origin: request.origin,
        harvest_date: request.harvest_date,
        location: request.location,
        description: request.description,
        image,
    };

    match state.service.register_product(input, &actor).await {
        Ok(registered) => json_response(
            StatusCode::CREATED,
            serde_json::json!({
                "product_id": registered.product_id,
                "stage": registered.stage_ref,
                "freshness": {
                    "score": registered.freshness.score,
                    "is_fresh": registered.freshness.is_fresh,
                    "label": registered.freshness.label,
                },
                "media_locator": registered.media_locator,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

async fn handle_stage(
    state: Arc<AppState>,
    req: Request<Incoming>,
    tag: &str,
    is_final: bool,
) -> Response<Full<Bytes>> {
    let actor = match actor_from(&req, &state.args) {
        Ok(actor) => actor,
        Err(e) => return error_response(&e),
    };
    let request: StageRequest = match read_json(req).await {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let image = match decode_image(request.image_base64.as_deref()) {
        Ok(image) => image,
        Err(e) => return error_response(&e),
    };

    let input = StageInput {
        location: request.location,
        description: request.description,
        image,
    };

    let result = if is_final {
        state.service.record_final(tag, input, &actor).await
    } else {
        state.service.record_intermediate(tag, input, &actor).await
    };

    match result {
        Ok(stage_ref) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "stage": stage_ref }),
        ),
        Err(e) => error_response(&e),
    }
}

async fn handle_annotate(
    state: Arc<AppState>,
    req: Request<Incoming>,
    product_id: &str,
) -> Response<Full<Bytes>> {
    let actor = match actor_from(&req, &state.args) {
        Ok(actor) => actor,
        Err(e) => return error_response(&e),
    };
    let request: AnnotationRequest = match read_json(req).await {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let image = match decode_image(request.image_base64.as_deref()) {
        Ok(image) => image,
        Err(e) => return error_response(&e),
    };

    let input = AnnotationInput {
        location: request.location,
        description: request.description,
        image,
    };

    match state.service.annotate(product_id, input, &actor).await {
        Ok(annotation) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "annotation": annotation }),
        ),
        Err(e) => error_response(&e),
    }
}

async fn handle_delist(
    state: Arc<AppState>,
    req: Request<Incoming>,
    product_id: &str,
) -> Response<Full<Bytes>> {
    let actor = match actor_from(&req, &state.args) {
        Ok(actor) => actor,
        Err(e) => return error_response(&e),
    };

    match state.service.delist_product(product_id, &actor).await {
        Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "deleted": product_id })),
        Err(e) => error_response(&e),
    }
}

async fn handle_store_put(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Store upload body error: {}", e);
            return error_response(&TraceError::BadRequest(
                "failed to read request body".into(),
            ));
        }
    };
    if body.is_empty() {
        return error_response(&TraceError::BadRequest("empty upload".into()));
    }

    match state.service.store_media(body).await {
        Ok(hash) => {
            let locator = state.service.media_locator(&hash);
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "hash": hash, "locator": locator }),
            )
        }
        Err(e) => error_response(&e),
    }
}

/// Resolve the acting identity from request headers. Dev mode substitutes a
/// fixed farmer identity when the headers are absent.
fn actor_from(req: &Request<Incoming>, args: &Args) -> Result<Actor> {
    let id = req
        .headers()
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let role = req
        .headers()
        .get("x-actor-role")
        .and_then(|v| v.to_str().ok())
        .map(ActorRole::parse)
        .unwrap_or(ActorRole::Consumer);

    match id {
        Some(id) => Ok(Actor { id, role }),
        None if args.dev_mode => Ok(Actor::new("dev-farmer", ActorRole::Farmer)),
        None => Err(TraceError::BadRequest(
            "missing X-Actor-Id header".into(),
        )),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = req
        .collect()
        .await
        .map_err(|e| TraceError::BadRequest(format!("failed to read request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| TraceError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn decode_image(image_base64: Option<&str>) -> Result<Option<Bytes>> {
    match image_base64 {
        None => Ok(None),
        Some(encoded) => BASE64
            .decode(encoded)
            .map(|bytes| Some(Bytes::from(bytes)))
            .map_err(|e| TraceError::BadRequest(format!("invalid base64 image: {}", e))),
    }
}

/// Serialize a ledger stage, attaching a gateway locator for its media
fn stage_with_locator(
    stage: &LedgerStage,
    locator_for: impl Fn(&str) -> String,
) -> serde_json::Value {
    let mut value = serde_json::json!(stage);
    if let Some(hash) = &stage.content_hash {
        value["media_locator"] = serde_json::Value::String(locator_for(hash));
    }
    value
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(err: &TraceError) -> Response<Full<Bytes>> {
    json_response(
        err.status_code(),
        serde_json::json!({ "error": err.to_string() }),
    )
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        )
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_image_accepts_absent() {
        assert_eq!(decode_image(None).unwrap(), None);
    }

    #[test]
    fn test_decode_image_round_trips() {
        let encoded = BASE64.encode(b"jpeg bytes");
        let decoded = decode_image(Some(&encoded)).unwrap().unwrap();
        assert_eq!(decoded.as_ref(), b"jpeg bytes");
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        let err = decode_image(Some("not base64 !!!")).unwrap_err();
        assert!(matches!(err, TraceError::BadRequest(_)));
    }

    #[test]
    fn test_stage_serialization_adds_media_locator() {
        let stage = LedgerStage {
            tag: "T1".to_string(),
            index: 0,
            kind: crate::ledger::StageKind::Registration,
            content_hash: Some("bafkabc".to_string()),
            freshness_score: Some(90),
            location: "Farm".to_string(),
            handler: "farmer-1".to_string(),
            description: "harvested".to_string(),
            recorded_at: Utc::now(),
        };

        let value = stage_with_locator(&stage, |h| format!("http://gw/store/{}", h));
        assert_eq!(value["media_locator"], "http://gw/store/bafkabc");
        // The raw hash stays available alongside the locator
        assert_eq!(value["content_hash"], "bafkabc");
    }

    #[test]
    fn test_stage_without_media_has_no_locator() {
        let stage = LedgerStage {
            tag: "T1".to_string(),
            index: 1,
            kind: crate::ledger::StageKind::Intermediate,
            content_hash: None,
            freshness_score: None,
            location: "Depot".to_string(),
            handler: "retailer-1".to_string(),
            description: "in transit".to_string(),
            recorded_at: Utc::now(),
        };

        let value = stage_with_locator(&stage, |h| format!("http://gw/store/{}", h));
        assert!(value.get("media_locator").is_none());
    }

    #[test]
    fn test_register_request_parses() {
        let body = serde_json::json!({
            "tag": "T1",
            "name": "Tomatoes",
            "product_type": "vegetable",
            "origin": "Field 3",
            "harvest_date": "2024-06-01T08:00:00Z",
            "location": "Farm",
            "description": "harvested",
        });
        let parsed: RegisterRequest = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.tag, "T1");
        assert!(parsed.image_base64.is_none());
    }
}
