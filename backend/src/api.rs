use std::future::{ready, Ready};

use actix_cors::Cors;
use actix_web::{
    dev::Payload,
    error::{JsonPayloadError, QueryPayloadError},
    get,
    http::{header, StatusCode},
    middleware::Logger,
    patch, post,
    web::{self, Data},
    App, FromRequest, HttpRequest, HttpResponse, HttpServer, Responder, ResponseError,
};
use airiq_common::req::{IngestPayload, RangeQuery, SensorPatch};
use log::{error, info, warn};

use crate::config::{DeviceKeys, Settings};
use crate::db::Store;
use crate::error::StoreError;
use crate::{ingest, query};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid device key")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Store(StoreError::StorageUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(StoreError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{self}");
        }
        HttpResponse::build(status).json(serde_json::json!({ "detail": self.to_string() }))
    }
}

/// Marker extractor: present only when the request carries an allowed device key.
pub struct DeviceAuth;

impl FromRequest for DeviceAuth {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authorize(req).map(|()| DeviceAuth))
    }
}

fn authorize(req: &HttpRequest) -> Result<(), ApiError> {
    let keys = req.app_data::<Data<DeviceKeys>>().ok_or(ApiError::Unauthorized)?;
    let credentials = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let (scheme, token) = credentials.split_once(' ').unwrap_or_default();

    if scheme.eq_ignore_ascii_case("bearer") && keys.contains(token) {
        Ok(())
    } else {
        warn!("rejected ingest from {:?}", req.peer_addr());
        Err(ApiError::Unauthorized)
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[post("/ingest")]
async fn api_ingest(
    _auth: DeviceAuth,
    payload: web::Json<IngestPayload>,
    store: Data<Store>,
) -> Result<impl Responder, ApiError> {
    let res = ingest::ingest(&store, payload.into_inner()).await?;
    Ok(web::Json(res))
}

#[get("/sensors")]
async fn api_sensors(store: Data<Store>) -> Result<impl Responder, ApiError> {
    Ok(web::Json(query::list_sensors(&store).await?))
}

#[get("/sensors/{sensor_id}/latest")]
async fn api_sensor_latest(
    path: web::Path<String>,
    store: Data<Store>,
) -> Result<impl Responder, ApiError> {
    Ok(web::Json(
        query::latest_for_sensor(&store, path.into_inner()).await?,
    ))
}

#[patch("/sensors/{sensor_id}")]
async fn api_patch_sensor(
    path: web::Path<String>,
    patch: web::Json<SensorPatch>,
    store: Data<Store>,
) -> Result<impl Responder, ApiError> {
    let sensor = query::patch_sensor(&store, path.into_inner(), patch.into_inner()).await?;
    Ok(web::Json(sensor))
}

#[get("/map/latest")]
async fn api_map_latest(store: Data<Store>) -> Result<impl Responder, ApiError> {
    Ok(web::Json(query::fleet_snapshot(&store).await?))
}

#[get("/readings")]
async fn api_readings(
    params: web::Query<RangeQuery>,
    store: Data<Store>,
) -> Result<impl Responder, ApiError> {
    Ok(web::Json(query::range(&store, params.into_inner()).await?))
}

fn json_error(err: JsonPayloadError, _: &HttpRequest) -> actix_web::Error {
    ApiError::from(StoreError::Validation(err.to_string())).into()
}

fn query_error(err: QueryPayloadError, _: &HttpRequest) -> actix_web::Error {
    ApiError::from(StoreError::Validation(err.to_string())).into()
}

/// Mounts every route; the API routes live under `prefix`, `/health` at the root.
pub fn routes(cfg: &mut web::ServiceConfig, prefix: &str) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .app_data(web::QueryConfig::default().error_handler(query_error))
        .service(health)
        .service(
            web::scope(prefix)
                .service(api_ingest)
                .service(api_sensors)
                .service(api_sensor_latest)
                .service(api_patch_sensor)
                .service(api_map_latest)
                .service(api_readings),
        );
}

fn cors(origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);
    if origins.iter().any(|origin| origin == "*") {
        cors.allow_any_origin()
    } else {
        origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

pub async fn new_http_server(store: Store, settings: Settings) -> std::io::Result<()> {
    if settings.device_keys.is_empty() {
        warn!("DEVICE_API_KEYS is empty, every ingest will be rejected");
    }
    info!(
        "listening on {}:{}{}",
        settings.bind_addr, settings.port, settings.api_prefix
    );

    let bind = (settings.bind_addr.clone(), settings.port);
    HttpServer::new(move || {
        App::new()
            .app_data(Data::new(store.clone()))
            .app_data(Data::new(settings.device_keys.clone()))
            .configure(|cfg| routes(cfg, &settings.api_prefix))
            .wrap(cors(&settings.cors_origins))
            .wrap(Logger::default())
    })
    .bind(bind)?
    .run()
    .await
}
