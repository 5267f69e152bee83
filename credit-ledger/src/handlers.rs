use crate::error::LedgerError;
use crate::metrics;
use crate::service::CreditService;
use crate::types::{ActivityQuery, DebitRequest, DepositRequest, GrantId, UserId};
use actix_web::error::InternalError;
use actix_web::http::StatusCode;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use uuid::Uuid;

/// Response envelope shared by every ledger endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<GrantId>,
    pub success: bool,
    pub message: String,
}

impl Envelope {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            id: None,
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            id: None,
            success: false,
            message: message.into(),
        }
    }

    pub fn with_id(mut self, id: GrantId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Transport status for a ledger error
pub fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
        LedgerError::NoCreditHistory { .. }
        | LedgerError::AllCreditsExpired { .. }
        | LedgerError::InsufficientCredit { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection(context: &str, err: &LedgerError) -> HttpResponse {
    HttpResponse::build(status_for(err)).json(Envelope::failure(format!(
        "Unable to process the user's {}. {}",
        context, err
    )))
}

fn decode_error<E: Display + Debug + 'static>(err: E) -> Error {
    let response =
        HttpResponse::BadRequest().json(Envelope::failure(format!("Unable to decode the request. {}", err)));
    InternalError::from_response(err, response).into()
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "credit-ledger",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Create credit endpoint
pub async fn create_credit(
    service: web::Data<Arc<CreditService>>,
    request: web::Json<DepositRequest>,
) -> HttpResponse {
    match service.deposit(request.into_inner()).await {
        Ok(grant_id) => HttpResponse::Ok()
            .json(Envelope::ok("User credit created successfully").with_id(grant_id)),
        Err(e) => rejection("credit", &e),
    }
}

/// Create debit endpoint
pub async fn create_debit(
    service: web::Data<Arc<CreditService>>,
    request: web::Json<DebitRequest>,
) -> HttpResponse {
    match service.withdraw(request.into_inner()).await {
        Ok(_) => HttpResponse::Ok().json(Envelope::ok("User debit has been processed successfully")),
        Err(e) => rejection("debit", &e),
    }
}

/// Transaction history endpoint
pub async fn list_transactions(
    service: web::Data<Arc<CreditService>>,
    user_id: web::Path<Uuid>,
    query: web::Query<ActivityQuery>,
) -> HttpResponse {
    let user_id = UserId::from(user_id.into_inner());

    match service.list_transactions(user_id, query.into_inner()).await {
        Ok(records) if records.is_empty() => HttpResponse::Ok().json(Envelope::ok(
            "Cannot find any transaction history for given user.",
        )),
        Ok(records) => HttpResponse::Ok().json(records),
        Err(e) => rejection("transaction history request", &e),
    }
}

/// Metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

/// Extractor configs that turn decode failures into the failure envelope
pub fn configure_extractors(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req: &HttpRequest| decode_error(err)))
        .app_data(web::QueryConfig::default().error_handler(|err, _req: &HttpRequest| decode_error(err)))
        .app_data(web::PathConfig::default().error_handler(|err, _req: &HttpRequest| decode_error(err)));
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    configure_extractors(cfg);

    cfg.route("/credit", web::post().to(create_credit))
        .route("/debit", web::post().to(create_debit))
        .route(
            "/users/{user_id}/transactions",
            web::get().to(list_transactions),
        )
        .route("/metrics", web::get().to(metrics_endpoint))
        .route("/health", web::get().to(health_check));
}
