//! HTTP handler functions for the bloodlink API.

use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, web};
use bloodlink_blood_models::UserRole;
use bloodlink_coordinator::dispatcher::DonorResponse;
use bloodlink_coordinator::lifecycle::{FulfillmentDetails, NewRequest};
use bloodlink_coordinator::roles::Actor;
use bloodlink_coordinator::CoordinatorError;
use bloodlink_database::DbError;
use bloodlink_database_models::HealthProfile;
use bloodlink_server_models::{
    ApiAlert, ApiDonation, ApiDonorStats, ApiError, ApiHealth, ApiLocationAccepted,
    ApiNearbyRequest, ApiRequest, CreateRequestBody, FulfillBody, HealthProfileBody,
    LocationUpdateBody, NearbyQueryParams, RespondBody, ResponseChoice,
};
use bloodlink_spatial::{LocationUpdate, UpsertOutcome};
use chrono::Utc;
use uuid::Uuid;

use crate::AppState;

/// Radius used by `GET /api/requests/nearby` when none is given.
const DEFAULT_NEARBY_RADIUS_M: f64 = 10_000.0;

const USER_ID_HEADER: &str = "X-User-Id";
const USER_ROLE_HEADER: &str = "X-User-Role";

// ── Errors ───────────────────────────────────────────────────────────────

fn error_body(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ApiError {
        error: message.into(),
    })
}

/// Maps a coordinator error onto a status code and JSON body.
fn error_response(e: &CoordinatorError) -> HttpResponse {
    let status = match e {
        CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::Forbidden { .. } => StatusCode::FORBIDDEN,
        CoordinatorError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoordinatorError::InvalidTransition { .. }
        | CoordinatorError::Store(DbError::Conflict { .. }) => StatusCode::CONFLICT,
        CoordinatorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        log::error!("Request failed: {e}");
        return error_body(status, "Internal storage error");
    }
    log::warn!("Rejected: {e}");
    error_body(status, e.to_string())
}

/// Reads the caller identity forwarded by the auth gateway.
fn caller(req: &HttpRequest) -> Result<Actor, HttpResponse> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };
    let user_id = header(USER_ID_HEADER)
        .and_then(|v| v.parse::<Uuid>().ok())
        .ok_or_else(|| error_body(StatusCode::UNAUTHORIZED, "Missing or invalid X-User-Id"))?;
    let role = header(USER_ROLE_HEADER)
        .and_then(|v| v.parse::<UserRole>().ok())
        .ok_or_else(|| error_body(StatusCode::UNAUTHORIZED, "Missing or invalid X-User-Role"))?;
    Ok(Actor::new(user_id, role))
}

// ── Handlers ─────────────────────────────────────────────────────────────

/// `GET /api/health`
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        indexed_donors: state.coordinator.index().len(),
    })
}

/// `POST /api/locations`
///
/// Applies a donor location report. Out-of-order reports are acknowledged
/// but ignored.
pub async fn update_location(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<LocationUpdateBody>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    let body = body.into_inner();
    let update = LocationUpdate {
        donor_id: body.donor_id.unwrap_or(actor.user_id),
        latitude: body.latitude,
        longitude: body.longitude,
        status: body.status,
        is_visible: body.is_visible,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
    };

    match state.coordinator.on_location_update(&actor, update).await {
        Ok(outcome) => {
            let outcome = match outcome {
                UpsertOutcome::Applied => "applied",
                UpsertOutcome::Unchanged => "unchanged",
                UpsertOutcome::Stale => "stale",
            };
            HttpResponse::Ok().json(ApiLocationAccepted {
                donor_id: update.donor_id,
                outcome: outcome.to_string(),
            })
        }
        Err(e) => error_response(&e),
    }
}

/// `PUT /api/health-profiles`
pub async fn upsert_health_profile(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<HealthProfileBody>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    let body = body.into_inner();
    let now = Utc::now();
    let profile = HealthProfile {
        user_id: body.user_id.unwrap_or(actor.user_id),
        blood_type: body.blood_type,
        conditions: body.conditions,
        surgery_date: body.surgery_date,
        last_donation_date: body.last_donation_date,
        donation_frequency: body.donation_frequency,
        is_eligible: body.is_eligible,
        updated_at: now,
    };

    match state
        .coordinator
        .upsert_health_profile(&actor, profile, now)
        .await
    {
        Ok(stored) => HttpResponse::Ok().json(stored),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/requests`
///
/// Creates a request and returns it together with the outcome of its first
/// alert round.
pub async fn create_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateRequestBody>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    let body = body.into_inner();
    let new = NewRequest {
        blood_type_needed: body.blood_type_needed,
        urgency: body.urgency,
        units_needed: body.units_needed,
        latitude: body.latitude,
        longitude: body.longitude,
        location_name: body.location_name,
        contact_phone: body.contact_phone,
        notes: body.notes,
        expires_at: body.expires_at,
    };

    match state
        .coordinator
        .create_request(&actor, new, Utc::now())
        .await
    {
        Ok(created) => HttpResponse::Created().json(serde_json::json!({
            "request": ApiRequest::from(created.request),
            "dispatch": created.dispatch,
        })),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/requests/nearby`
pub async fn nearby_requests(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Query<NearbyQueryParams>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    let radius_m = params.radius_m.unwrap_or(DEFAULT_NEARBY_RADIUS_M);

    match state
        .coordinator
        .nearby_requests(&actor, radius_m, Utc::now())
        .await
    {
        Ok(nearby) => {
            let nearby: Vec<ApiNearbyRequest> = nearby
                .into_iter()
                .map(|n| ApiNearbyRequest {
                    request: n.request.into(),
                    distance_meters: n.distance_meters,
                })
                .collect();
            HttpResponse::Ok().json(nearby)
        }
        Err(e) => error_response(&e),
    }
}

/// `GET /api/requests/{id}`
pub async fn get_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    match state
        .coordinator
        .get_request(&actor, path.into_inner(), Utc::now())
        .await
    {
        Ok(request) => HttpResponse::Ok().json(ApiRequest::from(request)),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/requests/{id}/alerts`
pub async fn request_alerts(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    match state
        .coordinator
        .alerts_for_request(&actor, path.into_inner())
        .await
    {
        Ok(alerts) => {
            let alerts: Vec<ApiAlert> = alerts.into_iter().map(ApiAlert::from).collect();
            HttpResponse::Ok().json(alerts)
        }
        Err(e) => error_response(&e),
    }
}

/// `POST /api/requests/{id}/cancel`
pub async fn cancel_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    match state
        .coordinator
        .cancel_request(&actor, path.into_inner(), Utc::now())
        .await
    {
        Ok(request) => HttpResponse::Ok().json(ApiRequest::from(request)),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/requests/{id}/fulfill`
///
/// The body is optional.
pub async fn fulfill_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<FulfillBody>>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    let details = FulfillmentDetails {
        hospital_name: body.hospital_name,
        units_donated: body.units_donated,
    };

    match state
        .coordinator
        .fulfill_request(&actor, path.into_inner(), details, Utc::now())
        .await
    {
        Ok(done) => HttpResponse::Ok().json(serde_json::json!({
            "request": ApiRequest::from(done.request),
            "donation": ApiDonation::from(done.donation),
            "donorStats": ApiDonorStats::from(done.donor_stats),
        })),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/alerts/{id}/respond`
pub async fn respond(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<RespondBody>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    let response = match body.response {
        ResponseChoice::Accept => DonorResponse::Accept,
        ResponseChoice::Decline => DonorResponse::Decline,
    };

    match state
        .coordinator
        .donor_responds(&actor, path.into_inner(), response, Utc::now())
        .await
    {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/donors/{id}/stats`
pub async fn donor_stats(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> HttpResponse {
    let actor = match caller(&req) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    match state
        .coordinator
        .donor_stats(&actor, path.into_inner())
        .await
    {
        Ok(stats) => HttpResponse::Ok().json(ApiDonorStats::from(stats)),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{App, test};
    use bloodlink_coordinator::Coordinator;
    use bloodlink_coordinator::config::CoordinatorConfig;
    use bloodlink_coordinator::notifier::LogNotifier;
    use bloodlink_database::MemoryStore;
    use serde_json::{Value, json};

    use super::*;

    fn state() -> web::Data<AppState> {
        let mut config = CoordinatorConfig::default();
        config.dispatch.schedule_timeouts = false;
        web::Data::new(AppState {
            coordinator: Arc::new(Coordinator::new(
                Arc::new(MemoryStore::new()),
                Arc::new(LogNotifier),
                config,
            )),
        })
    }

    fn as_user(req: test::TestRequest, id: Uuid, role: &str) -> test::TestRequest {
        req.insert_header((USER_ID_HEADER, id.to_string()))
            .insert_header((USER_ROLE_HEADER, role))
    }

    #[actix_web::test]
    async fn health_reports_index_size() {
        let app = test::init_service(App::new().app_data(state()).configure(crate::configure)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["indexedDonors"], 0);
    }

    #[actix_web::test]
    async fn missing_identity_is_unauthorized() {
        let app = test::init_service(App::new().app_data(state()).configure(crate::configure)).await;
        let req = test::TestRequest::post()
            .uri("/api/requests")
            .set_json(json!({"bloodTypeNeeded": "O+", "urgency": "high", "latitude": 1.0, "longitude": 1.0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn errors_map_to_status_codes() {
        let app = test::init_service(App::new().app_data(state()).configure(crate::configure)).await;
        let hospital = Uuid::new_v4();

        let req = as_user(test::TestRequest::post(), hospital, "hospital")
            .uri("/api/requests")
            .set_json(json!({
                "bloodTypeNeeded": "O+",
                "urgency": "high",
                "unitsNeeded": 0,
                "latitude": 1.0,
                "longitude": 1.0
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("units_needed"));

        let req = as_user(test::TestRequest::post(), Uuid::new_v4(), "donor")
            .uri("/api/requests")
            .set_json(json!({"bloodTypeNeeded": "O+", "urgency": "high", "latitude": 1.0, "longitude": 1.0}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = as_user(test::TestRequest::get(), hospital, "hospital")
            .uri(&format!("/api/requests/{}", Uuid::new_v4()))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn request_round_trip_over_http() {
        let app = test::init_service(App::new().app_data(state()).configure(crate::configure)).await;
        let donor = Uuid::new_v4();
        let hospital = Uuid::new_v4();

        let req = as_user(test::TestRequest::post(), donor, "donor")
            .uri("/api/locations")
            .set_json(json!({"latitude": 40.7128, "longitude": -74.0060}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["outcome"], "applied");

        let req = as_user(test::TestRequest::put(), donor, "donor")
            .uri("/api/health-profiles")
            .set_json(json!({"bloodType": "O-"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = as_user(test::TestRequest::post(), hospital, "hospital")
            .uri("/api/requests")
            .set_json(json!({
                "bloodTypeNeeded": "A+",
                "urgency": "critical",
                "latitude": 40.7138,
                "longitude": -74.0060,
                "locationName": "Bellevue"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: Value = test::read_body_json(resp).await;
        assert_eq!(created["dispatch"]["outcome"], "dispatched");
        let request_id = created["request"]["id"].as_str().unwrap().to_string();

        let req = as_user(test::TestRequest::get(), donor, "donor")
            .uri("/api/requests/nearby?radiusM=5000")
            .to_request();
        let nearby: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(nearby.as_array().unwrap().len(), 1);
        assert_eq!(nearby[0]["id"], request_id.as_str());

        let req = as_user(test::TestRequest::get(), hospital, "hospital")
            .uri(&format!("/api/requests/{request_id}/alerts"))
            .to_request();
        let alerts: Value = test::call_and_read_body_json(&app, req).await;
        let alert_id = alerts[0]["id"].as_str().unwrap().to_string();
        assert_eq!(alerts[0]["status"], "notified");

        let req = as_user(test::TestRequest::post(), donor, "donor")
            .uri(&format!("/api/alerts/{alert_id}/respond"))
            .set_json(json!({"response": "accept"}))
            .to_request();
        let outcome: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(outcome["outcome"], "matched");

        let req = as_user(test::TestRequest::post(), hospital, "hospital")
            .uri(&format!("/api/requests/{request_id}/fulfill"))
            .to_request();
        let done: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(done["request"]["status"], "fulfilled");
        assert_eq!(done["donorStats"]["totalDonations"], 1);

        let req = as_user(test::TestRequest::post(), hospital, "hospital")
            .uri(&format!("/api/requests/{request_id}/cancel"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = as_user(test::TestRequest::get(), donor, "donor")
            .uri(&format!("/api/donors/{donor}/stats"))
            .to_request();
        let stats: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats["totalDonations"], 1);
    }
}
