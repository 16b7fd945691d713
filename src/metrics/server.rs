use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use kameo::actor::ActorRef;
use prometheus::{Encoder, Registry, TextEncoder};

use crate::health::{GetSystemHealth, HealthMonitorActor, HealthStatus};

#[derive(Clone)]
pub struct MetricsServerState {
    pub registry: Registry,
    pub health: ActorRef<HealthMonitorActor>,
}

/// Serves `/metrics` and `/health`. Runs on its own runtime thread, started
/// from `main`.
pub async fn start_metrics_server(state: MetricsServerState, port: u16) -> std::io::Result<()> {
    tracing::info!(port = port, "Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(state: web::Data<MetricsServerState>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

async fn health_handler(state: web::Data<MetricsServerState>) -> impl Responder {
    match state.health.ask(GetSystemHealth).send().await {
        Ok(health) => {
            let unhealthy = matches!(health.overall_status, HealthStatus::Unhealthy(_));
            let body = serde_json::json!({
                "service": "stock-reservation",
                "health": health,
            });
            if unhealthy {
                HttpResponse::ServiceUnavailable().json(body)
            } else {
                HttpResponse::Ok().json(body)
            }
        }
        Err(e) => {
            tracing::error!(error = ?e, "Health monitor unavailable");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "service": "stock-reservation",
                "error": "health monitor unavailable",
            }))
        }
    }
}
