use crate::config::ReservationFailurePolicy;
use crate::domain::OrderStatus;
use crate::metrics::Metrics;
use crate::store::OrderStore;
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

/// Moves an order whose stock reservation was given up on to the status the
/// failure policy names. `None` leaves the order `pending`.
///
/// Failures are logged; the caller has already settled the event.
pub(crate) async fn compensate_order(
    orders: &dyn OrderStore,
    policy: ReservationFailurePolicy,
    order_id: i64,
    metrics: &Metrics,
) {
    let status = match policy {
        ReservationFailurePolicy::Hold => OrderStatus::OnHold,
        ReservationFailurePolicy::Cancel => OrderStatus::Cancelled,
        ReservationFailurePolicy::None => return,
    };

    let result = retry_with_backoff(RetryConfig::status_update(), |_attempt| {
        orders.update_status(order_id, status)
    })
    .await;

    match result {
        RetryResult::Success(()) => {
            metrics.record_compensation(status.as_str());
            tracing::info!(order_id = order_id, status = %status, "Order compensated");
        }
        RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
            tracing::error!(
                order_id = order_id,
                status = %status,
                error = %e,
                "Failed to compensate order"
            );
        }
    }
}
