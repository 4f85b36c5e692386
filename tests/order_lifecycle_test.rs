//! Integration tests for the order state machine, refund aggregation and
//! the pending-order cleanup sweep.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use marketplace_api::{
    entities::{
        order::{Entity as OrderEntity, OrderStatus},
        order_audit,
        refund::{self, RefundStatus},
    },
    errors::ServiceError,
};

#[tokio::test]
async fn unknown_status_is_rejected_before_any_write() {
    let app = TestApp::new().await;
    let order = app.seed_order(OrderStatus::Pending, Utc::now(), None).await;

    let result = app
        .services
        .order_status
        .update_status_str(order.id, "teleported")
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));

    let unchanged = OrderEntity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, OrderStatus::Pending);
    assert_eq!(unchanged.version, 1);
}

#[tokio::test]
async fn updating_a_nonexistent_order_is_not_found() {
    let app = TestApp::new().await;
    let result = app
        .services
        .order_status
        .update_status(Uuid::new_v4(), OrderStatus::Shipped)
        .await;
    assert!(matches!(result, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn shipping_and_delivery_stamp_timestamps_exactly_once() {
    let app = TestApp::new().await;
    let order = app
        .seed_order(OrderStatus::Processing, Utc::now(), None)
        .await;

    let shipped = app
        .services
        .order_status
        .update_status(order.id, OrderStatus::Shipped)
        .await
        .unwrap();
    let shipped_at = shipped.shipped_at.expect("shipped stamp");

    // Re-entering the same status is a no-op write, not a re-stamp.
    let replayed = app
        .services
        .order_status
        .update_status(order.id, OrderStatus::Shipped)
        .await
        .unwrap();
    assert_eq!(replayed.shipped_at, Some(shipped_at));

    let delivered = app
        .services
        .order_status
        .update_status(order.id, OrderStatus::Delivered)
        .await
        .unwrap();
    assert!(delivered.delivered_at.is_some());
    assert_eq!(delivered.shipped_at, Some(shipped_at));
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let app = TestApp::new().await;
    let order = app
        .seed_order(OrderStatus::Delivered, Utc::now(), None)
        .await;

    // Delivered orders can only move into the return flow.
    let result = app
        .services
        .order_status
        .update_status(order.id, OrderStatus::Cancelled)
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));

    app.services
        .order_status
        .update_status(order.id, OrderStatus::ReturnProcessing)
        .await
        .unwrap();
    let returned = app
        .services
        .order_status
        .update_status(order.id, OrderStatus::Returned)
        .await
        .unwrap();
    assert_eq!(returned.status, OrderStatus::Returned);
}

#[tokio::test]
async fn tracking_number_is_independent_of_status() {
    let app = TestApp::new().await;
    let order = app.seed_order(OrderStatus::Pending, Utc::now(), None).await;

    let updated = app
        .services
        .order_status
        .set_tracking_number(order.id, "TRK-12345".to_string())
        .await
        .unwrap();
    assert_eq!(updated.tracking_number.as_deref(), Some("TRK-12345"));
    assert_eq!(updated.status, OrderStatus::Pending);
}

#[tokio::test]
async fn refunded_total_counts_only_succeeded_refunds() {
    let app = TestApp::new().await;
    let order = app
        .seed_order(OrderStatus::Delivered, Utc::now(), None)
        .await;

    for (amount, status) in [
        (dec!(5.00), RefundStatus::Succeeded),
        (dec!(3.00), RefundStatus::Pending),
        (dec!(2.00), RefundStatus::Failed),
        (dec!(1.50), RefundStatus::Succeeded),
    ] {
        refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            payment_intent_id: Set("pi_1".to_string()),
            refund_id: Set(format!("re_{}", Uuid::new_v4())),
            amount: Set(amount),
            currency: Set("usd".to_string()),
            reason: Set(None),
            status: Set(status),
            issued_by: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*app.db)
        .await
        .unwrap();
    }

    let refreshed = app
        .services
        .order_status
        .refresh_refund_total(order.id)
        .await
        .unwrap();
    assert_eq!(refreshed.refunded_amount, dec!(6.50));
}

#[tokio::test]
async fn cleanup_cancels_only_pending_orders_past_the_timeout() {
    let app = TestApp::new().await;
    let stale_pending = app
        .seed_order(OrderStatus::Pending, Utc::now() - Duration::hours(25), None)
        .await;
    let fresh_pending = app
        .seed_order(OrderStatus::Pending, Utc::now() - Duration::hours(1), None)
        .await;
    let stale_processing = app
        .seed_order(
            OrderStatus::Processing,
            Utc::now() - Duration::hours(25),
            None,
        )
        .await;

    let summary = app.services.cleanup.sweep_once().await.unwrap();
    assert!(!summary.skipped);
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.failed, 0);

    let statuses = [
        (stale_pending.id, OrderStatus::Cancelled),
        (fresh_pending.id, OrderStatus::Pending),
        (stale_processing.id, OrderStatus::Processing),
    ];
    for (id, expected) in statuses {
        let row = OrderEntity::find_by_id(id)
            .one(&*app.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, expected);
    }

    // One audit entry per cancellation.
    let audits = order_audit::Entity::find()
        .filter(order_audit::Column::OrderId.eq(stale_pending.id))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "cancelled");
}

#[tokio::test]
async fn second_sweep_finds_nothing_left_to_cancel() {
    let app = TestApp::new().await;
    app.seed_order(OrderStatus::Pending, Utc::now() - Duration::hours(30), None)
        .await;

    let first = app.services.cleanup.sweep_once().await.unwrap();
    assert_eq!(first.cancelled, 1);

    let second = app.services.cleanup.sweep_once().await.unwrap();
    assert!(!second.skipped);
    assert_eq!(second.examined, 0);
    assert_eq!(second.cancelled, 0);
}

#[tokio::test]
async fn concurrent_sweeps_cancel_each_stale_order_exactly_once() {
    let app = TestApp::new().await;
    let mut stale_ids = Vec::new();
    for _ in 0..5 {
        let order = app
            .seed_order(OrderStatus::Pending, Utc::now() - Duration::hours(26), None)
            .await;
        stale_ids.push(order.id);
    }

    let (first, second) = tokio::join!(
        app.services.cleanup.sweep_once(),
        app.services.cleanup.sweep_once()
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.cancelled + second.cancelled, 5);

    for id in stale_ids {
        let audits = order_audit::Entity::find()
            .filter(order_audit::Column::OrderId.eq(id))
            .all(&*app.db)
            .await
            .unwrap();
        assert_eq!(audits.len(), 1, "each order is cancelled exactly once");
    }
}
