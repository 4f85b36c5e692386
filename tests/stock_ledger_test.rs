//! Integration tests for the stock operation ledger: atomic quantity
//! adjustment, non-negativity, and the linked-order shipped transition.

mod common;

use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use uuid::Uuid;

use marketplace_api::{
    entities::{
        order::{Entity as OrderEntity, OrderStatus},
        product::Entity as ProductEntity,
        stock_operation::{Entity as StockOperationEntity, StockDirection},
    },
    errors::ServiceError,
    services::stock::CreateStockOperationRequest,
};

fn request(
    product_id: Uuid,
    direction: StockDirection,
    quantity: i32,
    order_id: Option<Uuid>,
) -> CreateStockOperationRequest {
    CreateStockOperationRequest {
        product_id,
        direction,
        quantity,
        reason: Some("test movement".to_string()),
        order_id,
        performed_by: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn stock_in_captures_previous_and_new_quantities() {
    let app = TestApp::new().await;
    let product = app
        .seed_product(Uuid::new_v4(), "Seller", "Widget", dec!(10), 10)
        .await;

    let outcome = app
        .services
        .stock
        .create_operation(request(product.id, StockDirection::In, 5, None))
        .await
        .expect("stock-in succeeds");

    assert_eq!(outcome.operation.previous_quantity, 10);
    assert_eq!(outcome.operation.new_quantity, 15);
    assert!(outcome.order_effect.is_none());
    assert!(outcome.order_fulfilled.is_none());

    let live = ProductEntity::find_by_id(product.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.quantity, 15);
}

#[tokio::test]
async fn oversized_stock_out_is_rejected_and_nothing_changes() {
    let app = TestApp::new().await;
    let product = app
        .seed_product(Uuid::new_v4(), "Seller", "Widget", dec!(10), 3)
        .await;

    let result = app
        .services
        .stock
        .create_operation(request(product.id, StockDirection::Out, 5, None))
        .await;

    assert!(matches!(result, Err(ServiceError::InsufficientStock(_))));

    let live = ProductEntity::find_by_id(product.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.quantity, 3, "failed operation must not adjust stock");
    assert_eq!(
        StockOperationEntity::find().count(&*app.db).await.unwrap(),
        0,
        "failed operation must leave no ledger row"
    );
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let app = TestApp::new().await;
    let result = app
        .services
        .stock
        .create_operation(request(Uuid::new_v4(), StockDirection::In, 1, None))
        .await;
    assert!(matches!(result, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn covering_stock_out_ships_the_linked_order_once() {
    let app = TestApp::new().await;
    let product = app
        .seed_product(Uuid::new_v4(), "Seller", "Widget", dec!(10), 10)
        .await;
    let order = app
        .seed_order(OrderStatus::Processing, chrono::Utc::now(), None)
        .await;
    app.seed_order_item(order.id, product.id, 2, dec!(10)).await;

    let outcome = app
        .services
        .stock
        .create_operation(request(product.id, StockDirection::Out, 2, Some(order.id)))
        .await
        .expect("stock-out succeeds");

    let effect = outcome.order_effect.expect("order advanced");
    assert_eq!(effect.old_status, OrderStatus::Processing);
    assert_eq!(effect.new_status, OrderStatus::Shipped);
    assert_eq!(outcome.order_fulfilled, Some(true));

    let shipped = OrderEntity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shipped.status, OrderStatus::Shipped);
    let first_stamp = shipped.shipped_at.expect("shipped timestamp stamped");

    // A second identical movement against the already-shipped order: the
    // inventory still moves, the order does not.
    let outcome = app
        .services
        .stock
        .create_operation(request(product.id, StockDirection::Out, 2, Some(order.id)))
        .await
        .expect("second stock-out succeeds");
    assert!(outcome.order_effect.is_none());

    let unchanged = OrderEntity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, OrderStatus::Shipped);
    assert_eq!(unchanged.shipped_at, Some(first_stamp));

    let live = ProductEntity::find_by_id(product.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.quantity, 6);
}

#[tokio::test]
async fn partial_stock_out_reports_unfulfilled() {
    let app = TestApp::new().await;
    let product = app
        .seed_product(Uuid::new_v4(), "Seller", "Widget", dec!(10), 10)
        .await;
    let order = app
        .seed_order(OrderStatus::Pending, chrono::Utc::now(), None)
        .await;
    app.seed_order_item(order.id, product.id, 5, dec!(10)).await;

    let outcome = app
        .services
        .stock
        .create_operation(request(product.id, StockDirection::Out, 2, Some(order.id)))
        .await
        .unwrap();

    // Pending orders advance on the first movement even when not yet
    // fully fulfilled.
    assert!(outcome.order_effect.is_some());
    assert_eq!(outcome.order_fulfilled, Some(false));
}

#[tokio::test]
async fn stock_out_against_a_cancelled_order_still_moves_inventory() {
    let app = TestApp::new().await;
    let product = app
        .seed_product(Uuid::new_v4(), "Seller", "Widget", dec!(10), 10)
        .await;
    let order = app
        .seed_order(OrderStatus::Cancelled, chrono::Utc::now(), None)
        .await;
    app.seed_order_item(order.id, product.id, 2, dec!(10)).await;

    let outcome = app
        .services
        .stock
        .create_operation(request(product.id, StockDirection::Out, 2, Some(order.id)))
        .await
        .expect("inventory movement is never blocked by order bookkeeping");

    assert!(outcome.order_effect.is_none());
    let live = ProductEntity::find_by_id(product.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.quantity, 8);

    let order_row = OrderEntity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_row.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn stock_out_naming_a_missing_order_fails_atomically() {
    let app = TestApp::new().await;
    let product = app
        .seed_product(Uuid::new_v4(), "Seller", "Widget", dec!(10), 10)
        .await;

    let result = app
        .services
        .stock
        .create_operation(request(
            product.id,
            StockDirection::Out,
            2,
            Some(Uuid::new_v4()),
        ))
        .await;

    assert!(matches!(result, Err(ServiceError::NotFound(_))));
    let live = ProductEntity::find_by_id(product.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.quantity, 10, "rolled back with the ledger row");
    assert_eq!(
        StockOperationEntity::find().count(&*app.db).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn concurrent_movements_on_one_product_never_lose_updates() {
    let app = TestApp::new().await;
    let product = app
        .seed_product(Uuid::new_v4(), "Seller", "Widget", dec!(10), 100)
        .await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let stock = app.services.stock.clone();
        let product_id = product.id;
        handles.push(tokio::spawn(async move {
            stock
                .create_operation(CreateStockOperationRequest {
                    product_id,
                    direction: StockDirection::Out,
                    quantity: 3,
                    reason: None,
                    order_id: None,
                    performed_by: Uuid::new_v4(),
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let live = ProductEntity::find_by_id(product.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.quantity, 70);

    // The ledger replays exactly onto the live count.
    let operations = StockOperationEntity::find().all(&*app.db).await.unwrap();
    assert_eq!(operations.len(), 10);
    for op in operations {
        assert_eq!(op.new_quantity, op.previous_quantity - op.quantity);
    }
}
