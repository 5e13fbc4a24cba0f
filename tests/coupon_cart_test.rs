//! Cart endpoints and coupon validation/redemption.

mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::{decimal, response_json, shipping_address, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, Set};
use serde_json::json;
use storefront_api::entities::{coupon, coupon_usage};

#[tokio::test]
async fn cart_add_merge_update_remove() {
    let app = TestApp::new().await;
    let token = app.token_for("shopper", &[]);
    let shirt = app.seed_product("Kente Shirt", dec!(500), &[("M", 3), ("L", 2)], 0).await;
    let cap = app.seed_product("Cap", dec!(200), &[], 10).await;

    let empty = response_json(app.request(Method::GET, "/api/v1/cart", None, Some(&token)).await).await;
    assert_eq!(empty["data"]["totalItems"], 0);
    assert!(empty["data"]["id"].is_null());

    for body in [
        json!({ "productId": shirt.id, "quantity": 1, "size": "M" }),
        json!({ "productId": cap.id, "quantity": 1 }),
        json!({ "productId": cap.id, "quantity": 1 }),
    ] {
        let response = app
            .request(Method::POST, "/api/v1/cart/items", Some(body), Some(&token))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let cart = response_json(app.request(Method::GET, "/api/v1/cart", None, Some(&token)).await).await;
    let items = cart["data"]["items"].as_array().unwrap().clone();
    assert_eq!(items.len(), 2, "identical lines merge");
    assert_eq!(cart["data"]["totalItems"], 3);
    assert_eq!(decimal(&cart["data"]["totalAmount"]), dec!(900));

    let cap_line = items
        .iter()
        .find(|item| item["productId"] == cap.id.to_string())
        .unwrap();
    let cap_line_id = cap_line["id"].as_str().unwrap().to_string();
    assert_eq!(cap_line["quantity"], 2);

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/items/{}", cap_line_id),
            Some(json!({ "quantity": 5 })),
            Some(&token),
        )
        .await;
    let cart = response_json(response).await;
    assert_eq!(cart["data"]["totalItems"], 6);
    assert_eq!(decimal(&cart["data"]["totalAmount"]), dec!(1500));

    // zero quantity drops the line
    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/items/{}", cap_line_id),
            Some(json!({ "quantity": 0 })),
            Some(&token),
        )
        .await;
    let cart = response_json(response).await;
    assert_eq!(cart["data"]["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(decimal(&cart["data"]["totalAmount"]), dec!(500));

    let response = app.request(Method::DELETE, "/api/v1/cart", None, Some(&token)).await;
    let cart = response_json(response).await;
    assert_eq!(cart["data"]["totalItems"], 0);
    assert_eq!(decimal(&cart["data"]["totalAmount"]), dec!(0));
}

#[tokio::test]
async fn cart_rejects_bad_sizes_and_inactive_products() {
    let app = TestApp::new().await;
    let token = app.token_for("shopper", &[]);
    let shirt = app.seed_product("Kente Shirt", dec!(500), &[("M", 3)], 0).await;

    for body in [
        json!({ "productId": shirt.id, "quantity": 1 }),
        json!({ "productId": shirt.id, "quantity": 1, "size": "XXL" }),
        json!({ "productId": shirt.id, "quantity": 0, "size": "M" }),
    ] {
        let response = app
            .request(Method::POST, "/api/v1/cart/items", Some(body.clone()), Some(&token))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
    }

    let mut inactive = shirt.into_active_model();
    inactive.is_active = Set(false);
    let shirt = inactive.update(app.db()).await.unwrap();
    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "productId": shirt.id, "quantity": 1, "size": "M" })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn another_users_cart_line_is_not_found() {
    let app = TestApp::new().await;
    let cap = app.seed_product("Cap", dec!(200), &[], 10).await;
    app.add_to_cart("first", &cap, 1, None).await;
    let line = app.state.services.carts.get_cart("first").await.unwrap().items[0].id;

    app.add_to_cart("second", &cap, 1, None).await;
    let token = app.token_for("second", &[]);
    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/cart/items/{}", line),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.state.services.carts.get_cart("first").await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn coupon_validation_responses() {
    let app = TestApp::new().await;
    let token = app.token_for("shopper", &[]);
    app.seed_coupon("welcome10", coupon::DiscountType::Percentage, dec!(10)).await;
    let fixed = app.seed_coupon("FLAT50", coupon::DiscountType::Fixed, dec!(50)).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({ "code": " Welcome10 ", "subtotal": 900 })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["coupon"]["code"], "WELCOME10");
    assert_eq!(decimal(&body["discount"]), dec!(90));

    let mut limited = fixed.into_active_model();
    limited.min_order_amount = Set(Some(dec!(300)));
    limited.update(app.db()).await.unwrap();
    let response = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({ "code": "FLAT50", "subtotal": 100 })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({ "code": "NOPE", "subtotal": 100 })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn checkout_redeems_coupon_in_background() {
    let app = TestApp::new().await;
    let token = app.token_for("shopper", &[]);
    let coupon = app
        .seed_coupon("FLAT50", coupon::DiscountType::Fixed, dec!(50))
        .await;
    let cap = app.seed_product("Cap", dec!(200), &[], 10).await;
    app.add_to_cart("shopper", &cap, 2, None).await;

    // the client asks for more than the coupon grants
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "shippingAddress": shipping_address(),
                "paymentMethod": "cod",
                "couponId": coupon.id,
                "discount": 80,
                "shippingDetails": { "shippingFee": 30 }
            })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(decimal(&body["data"]["order"]["discount"]), dec!(50));
    assert_eq!(decimal(&body["data"]["order"]["totalAmount"]), dec!(380));
    let order_id = body["data"]["order"]["id"].as_str().unwrap().to_string();

    let mut used = 0;
    for _ in 0..50 {
        used = coupon::Entity::find_by_id(coupon.id)
            .one(app.db())
            .await
            .unwrap()
            .unwrap()
            .used_count;
        if used == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(used, 1);

    // recording again for the same order is a no-op
    let response = app
        .request(
            Method::POST,
            "/api/v1/coupons/record-usage",
            Some(json!({ "couponId": coupon.id, "orderId": order_id })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["recorded"], false);
    assert_eq!(coupon_usage::Entity::find().all(app.db()).await.unwrap().len(), 1);
}
