use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::coupon::{self, DiscountType, Entity as CouponEntity};
use crate::entities::coupon_usage::{self, Entity as CouponUsageEntity};
use crate::errors::ServiceError;

/// Public view of a coupon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponSummary {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub description: Option<String>,
}

impl From<&coupon::Model> for CouponSummary {
    fn from(model: &coupon::Model) -> Self {
        Self {
            id: model.id,
            code: model.code.clone(),
            discount_type: model.discount_type,
            discount_value: model.discount_value,
            description: model.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponValidation {
    pub success: bool,
    pub coupon: CouponSummary,
    pub discount: Decimal,
    pub message: String,
}

/// Normalized form coupon codes are stored and looked up in
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Checks a coupon against a subtotal at `now` and returns the discount.
///
/// The discount never exceeds the subtotal and is rounded to 2 dp.
pub fn evaluate(
    coupon: &coupon::Model,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<Decimal, ServiceError> {
    if !coupon.is_active {
        return Err(ServiceError::InvalidCoupon("Coupon is inactive".to_string()));
    }
    if coupon.starts_at.map_or(false, |starts| starts > now) {
        return Err(ServiceError::InvalidCoupon(
            "Coupon is not active yet".to_string(),
        ));
    }
    if coupon.expires_at.map_or(false, |expires| expires < now) {
        return Err(ServiceError::InvalidCoupon("Coupon has expired".to_string()));
    }
    if coupon
        .usage_limit
        .map_or(false, |limit| coupon.used_count >= limit)
    {
        return Err(ServiceError::InvalidCoupon(
            "Coupon usage limit reached".to_string(),
        ));
    }
    if subtotal <= Decimal::ZERO {
        return Err(ServiceError::CouponNotApplicable(
            "Order subtotal must be greater than zero".to_string(),
        ));
    }
    if let Some(minimum) = coupon.min_order_amount {
        if subtotal < minimum {
            return Err(ServiceError::CouponNotApplicable(format!(
                "Minimum order amount for this coupon is {}",
                minimum.normalize()
            )));
        }
    }

    let raw = match coupon.discount_type {
        DiscountType::Percentage => {
            let pct = subtotal * coupon.discount_value / Decimal::ONE_HUNDRED;
            match coupon.max_discount {
                Some(cap) => pct.min(cap),
                None => pct,
            }
        }
        DiscountType::Fixed => coupon.discount_value,
    };

    Ok(raw
        .max(Decimal::ZERO)
        .min(subtotal)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// Loads a coupon on `conn` and evaluates it against `subtotal` now
pub async fn coupon_discount<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    subtotal: Decimal,
) -> Result<Decimal, ServiceError> {
    let coupon = CouponEntity::find_by_id(coupon_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::InvalidCoupon(format!("Coupon {} not found", coupon_id)))?;

    evaluate(&coupon, subtotal, Utc::now())
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Validates a coupon code against a subtotal
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        subtotal: Decimal,
    ) -> Result<CouponValidation, ServiceError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(ServiceError::ValidationError(
                "Coupon code is required".to_string(),
            ));
        }

        let coupon = CouponEntity::find()
            .filter(coupon::Column::Code.eq(code.clone()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::InvalidCoupon(format!("Coupon {} not found", code)))?;

        let discount = evaluate(&coupon, subtotal, Utc::now())?;
        Ok(CouponValidation {
            success: true,
            coupon: CouponSummary::from(&coupon),
            discount,
            message: format!("Coupon {} applied", coupon.code),
        })
    }

    /// Records that a coupon was redeemed by an order.
    ///
    /// Returns `false` when this (coupon, order) pair was already recorded.
    #[instrument(skip(self))]
    pub async fn record_usage(
        &self,
        coupon_id: Uuid,
        order_id: Uuid,
        user_id: &str,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        if CouponEntity::find_by_id(coupon_id).one(&txn).await?.is_none() {
            return Err(ServiceError::NotFound(format!(
                "Coupon {} not found",
                coupon_id
            )));
        }

        let existing = CouponUsageEntity::find()
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .filter(coupon_usage::Column::OrderId.eq(order_id))
            .one(&txn)
            .await?;
        if existing.is_some() {
            info!(%coupon_id, %order_id, "coupon usage already recorded");
            return Ok(false);
        }

        coupon_usage::ActiveModel {
            id: Set(Uuid::new_v4()),
            coupon_id: Set(coupon_id),
            order_id: Set(order_id),
            user_id: Set(user_id.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        CouponEntity::update_many()
            .col_expr(
                coupon::Column::UsedCount,
                Expr::col(coupon::Column::UsedCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Id.eq(coupon_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        info!(%coupon_id, %order_id, "coupon usage recorded");
        Ok(true)
    }

    /// Fire-and-forget usage recording; failures are only logged
    pub fn record_usage_in_background(&self, coupon_id: Uuid, order_id: Uuid, user_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.record_usage(coupon_id, order_id, &user_id).await {
                warn!(%coupon_id, %order_id, "failed to record coupon usage: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn coupon(discount_type: DiscountType, value: Decimal) -> coupon::Model {
        let now = Utc::now();
        coupon::Model {
            id: Uuid::new_v4(),
            code: "WELCOME10".into(),
            description: None,
            discount_type,
            discount_value: value,
            min_order_amount: None,
            max_discount: None,
            usage_limit: None,
            used_count: 0,
            is_active: true,
            starts_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn percentage_discount() {
        let c = coupon(DiscountType::Percentage, dec!(10));
        assert_eq!(evaluate(&c, dec!(900), Utc::now()).unwrap(), dec!(90));
    }

    #[test]
    fn percentage_discount_respects_cap() {
        let mut c = coupon(DiscountType::Percentage, dec!(50));
        c.max_discount = Some(dec!(100));
        assert_eq!(evaluate(&c, dec!(900), Utc::now()).unwrap(), dec!(100));
    }

    #[test]
    fn fixed_discount_never_exceeds_subtotal() {
        let c = coupon(DiscountType::Fixed, dec!(250));
        assert_eq!(evaluate(&c, dec!(120), Utc::now()).unwrap(), dec!(120));
        assert_eq!(evaluate(&c, dec!(900), Utc::now()).unwrap(), dec!(250));
    }

    #[test]
    fn percentage_rounds_to_cents() {
        let c = coupon(DiscountType::Percentage, dec!(15));
        // 15% of 33.33 = 4.9995
        assert_eq!(evaluate(&c, dec!(33.33), Utc::now()).unwrap(), dec!(5.00));
    }

    #[test]
    fn rejects_expired_and_future_coupons() {
        let now = Utc::now();
        let mut expired = coupon(DiscountType::Fixed, dec!(10));
        expired.expires_at = Some(now - Duration::days(1));
        assert_matches!(evaluate(&expired, dec!(100), now), Err(ServiceError::InvalidCoupon(_)));

        let mut future = coupon(DiscountType::Fixed, dec!(10));
        future.starts_at = Some(now + Duration::days(1));
        assert_matches!(evaluate(&future, dec!(100), now), Err(ServiceError::InvalidCoupon(_)));
    }

    #[test]
    fn rejects_inactive_and_exhausted_coupons() {
        let mut inactive = coupon(DiscountType::Fixed, dec!(10));
        inactive.is_active = false;
        assert_matches!(
            evaluate(&inactive, dec!(100), Utc::now()),
            Err(ServiceError::InvalidCoupon(_))
        );

        let mut exhausted = coupon(DiscountType::Fixed, dec!(10));
        exhausted.usage_limit = Some(5);
        exhausted.used_count = 5;
        assert_matches!(
            evaluate(&exhausted, dec!(100), Utc::now()),
            Err(ServiceError::InvalidCoupon(_))
        );
    }

    #[test]
    fn minimum_order_amount_is_enforced() {
        let mut c = coupon(DiscountType::Fixed, dec!(10));
        c.min_order_amount = Some(dec!(200));
        assert_matches!(
            evaluate(&c, dec!(199.99), Utc::now()),
            Err(ServiceError::CouponNotApplicable(_))
        );
        assert_eq!(evaluate(&c, dec!(200), Utc::now()).unwrap(), dec!(10));
    }

    #[test]
    fn zero_subtotal_is_not_applicable() {
        let c = coupon(DiscountType::Percentage, dec!(10));
        assert_matches!(
            evaluate(&c, Decimal::ZERO, Utc::now()),
            Err(ServiceError::CouponNotApplicable(_))
        );
    }

    #[test]
    fn codes_are_case_insensitive() {
        assert_eq!(normalize_code("  welcome10 "), "WELCOME10");
    }
}
