//! Per-size stock bookkeeping.
//!
//! Stock is taken when a payment is confirmed and given back when a
//! confirmed order is cancelled. Both directions go through
//! [`apply_stock_delta`], and writes are guarded by the product's
//! `version` column.

use chrono::Utc;
use sea_orm::{sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::order_item;
use crate::entities::product::{self, Entity as ProductEntity, SizeStock};
use crate::errors::ServiceError;

const MAX_STOCK_RETRIES: usize = 3;

/// Stock columns of a product after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevels {
    pub sizes: SizeStock,
    pub sold_count: i32,
    pub remaining_stock: i32,
}

/// Computes the product's stock after moving `delta` units of `size`.
///
/// Negative deltas sell stock, positive deltas return it. Products without
/// a size breakdown only track the aggregate counters. Returned stock for a
/// size the product no longer offers only moves the aggregates.
pub fn apply_stock_delta(
    product: &product::Model,
    size: Option<&str>,
    delta: i32,
) -> Result<StockLevels, ServiceError> {
    let mut sizes = product.sizes.clone();

    if !sizes.0.is_empty() {
        let entry = size.and_then(|size| {
            sizes
                .0
                .iter_mut()
                .find(|entry| entry.size.eq_ignore_ascii_case(size))
        });

        match entry {
            Some(entry) => {
                let next = entry.stock + delta;
                if next < 0 {
                    return Err(ServiceError::InsufficientStock(format!(
                        "{} (size {}): {} left, {} requested",
                        product.name, entry.size, entry.stock, -delta
                    )));
                }
                entry.stock = next;
            }
            None if delta > 0 => {
                warn!(
                    product_id = %product.id,
                    size = size.unwrap_or("-"),
                    "size no longer offered; restoring aggregate stock only"
                );
            }
            None => {
                return Err(match size {
                    Some(size) => ServiceError::ValidationError(format!(
                        "Size {} is not available for {}",
                        size, product.name
                    )),
                    None => ServiceError::ValidationError(format!(
                        "A size is required for {}",
                        product.name
                    )),
                });
            }
        }
    }

    let sold_count = (product.sold_count - delta).max(0);
    let remaining_stock = product.total_stock - sold_count;
    if remaining_stock < 0 {
        return Err(ServiceError::InsufficientStock(format!(
            "{}: {} left, {} requested",
            product.name, product.remaining_stock, -delta
        )));
    }

    Ok(StockLevels {
        sizes,
        sold_count,
        remaining_stock,
    })
}

/// True for errors that mean the order's items cannot be taken from stock
pub fn is_stock_shortfall(error: &ServiceError) -> bool {
    matches!(
        error,
        ServiceError::InsufficientStock(_) | ServiceError::ValidationError(_)
    )
}

/// Applies a stock delta to one product with an optimistic version check.
///
/// A product that no longer exists is skipped.
#[instrument(skip(conn))]
pub async fn adjust_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    size: Option<&str>,
    delta: i32,
) -> Result<(), ServiceError> {
    for attempt in 1..=MAX_STOCK_RETRIES {
        let Some(product) = ProductEntity::find_by_id(product_id).one(conn).await? else {
            warn!(%product_id, "product no longer exists; stock not adjusted");
            return Ok(());
        };

        let levels = apply_stock_delta(&product, size, delta)?;

        let result = ProductEntity::update_many()
            .col_expr(product::Column::Sizes, Expr::value(levels.sizes))
            .col_expr(product::Column::SoldCount, Expr::value(levels.sold_count))
            .col_expr(
                product::Column::RemainingStock,
                Expr::value(levels.remaining_stock),
            )
            .col_expr(product::Column::Version, Expr::value(product.version + 1))
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Version.eq(product.version))
            .exec(conn)
            .await?;

        if result.rows_affected == 1 {
            debug!(%product_id, delta, "stock adjusted");
            return Ok(());
        }

        warn!(%product_id, attempt, "stock version conflict, retrying");
    }

    Err(ServiceError::ConcurrentModification(product_id))
}

/// Takes stock for every line of an order
pub async fn deduct_for_items<C: ConnectionTrait>(
    conn: &C,
    items: &[order_item::Model],
) -> Result<(), ServiceError> {
    for item in items {
        adjust_stock(conn, item.product_id, item.size.as_deref(), -item.quantity).await?;
    }
    Ok(())
}

/// Returns stock for every line of an order
pub async fn restore_for_items<C: ConnectionTrait>(
    conn: &C,
    items: &[order_item::Model],
) -> Result<(), ServiceError> {
    for item in items {
        adjust_stock(conn, item.product_id, item.size.as_deref(), item.quantity).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::product::{ProductImages, SizeStockEntry};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn product(sizes: Vec<(&str, i32)>) -> product::Model {
        let now = Utc::now();
        let total: i32 = sizes.iter().map(|(_, stock)| stock).sum();
        product::Model {
            id: Uuid::new_v4(),
            name: "Kente Shirt".into(),
            price: dec!(200),
            images: ProductImages(vec![]),
            sizes: SizeStock(
                sizes
                    .into_iter()
                    .map(|(size, stock)| SizeStockEntry {
                        size: size.into(),
                        stock,
                    })
                    .collect(),
            ),
            total_stock: total,
            sold_count: 0,
            remaining_stock: total,
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn deduction_reduces_only_the_chosen_size() {
        let p = product(vec![("M", 5), ("L", 3)]);
        let levels = apply_stock_delta(&p, Some("M"), -2).unwrap();
        assert_eq!(levels.sizes.0[0].stock, 3);
        assert_eq!(levels.sizes.0[1].stock, 3);
        assert_eq!(levels.sold_count, 2);
        assert_eq!(levels.remaining_stock, 6);
    }

    #[test]
    fn deduct_then_restore_is_identity() {
        let mut p = product(vec![("M", 5), ("L", 3)]);
        let taken = apply_stock_delta(&p, Some("L"), -3).unwrap();
        p.sizes = taken.sizes;
        p.sold_count = taken.sold_count;
        p.remaining_stock = taken.remaining_stock;

        let restored = apply_stock_delta(&p, Some("L"), 3).unwrap();
        assert_eq!(restored.sizes.0[1].stock, 3);
        assert_eq!(restored.sold_count, 0);
        assert_eq!(restored.remaining_stock, 8);
    }

    #[test]
    fn overselling_a_size_fails() {
        let p = product(vec![("M", 1)]);
        assert_matches!(
            apply_stock_delta(&p, Some("M"), -2),
            Err(ServiceError::InsufficientStock(_))
        );
    }

    #[test]
    fn unknown_size_is_rejected() {
        let p = product(vec![("M", 1)]);
        assert_matches!(
            apply_stock_delta(&p, Some("XXL"), -1),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn unsized_products_track_aggregates() {
        let mut p = product(vec![]);
        p.total_stock = 4;
        p.remaining_stock = 4;
        let levels = apply_stock_delta(&p, None, -1).unwrap();
        assert!(levels.sizes.0.is_empty());
        assert_eq!(levels.remaining_stock, 3);
        assert_eq!(levels.sold_count, 1);
    }

    #[test]
    fn restoring_a_removed_size_moves_only_aggregates() {
        let mut p = product(vec![("43", 4)]);
        p.total_stock = 6;
        p.sold_count = 2;
        p.remaining_stock = 4;
        let levels = apply_stock_delta(&p, Some("42"), 2).unwrap();
        assert_eq!(levels.sizes.0.len(), 1);
        assert_eq!(levels.sizes.0[0].stock, 4);
        assert_eq!(levels.sold_count, 0);
        assert_eq!(levels.remaining_stock, 6);
    }

    #[test]
    fn restoring_an_unsized_line_on_a_sized_product_succeeds() {
        let mut p = product(vec![("M", 1)]);
        p.sold_count = 1;
        p.remaining_stock = 0;
        assert!(apply_stock_delta(&p, None, 1).is_ok());
        assert_matches!(
            apply_stock_delta(&p, None, -1),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn sold_count_floors_at_zero_and_remaining_follows_it() {
        let mut p = product(vec![]);
        p.total_stock = 10;
        p.sold_count = 1;
        // drifted counters are realigned from total minus sold
        p.remaining_stock = 3;
        let levels = apply_stock_delta(&p, None, 3).unwrap();
        assert_eq!(levels.sold_count, 0);
        assert_eq!(levels.remaining_stock, 10);
    }

    #[test]
    fn size_match_is_case_insensitive() {
        let p = product(vec![("XL", 2)]);
        assert!(apply_stock_delta(&p, Some("xl"), -1).is_ok());
    }
}
