use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::commerce::{
        cart, cart_item, product, product_variant, Cart, CartItem, CartStatus, Product,
        ProductModel, ProductVariant, ProductVariantModel,
    },
    errors::ServiceError,
};

/// One line of a client-held cart. Prices are never taken from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DraftCartLine {
    pub product_id: Uuid,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, Validate)]
pub struct DraftCart {
    #[validate(length(equal = 3))]
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub lines: Vec<DraftCartLine>,
}

/// Where checkout reads the cart from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartSource {
    /// Optimistic cart kept by the client
    Draft(DraftCart),
    /// Cart persisted on the server
    Server { cart_id: Uuid },
}

/// A priced line frozen at checkout time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CartLineSnapshot {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
}

impl CartLineSnapshot {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CartSnapshot {
    pub currency: String,
    pub lines: Vec<CartLineSnapshot>,
    pub taken_at: DateTime<Utc>,
    /// Set when the snapshot came from a server cart
    pub cart_id: Option<Uuid>,
}

impl CartSnapshot {
    pub fn subtotal(&self) -> Decimal {
        self.lines.iter().map(CartLineSnapshot::line_total).sum()
    }
}

struct RawLine {
    product_id: Uuid,
    variant_id: Option<Uuid>,
    quantity: i32,
}

/// Turns a cart into an immutable, priced list of lines. Read-only.
#[derive(Clone)]
pub struct CartSnapshotResolver {
    db: Arc<DatabaseConnection>,
    default_currency: String,
}

impl CartSnapshotResolver {
    pub fn new(db: Arc<DatabaseConnection>, default_currency: impl Into<String>) -> Self {
        Self {
            db,
            default_currency: default_currency.into(),
        }
    }

    #[instrument(skip(self, source), fields(user_id = %user_id))]
    pub async fn resolve(
        &self,
        user_id: Uuid,
        source: &CartSource,
    ) -> Result<CartSnapshot, ServiceError> {
        let (currency, lines, cart_id) = match source {
            CartSource::Draft(draft) => {
                draft.validate()?;
                let lines = draft
                    .lines
                    .iter()
                    .map(|l| RawLine {
                        product_id: l.product_id,
                        variant_id: l.variant_id,
                        quantity: l.quantity,
                    })
                    .collect::<Vec<_>>();
                let currency = draft
                    .currency
                    .clone()
                    .unwrap_or_else(|| self.default_currency.clone());
                (currency, lines, None)
            }
            CartSource::Server { cart_id } => {
                let (cart, lines) = self.load_server_cart(user_id, *cart_id).await?;
                (cart.currency, lines, Some(cart.id))
            }
        };
        let currency = currency.to_ascii_uppercase();

        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }
        if let Some(bad) = lines.iter().find(|l| l.quantity <= 0) {
            return Err(ServiceError::InvalidQuantity {
                product_id: bad.product_id,
                quantity: bad.quantity,
            });
        }

        let (products, variants) = self.load_catalog(&lines).await?;

        let mut snapshot_lines = Vec::with_capacity(lines.len());
        for line in &lines {
            let unavailable = || ServiceError::ProductUnavailable {
                product_id: line.product_id,
                variant_id: line.variant_id,
            };

            let product = products
                .get(&line.product_id)
                .filter(|p| p.is_active && p.currency.eq_ignore_ascii_case(&currency))
                .ok_or_else(unavailable)?;

            let priced = match line.variant_id {
                Some(variant_id) => {
                    let variant = variants
                        .get(&variant_id)
                        .filter(|v| v.is_active && v.product_id == product.id)
                        .ok_or_else(unavailable)?;
                    CartLineSnapshot {
                        product_id: product.id,
                        variant_id: Some(variant.id),
                        sku: variant.sku.clone(),
                        name: format!("{} - {}", product.name, variant.name),
                        quantity: line.quantity,
                        unit_price: variant.price.unwrap_or(product.base_price),
                    }
                }
                None => CartLineSnapshot {
                    product_id: product.id,
                    variant_id: None,
                    sku: product.sku.clone(),
                    name: product.name.clone(),
                    quantity: line.quantity,
                    unit_price: product.base_price,
                },
            };
            snapshot_lines.push(priced);
        }

        debug!(lines = snapshot_lines.len(), "Cart snapshot taken");
        Ok(CartSnapshot {
            currency,
            lines: snapshot_lines,
            taken_at: Utc::now(),
            cart_id,
        })
    }

    async fn load_server_cart(
        &self,
        user_id: Uuid,
        cart_id: Uuid,
    ) -> Result<(cart::Model, Vec<RawLine>), ServiceError> {
        let db = &*self.db;
        let cart = Cart::find_by_id(cart_id)
            .one(db)
            .await?
            .filter(|c| c.customer_id == user_id)
            .ok_or_else(|| ServiceError::BadRequest(format!("cart {} not found", cart_id)))?;

        if cart.status != CartStatus::Active {
            return Err(ServiceError::BadRequest(format!(
                "cart {} is no longer active",
                cart_id
            )));
        }

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(db)
            .await?;

        let lines = items
            .into_iter()
            .map(|i| RawLine {
                product_id: i.product_id,
                variant_id: i.variant_id,
                quantity: i.quantity,
            })
            .collect();
        Ok((cart, lines))
    }

    async fn load_catalog(
        &self,
        lines: &[RawLine],
    ) -> Result<
        (
            HashMap<Uuid, ProductModel>,
            HashMap<Uuid, ProductVariantModel>,
        ),
        ServiceError,
    > {
        let db = &*self.db;
        let product_ids: HashSet<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let variant_ids: HashSet<Uuid> = lines.iter().filter_map(|l| l.variant_id).collect();

        let products = Product::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let variants = if variant_ids.is_empty() {
            HashMap::new()
        } else {
            ProductVariant::find()
                .filter(product_variant::Column::Id.is_in(variant_ids))
                .all(db)
                .await?
                .into_iter()
                .map(|v| (v.id, v))
                .collect()
        };

        Ok((products, variants))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_product, seed_variant, test_db};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn draft(lines: Vec<DraftCartLine>) -> CartSource {
        CartSource::Draft(DraftCart {
            currency: Some("usd".into()),
            lines,
        })
    }

    fn line(product_id: Uuid, variant_id: Option<Uuid>, quantity: i32) -> DraftCartLine {
        DraftCartLine {
            product_id,
            variant_id,
            quantity,
        }
    }

    #[tokio::test]
    async fn prices_lines_from_catalog() {
        let db = test_db().await;
        let shirt = seed_product(&db, "Shirt", dec!(500), true).await;
        let mug = seed_product(&db, "Mug", dec!(12.50), true).await;
        let large = seed_variant(&db, shirt.id, "Large", Some(dec!(550)), true).await;
        let plain = seed_variant(&db, mug.id, "Plain", None, true).await;
        let resolver = CartSnapshotResolver::new(db.clone(), "USD");

        let snapshot = resolver
            .resolve(
                Uuid::new_v4(),
                &draft(vec![
                    line(shirt.id, None, 2),
                    line(shirt.id, Some(large.id), 1),
                    line(mug.id, Some(plain.id), 3),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(snapshot.currency, "USD");
        assert_eq!(snapshot.lines[0].unit_price, dec!(500));
        assert_eq!(snapshot.lines[1].unit_price, dec!(550));
        assert_eq!(snapshot.lines[2].unit_price, dec!(12.50));
        assert_eq!(snapshot.subtotal(), dec!(1587.50));
    }

    #[tokio::test]
    async fn rejects_empty_and_bad_quantities() {
        let db = test_db().await;
        let resolver = CartSnapshotResolver::new(db.clone(), "USD");
        assert_matches!(
            resolver.resolve(Uuid::new_v4(), &draft(vec![])).await,
            Err(ServiceError::EmptyCart)
        );

        let product_id = Uuid::new_v4();
        assert_matches!(
            resolver
                .resolve(Uuid::new_v4(), &draft(vec![line(product_id, None, 0)]))
                .await,
            Err(ServiceError::InvalidQuantity { quantity: 0, .. })
        );
    }

    #[tokio::test]
    async fn inactive_or_mismatched_items_are_unavailable() {
        let db = test_db().await;
        let retired = seed_product(&db, "Retired", dec!(10), false).await;
        let shirt = seed_product(&db, "Shirt", dec!(20), true).await;
        let mug = seed_product(&db, "Mug", dec!(5), true).await;
        let mug_variant = seed_variant(&db, mug.id, "Blue", None, true).await;
        let resolver = CartSnapshotResolver::new(db.clone(), "USD");

        assert_matches!(
            resolver
                .resolve(Uuid::new_v4(), &draft(vec![line(retired.id, None, 1)]))
                .await,
            Err(ServiceError::ProductUnavailable { product_id, .. }) if product_id == retired.id
        );
        assert_matches!(
            resolver
                .resolve(
                    Uuid::new_v4(),
                    &draft(vec![line(shirt.id, Some(mug_variant.id), 1)])
                )
                .await,
            Err(ServiceError::ProductUnavailable { variant_id: Some(_), .. })
        );
    }

    #[tokio::test]
    async fn server_cart_must_belong_to_caller() {
        let db = test_db().await;
        let shirt = seed_product(&db, "Shirt", dec!(20), true).await;
        let owner = Uuid::new_v4();
        let cart_id = crate::test_support::seed_cart(&db, owner, &[(shirt.id, None, 2)]).await;
        let resolver = CartSnapshotResolver::new(db.clone(), "USD");

        let snapshot = resolver
            .resolve(owner, &CartSource::Server { cart_id })
            .await
            .unwrap();
        assert_eq!(snapshot.cart_id, Some(cart_id));
        assert_eq!(snapshot.subtotal(), dec!(40));

        assert_matches!(
            resolver
                .resolve(Uuid::new_v4(), &CartSource::Server { cart_id })
                .await,
            Err(ServiceError::BadRequest(_))
        );
    }
}
