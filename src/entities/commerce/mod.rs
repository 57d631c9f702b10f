/// Catalog, cart and customer entities consumed by checkout
pub mod cart;
pub mod cart_item;
pub mod customer;
pub mod customer_address;
pub mod product;
pub mod product_variant;

// Re-export entities
pub use cart::{CartStatus, Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use customer::{Entity as Customer, Model as CustomerModel};
pub use customer_address::{Entity as CustomerAddress, Model as CustomerAddressModel};
pub use product::{Entity as Product, Model as ProductModel};
pub use product_variant::{Entity as ProductVariant, Model as ProductVariantModel};
