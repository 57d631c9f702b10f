/// Checkout-side commerce services
pub mod cart_snapshot;

pub use cart_snapshot::{
    CartLineSnapshot, CartSnapshot, CartSnapshotResolver, CartSource, DraftCart, DraftCartLine,
};
