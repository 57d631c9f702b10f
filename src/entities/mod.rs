pub mod commerce;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod refund;
