// Checkout input
pub mod commerce;

// Order ledger and its state machine
pub mod order_locks;
pub mod order_status;
pub mod orders;

// Payment gateway adapters
pub mod in_memory_gateway;
pub mod payment_gateway;
pub mod stripe_gateway;

// Reconciliation and refunds
pub mod payments;
pub mod reconciliation;
pub mod refunds;

pub mod money;
