pub mod order_reconciler;
