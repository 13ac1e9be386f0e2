//! # Webhook Delivery
//!
//! Background worker that drains the conversion webhook queue kept by
//! `marketplace_core::webhook`. Each pass claims a leased batch of due
//! deliveries, POSTs them under a hard timeout and records the outcome,
//! which applies the backoff ladder or marks the delivery failed.

pub mod error;
pub mod transport;
pub mod worker;

pub use error::{DeliveryError, DeliveryResult};
pub use transport::{ReqwestTransport, WebhookTransport, DEFAULT_TIMEOUT, DELIVERY_ID_HEADER};
pub use worker::{DeliveryWorker, PassSummary};
