//! SoignantVoice prospection API library
//!
//! Lead generation for French care establishments: establishment import,
//! contact discovery (Hunter), email validation (ZeroBounce), personalized
//! ice breakers (Serper + Anthropic), a four-step drip sequence and Brevo
//! delivery tracking.
//!
//! # Modules
//!
//! - `api`: Route table, security layers and OpenAPI document.
//! - `auth`: Bearer-token gate for internal routes.
//! - `brevo_client`: Brevo transactional email client.
//! - `cache_validator`: Integrity-checked cache entries.
//! - `circuit_breaker`: Per-vendor circuit breakers.
//! - `config`: Configuration management.
//! - `db`: Database connection and migrations.
//! - `db_storage`: Database storage operations.
//! - `enrichment`: Contact generation and email discovery.
//! - `establishments`: Establishment dataset import.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers and shared state.
//! - `icebreaker`: Ice breaker generation.
//! - `models`: Core data models and status machines.
//! - `report`: Master run and daily report.
//! - `sequence`: Drip sequence engine.
//! - `services`: Hunter, ZeroBounce, Serper and Anthropic clients.
//! - `templating`: Email template rendering.
//! - `throttle`: Per-vendor rate limiting and 429 handling.
//! - `validation`: Email validation batches and credits.
//! - `vendor_models`: Vendor API payloads.
//! - `webhook_handler`: Brevo webhook handler.
//! - `webhook_models`: Webhook payload models.

pub mod api;
pub mod auth;
pub mod brevo_client;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod enrichment;
pub mod errors;
pub mod establishments;
pub mod handlers;
pub mod icebreaker;
pub mod models;
pub mod report;
pub mod sequence;
pub mod services;
pub mod templating;
pub mod throttle;
pub mod validation;
pub mod vendor_models;
pub mod webhook_handler;
pub mod webhook_models;
