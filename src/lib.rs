// HTTP boundary (seller routes, provider ingest, API-key façade)
pub mod api;

// API keys and per-tier quotas
pub mod api_keys;
pub mod rate_limit;

// Seller session resolution
pub mod auth;

// Configuration
pub mod config;

// Component graph shared by the server and the sync worker
pub mod components;

pub mod error;

// Seller integrations and their persistence
pub mod integration;

// OAuth connection lifecycle
pub mod oauth;

// Provider descriptors
pub mod providers;

// Descriptor-driven provider calls
pub mod service;

// Inventory/order sync jobs
pub mod sync;

// Credential encryption at rest
pub mod vault;

// Outbound and inbound webhooks
pub mod webhooks;
