//! Siteforge - per-site container provisioning behind a subdomain proxy
//!
//! Each invocation performs one action on one site:
//! - Normalizes the site name into a slug used for the workspace, container and subdomain
//! - Fetches the source from a template, a git clone or an uploaded archive
//! - Detects the stack, renders a Dockerfile, builds the image and runs the container
//! - Records the site in a primary database and mirrors it to a local JSON store
//! - Regenerates the nginx subdomain map and reloads the proxy

pub mod builder;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod fallback;
pub mod lock;
pub mod orchestrator;
pub mod persistence;
pub mod postgres;
pub mod proxy_map;
pub mod runtime;
pub mod sitelog;
pub mod slug;
pub mod source;
pub mod stack;
pub mod store;
