//! Sign in with Klarna for storefronts: validates Klarna identity tokens,
//! links them to local customer accounts and keeps the linked tokens fresh.

pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod routes;
pub mod services;
