pub mod auth;
pub mod auth_context;
pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod gate;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
