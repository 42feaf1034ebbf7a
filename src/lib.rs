//! This crate implements an async mysql/mariadb wire protocol client with pooled connections
pub mod auth;
pub mod connection;
pub mod constants;
pub mod decode;
pub mod package;
pub mod package_parser;
pub mod pool;
pub mod row;
