// src/lib.rs

pub mod types;
pub mod signature;
pub mod mempool;
pub mod consensus;
pub mod ledger;
pub mod validator;
pub mod runtime;
pub mod scheduler;
pub mod config;
pub mod http;
