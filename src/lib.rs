pub mod api;
pub mod cart;
pub mod checkout;
pub mod config;
pub mod database;
pub mod errors;
pub mod logging;
pub mod menu;
pub mod notification;
pub mod submission;
pub mod threadpool;
