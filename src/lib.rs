pub mod cart_forwarder;
pub mod city_store;
pub mod cli_args;
pub mod configuration;
pub mod db;
pub mod distance;
pub mod query_service;
pub mod reqwest_helpers;
pub mod retry;
pub mod server;
