pub mod delivery;
pub mod feed;
pub mod processor;
pub mod repository;
pub mod resolver;
pub mod service;
pub mod types;
pub mod worker;
