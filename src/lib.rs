pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod materializer;
pub mod model;
pub mod notion;
pub mod orchestrator;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod reconcile;
