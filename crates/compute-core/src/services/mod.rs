pub mod config_loader;
pub mod container_client;
pub mod container_controller;
pub mod container_host;
pub mod discovery;
pub mod events;
pub mod health_monitor;
pub mod orchestrator;
pub mod package_manager;
pub mod package_reader;
pub mod ports;
pub mod process_manager;
pub mod protocol;
