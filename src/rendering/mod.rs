pub mod asset_graph;
pub mod backend;
pub mod common;
pub mod importer;
pub mod resource_manager;
