//! Importers convert archive records (as served by a [`portalview_files::source::DataSource`])
//! into our rendering IR. They are pure functions of the records and can run on any thread.
pub mod leaf_importer;
pub mod texture_importer;
