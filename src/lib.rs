pub mod demos;
pub mod rendering;
pub mod settings;
