pub mod audit;
pub mod config;
pub mod engine;
pub mod events;
pub mod mover;
pub mod paths;
pub mod pathutil;
pub mod record_store;
pub mod rotate;
pub mod state;
pub mod task;
pub mod template;
pub mod util;
pub mod values;
pub mod warn;
pub mod workbook;
