pub mod core;
pub mod items;
pub mod results;
pub mod selection;
pub mod setup;
pub mod terms;
