pub mod chain;
pub mod farm;
pub mod position;

pub use chain::*;
pub use farm::*;
pub use position::*;
