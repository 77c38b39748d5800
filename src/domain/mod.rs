pub mod compliance;
pub mod market;
pub mod order;
pub mod position;
pub mod state;

pub use compliance::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use state::*;
