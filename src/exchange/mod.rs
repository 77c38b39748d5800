pub mod paper;
mod traits;

pub use paper::{PaperExchange, SubmitFault};
pub use traits::{ExchangeClient, ExchangePosition, OrderState};

#[cfg(test)]
pub use traits::MockExchangeClient;
