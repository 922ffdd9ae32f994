pub mod registry;
pub mod square;
pub mod stripe;
pub mod traits;

pub use registry::ProviderRegistry;
pub use square::SquareProvider;
pub use stripe::StripeProvider;
pub use traits::{Charge, ChargePage, PaymentProvider};
