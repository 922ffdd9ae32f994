pub mod mapping;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod traits;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::ReconStore;
