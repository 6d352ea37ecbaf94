pub mod cache;
pub mod error;
pub mod image;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use cache::{ChainTip, StateCache};
pub use error::StorageError;
pub use image::{decode_image, encode_image, CacheImage, StoreImage};
pub use sqlite::SqliteStorage;
pub use traits::*;
