mod backend;
mod engine;
mod error;
mod facade;
mod path;
mod sled_backend;

pub use backend::StorageBackend;
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
use path::resolve_data_path;
pub use sled_backend::{CollectionNames, SledStorage};
