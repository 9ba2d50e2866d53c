pub mod collection;
pub mod cursor;
pub mod document;
pub mod error;
pub mod events;
pub mod executor;
pub mod index;
pub mod persistence;
pub mod query;
pub mod storage;
pub mod update;
pub mod value;

pub use collection::{
    Collection, CollectionOptions, FindOptions, LogCallback, UpdateOptions, UpdateResult,
};
pub use document::DocumentId;
pub use error::{Error, Result};
