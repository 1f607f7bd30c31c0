pub mod in_memory;

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Ordered key/value backend holding the applied state of one partition replica.
///
/// A backend is owned by a single partition worker, so implementations only need to be `Send`.
pub trait Storage: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    /// Every (key, value) pair, in key order.
    fn iter(&self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StorageError(String);

impl StorageError {
    pub fn new<T: Into<String>>(message: T) -> Self {
        StorageError(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "storage error: {}", self.0)
    }
}

impl Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError(err.to_string())
    }
}
