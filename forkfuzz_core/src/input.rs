use serde::{Serialize, de::DeserializeOwned};

/// A value a generator produces and a deploy operation consumes.
///
/// Inputs are produced inside a worker process and shipped back to the
/// supervisor so a failure report can carry them, hence the serde bounds.
pub trait Input: Clone + std::fmt::Debug + Serialize + DeserializeOwned + 'static {
    fn as_bytes(&self) -> &[u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
}

impl Input for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}

impl Input for String {
    fn as_bytes(&self) -> &[u8] {
        self.as_str().as_bytes()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}
