use indexmap::IndexMap;

use crate::{
    error::{Error, Result},
    graph::TensorHandle,
};

/// Layer name to tensor, in graph construction order.
#[derive(Debug, Clone, Default)]
pub struct NamedOutputMap {
    entries: IndexMap<String, TensorHandle>,
}

impl NamedOutputMap {
    pub fn new() -> NamedOutputMap {
        NamedOutputMap::default()
    }

    pub fn insert(&mut self, name: &str, handle: TensorHandle) -> Result<()> {
        if self.entries.get_index_of(name).is_some() {
            return Err(Error::Config(format!("duplicate output name: {name}")));
        }
        self.entries.insert_full(name.to_owned(), handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TensorHandle> {
        self.entries.get(name).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, TensorHandle)> {
        self.entries.iter().map(|(k, h)| (k.as_str(), *h))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
