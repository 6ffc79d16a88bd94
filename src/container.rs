//! The accessor layer letting the manager read/write attributes and items
//! on arbitrary user types, plus the built-in [`Record`] container most
//! call sites use directly.

use indexmap::IndexMap;

use crate::error::ContainerError;
use crate::value::Value;

/// Implemented by any type that wants its fields to participate in the
/// dependency graph. Mirrors the accessor surface `xdeps`'s `AttrDict`-backed
/// environments expose to `Manager.ref`.
pub trait Container {
    fn get_attr(&self, name: &str) -> Result<Value, ContainerError> {
        let _ = name;
        Err(ContainerError::NotAttributable)
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), ContainerError> {
        let _ = (name, value);
        Err(ContainerError::NotAttributable)
    }

    fn get_item(&self, key: &Value) -> Result<Value, ContainerError> {
        let _ = key;
        Err(ContainerError::NotIndexable)
    }

    fn set_item(&mut self, key: &Value, value: Value) -> Result<(), ContainerError> {
        let _ = (key, value);
        Err(ContainerError::NotIndexable)
    }

    fn has_item(&self, key: &Value) -> bool {
        let _ = key;
        false
    }

    /// Duplicates this container behind a fresh box, independent of the
    /// original. Lets the manager deep-copy itself without knowing the
    /// concrete container type.
    fn clone_box(&self) -> Box<dyn Container>;
}

/// An ordered, string-keyed map acting as the default container type.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

fn key_as_str(key: &Value) -> Result<&str, ContainerError> {
    match key {
        Value::Str(s) => Ok(s.as_str()),
        _ => Err(ContainerError::NoSuchItem),
    }
}

impl Container for Record {
    fn get_attr(&self, name: &str) -> Result<Value, ContainerError> {
        self.fields
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::NoSuchAttribute(name.to_owned()))
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), ContainerError> {
        self.fields.insert(name.to_owned(), value);
        Ok(())
    }

    fn get_item(&self, key: &Value) -> Result<Value, ContainerError> {
        let key = key_as_str(key)?;
        self.fields
            .get(key)
            .cloned()
            .ok_or(ContainerError::NoSuchItem)
    }

    fn set_item(&mut self, key: &Value, value: Value) -> Result<(), ContainerError> {
        let key = key_as_str(key)?;
        self.fields.insert(key.to_owned(), value);
        Ok(())
    }

    fn has_item(&self, key: &Value) -> bool {
        key_as_str(key)
            .map(|k| self.fields.contains_key(k))
            .unwrap_or(false)
    }

    fn clone_box(&self) -> Box<dyn Container> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrips_attr() {
        let mut r = Record::new();
        r.set_attr("a", Value::Int(1)).unwrap();
        assert!(matches!(r.get_attr("a"), Ok(Value::Int(1))));
    }

    #[test]
    fn record_missing_attr_errors() {
        let r = Record::new();
        assert!(r.get_attr("missing").is_err());
    }

    #[test]
    fn record_item_access_mirrors_attr() {
        let mut r = Record::new();
        r.set_item(&Value::from("k"), Value::Int(7)).unwrap();
        assert!(r.has_item(&Value::from("k")));
        assert!(matches!(r.get_item(&Value::from("k")), Ok(Value::Int(7))));
    }
}
