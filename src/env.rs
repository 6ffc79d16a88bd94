//! The environment facade: pairs a container with its root reference so that
//! writes route through the manager (and so become tracked) while reads go
//! straight to the container. Grounded on `xdeps.tasks.DepEnv`.

use crate::error::ManagerError;
use crate::manager::{Assignable, Manager};
use crate::refs::Ref;
use crate::value::Value;

pub struct Environment<'m> {
    manager: &'m mut Manager,
    root: Ref,
}

impl<'m> Environment<'m> {
    pub fn new(manager: &'m mut Manager, root: Ref) -> Self {
        Environment { manager, root }
    }

    pub fn root(&self) -> &Ref {
        &self.root
    }

    pub fn get_attr(&self, name: &str) -> Result<Value, ManagerError> {
        self.root.attr(name).get_value()
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<Assignable>) -> Result<(), ManagerError> {
        let target = self.root.attr(name);
        self.manager.set_value(&target, value)
    }

    pub fn get_item(&self, key: impl Into<Value>) -> Result<Value, ManagerError> {
        self.root.item(key.into()).get_value()
    }

    pub fn set_item(&mut self, key: impl Into<Value>, value: impl Into<Assignable>) -> Result<(), ManagerError> {
        let target = self.root.item(key.into());
        self.manager.set_value(&target, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Record;

    #[test]
    fn writes_route_through_manager() {
        let mut m = Manager::new();
        let root = m.register_container(Box::new(Record::new()), "env").unwrap();
        {
            let mut env = Environment::new(&mut m, root.clone());
            env.set_attr("a", Value::Int(1)).unwrap();
        }
        assert!(matches!(root.attr("a").get_value().unwrap(), Value::Int(1)));
    }
}
