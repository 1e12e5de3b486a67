use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use log::debug;

use crate::data::class_descriptor::upper_first;
use crate::data::{
    ClassDefinition, ClassDescriptor, ClassRef, ContainerKind, EventDescriptor, MethodDescriptor,
    PropertyDescriptor, SyncMode,
};
use crate::{Error, Result};

/// Memoizing registry of synthesized classes.
///
/// A name is either fully defined, currently being defined (a recursive
/// reference to it resolves to `None`), or unknown.
#[derive(Default)]
pub struct ClassRegistry {
    classes: AHashMap<String, Rc<ClassDescriptor>>,
    being_defined: AHashSet<String>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Rc<ClassDescriptor>> {
        self.classes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn is_being_defined(&self, name: &str) -> bool {
        self.being_defined.contains(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Resolves a class reference, building the class from its definition
    /// if it is not known yet.
    ///
    /// Returns `Ok(None)` when the name is currently mid-construction and
    /// `Error::UnknownClass` for a bare name that was never defined.
    pub fn resolve_or_create(&mut self, class_ref: &ClassRef) -> Result<Option<Rc<ClassDescriptor>>> {
        match class_ref {
            ClassRef::Name(name) => self.resolve_name(name),
            ClassRef::Definition(def) => self.define(def),
        }
    }

    fn resolve_name(&self, name: &str) -> Result<Option<Rc<ClassDescriptor>>> {
        if let Some(class) = self.classes.get(name) {
            Ok(Some(class.clone()))
        } else if self.being_defined.contains(name) {
            Ok(None)
        } else {
            Err(Error::UnknownClass(name.to_string()))
        }
    }

    fn define(&mut self, def: &ClassDefinition) -> Result<Option<Rc<ClassDescriptor>>> {
        if def.class_name.is_empty() {
            return Err(Error::Protocol("Class definition without a className".to_string()));
        }
        if let Some(existing) = self.classes.get(&def.class_name) {
            return Ok(Some(existing.clone()));
        }
        if self.being_defined.contains(&def.class_name) {
            return Ok(None);
        }

        let mut deferred = Vec::new();
        self.being_defined.insert(def.class_name.clone());
        let built = self.build(def, &mut deferred);
        self.being_defined.remove(&def.class_name);
        let descriptor = built?;

        debug!("Defined class {}", descriptor.class_name);
        self.classes.insert(def.class_name.clone(), descriptor.clone());

        for nested in deferred {
            self.resolve_or_create(&nested)?;
        }
        Ok(Some(descriptor))
    }

    fn build(&mut self, def: &ClassDefinition, deferred: &mut Vec<ClassRef>) -> Result<Rc<ClassDescriptor>> {
        let mut resolve_parent = |class_ref: &ClassRef| -> Result<Rc<ClassDescriptor>> {
            self.resolve_or_create(class_ref)?.ok_or_else(|| {
                Error::Protocol(format!(
                    "Cyclic inheritance: {} extends or implements {}",
                    def.class_name,
                    class_ref.name()
                ))
            })
        };

        let superclass = match &def.extend {
            Some(parent) => Some(resolve_parent(parent)?),
            None => None,
        };
        let interfaces = def
            .interfaces
            .iter()
            .map(|i| resolve_parent(i))
            .collect::<Result<Vec<_>>>()?;

        let mut hint = |class_ref: &Option<ClassRef>| -> Option<String> {
            class_ref.as_ref().map(|r| {
                if let ClassRef::Definition(_) = r {
                    deferred.push(r.clone());
                }
                r.name().to_string()
            })
        };

        let mut properties = Vec::with_capacity(def.properties.len());
        for (name, p) in &def.properties {
            let sync = match p.sync.as_deref() {
                Some("queue") => SyncMode::Queued,
                _ => SyncMode::Immediate,
            };
            let value_type = hint(&p.clazz);
            let element_type = hint(&p.array_class).or_else(|| p.component_type_name.clone());
            properties.push(Rc::new(PropertyDescriptor {
                name: name.clone(),
                nullable: p.nullable,
                read_only: p.read_only,
                on_demand: p.on_demand,
                sync,
                container: ContainerKind::from_wire(p.array.as_deref(), p.map),
                value_type,
                element_type,
                key_type: p.key_type_name.clone(),
                change_event: p
                    .event
                    .clone()
                    .unwrap_or_else(|| format!("change{}", upper_first(name))),
                check: p.check.clone(),
                create: p.create,
            }));
        }

        let mut methods = AHashMap::with_capacity(def.methods.len());
        for (name, m) in &def.methods {
            let return_type = hint(&m.return_type);
            let parameter_types = m.parameters.iter().map(|p| hint(p)).collect();
            methods.insert(
                name.clone(),
                Rc::new(MethodDescriptor {
                    name: name.clone(),
                    is_static: m.static_method,
                    caches_result: m.cache_result,
                    return_container: ContainerKind::from_wire(m.return_array.as_deref(), m.map),
                    return_type,
                    parameter_types,
                }),
            );
        }

        let events = def
            .events
            .iter()
            .map(|(name, e)| {
                (
                    name.clone(),
                    Rc::new(EventDescriptor {
                        name: name.clone(),
                        is_property: e.is_property,
                    }),
                )
            })
            .collect();

        Ok(Rc::new(ClassDescriptor::new(
            def.class_name.clone(),
            def.is_interface,
            superclass,
            interfaces,
            properties,
            methods,
            events,
        )))
    }
}
