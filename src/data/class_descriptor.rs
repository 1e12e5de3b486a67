use std::collections::BTreeMap;
use std::rc::Rc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Server-side names of the collection classes whose instances are
/// themselves observable containers.
pub const LIST_COLLECTION_CLASS: &str = "com.zenesis.qx.remote.collections.ArrayList";
pub const MAP_COLLECTION_CLASS: &str = "com.zenesis.qx.remote.collections.HashMap";

/// A class reference as it appears on the wire: either a name that must
/// already be known, or a complete definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassRef {
    Name(String),
    Definition(Box<ClassDefinition>),
}

impl ClassRef {
    pub fn name(&self) -> &str {
        match self {
            ClassRef::Name(name) => name,
            ClassRef::Definition(def) => &def.class_name,
        }
    }
}

impl From<&str> for ClassRef {
    fn from(name: &str) -> Self {
        ClassRef::Name(name.to_string())
    }
}

impl From<ClassDefinition> for ClassRef {
    fn from(def: ClassDefinition) -> Self {
        ClassRef::Definition(Box::new(def))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassDefinition {
    pub class_name: String,
    pub is_interface: bool,
    pub extend: Option<ClassRef>,
    pub interfaces: Vec<ClassRef>,
    pub methods: BTreeMap<String, MethodDefinition>,
    pub properties: BTreeMap<String, PropertyDefinition>,
    pub events: BTreeMap<String, EventDefinition>,
}

impl ClassDefinition {
    pub fn new(class_name: impl Into<String>) -> Self {
        ClassDefinition {
            class_name: class_name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MethodDefinition {
    pub static_method: bool,
    pub cache_result: bool,
    /// "wrap" or "native" when the method returns an array
    pub return_array: Option<String>,
    pub map: bool,
    pub return_type: Option<ClassRef>,
    pub parameters: Vec<Option<ClassRef>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PropertyDefinition {
    pub nullable: bool,
    pub read_only: bool,
    pub on_demand: bool,
    /// "queue" for queued synchronisation, anything else is immediate
    pub sync: Option<String>,
    pub event: Option<String>,
    /// Scalar type name ("Boolean", "Integer", "Number", "String", "Date") or a class name
    pub check: Option<String>,
    pub clazz: Option<ClassRef>,
    /// "wrap" or "native"
    pub array: Option<String>,
    pub map: bool,
    pub array_class: Option<ClassRef>,
    pub key_type_name: Option<String>,
    pub component_type_name: Option<String>,
    pub create: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventDefinition {
    pub is_property: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Immediate,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerKind {
    #[default]
    None,
    WrappedList,
    WrappedMap,
    NativeArray,
}

impl ContainerKind {
    pub(crate) fn from_wire(array: Option<&str>, map: bool) -> Self {
        match (array, map) {
            (_, true) => ContainerKind::WrappedMap,
            (Some("wrap"), _) => ContainerKind::WrappedList,
            (Some(_), _) => ContainerKind::NativeArray,
            (None, false) => ContainerKind::None,
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, ContainerKind::WrappedList | ContainerKind::WrappedMap)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub nullable: bool,
    pub read_only: bool,
    pub on_demand: bool,
    pub sync: SyncMode,
    pub container: ContainerKind,
    pub value_type: Option<String>,
    pub element_type: Option<String>,
    pub key_type: Option<String>,
    pub change_event: String,
    pub check: Option<String>,
    pub create: bool,
}

impl PropertyDescriptor {
    /// Name of the server getter used to fetch an on-demand value
    pub fn server_getter(&self) -> String {
        format!("get{}", upper_first(&self.name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    pub is_static: bool,
    pub caches_result: bool,
    pub return_container: ContainerKind,
    pub return_type: Option<String>,
    pub parameter_types: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDescriptor {
    pub name: String,
    pub is_property: bool,
}

/// A synthesized member of a class, looked up by name.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Get(Rc<PropertyDescriptor>),
    GetAsync(Rc<PropertyDescriptor>),
    Set(Rc<PropertyDescriptor>),
    Expire(Rc<PropertyDescriptor>),
    Invoke(Rc<MethodDescriptor>),
}

/// Runtime type of a proxy, built once per class name.
///
/// Lookups (`property`, `method`, `event`, `member`) see the flattened view
/// including everything inherited from the superclass chain and interfaces.
#[derive(Debug)]
pub struct ClassDescriptor {
    pub class_name: String,
    pub is_interface: bool,
    pub superclass: Option<Rc<ClassDescriptor>>,
    pub interfaces: Vec<Rc<ClassDescriptor>>,
    /// Properties declared on this class, in declaration order
    pub properties: Vec<Rc<PropertyDescriptor>>,
    pub methods: AHashMap<String, Rc<MethodDescriptor>>,
    pub events: AHashMap<String, Rc<EventDescriptor>>,
    all_properties: Vec<Rc<PropertyDescriptor>>,
    property_index: AHashMap<String, usize>,
    all_methods: AHashMap<String, Rc<MethodDescriptor>>,
    all_events: AHashMap<String, Rc<EventDescriptor>>,
    dispatch: AHashMap<String, Member>,
}

impl ClassDescriptor {
    pub(crate) fn new(
        class_name: String,
        is_interface: bool,
        superclass: Option<Rc<ClassDescriptor>>,
        interfaces: Vec<Rc<ClassDescriptor>>,
        properties: Vec<Rc<PropertyDescriptor>>,
        methods: AHashMap<String, Rc<MethodDescriptor>>,
        events: AHashMap<String, Rc<EventDescriptor>>,
    ) -> Self {
        let mut all_properties: Vec<Rc<PropertyDescriptor>> = Vec::new();
        let mut all_methods = AHashMap::new();
        let mut all_events = AHashMap::new();

        let inherited = superclass.iter().chain(interfaces.iter());
        for parent in inherited {
            for prop in &parent.all_properties {
                if !all_properties.iter().any(|p| p.name == prop.name) {
                    all_properties.push(prop.clone());
                }
            }
            for (name, method) in &parent.all_methods {
                all_methods.insert(name.clone(), method.clone());
            }
            for (name, event) in &parent.all_events {
                all_events.insert(name.clone(), event.clone());
            }
        }
        for prop in &properties {
            match all_properties.iter().position(|p| p.name == prop.name) {
                Some(pos) => all_properties[pos] = prop.clone(),
                None => all_properties.push(prop.clone()),
            }
        }
        for (name, method) in &methods {
            all_methods.insert(name.clone(), method.clone());
        }
        for (name, event) in &events {
            all_events.insert(name.clone(), event.clone());
        }

        let property_index = all_properties
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();

        let mut dispatch = AHashMap::new();
        for prop in &all_properties {
            let up = upper_first(&prop.name);
            dispatch.insert(format!("get{}", up), Member::Get(prop.clone()));
            dispatch.insert(format!("get{}Async", up), Member::GetAsync(prop.clone()));
            dispatch.insert(format!("set{}", up), Member::Set(prop.clone()));
            if prop.on_demand {
                dispatch.insert(format!("expire{}", up), Member::Expire(prop.clone()));
            }
        }
        // Methods win over synthesized accessors of the same name
        for (name, method) in &all_methods {
            dispatch.insert(name.clone(), Member::Invoke(method.clone()));
        }

        ClassDescriptor {
            class_name,
            is_interface,
            superclass,
            interfaces,
            properties,
            methods,
            events,
            all_properties,
            property_index,
            all_methods,
            all_events,
            dispatch,
        }
    }

    pub fn property(&self, name: &str) -> Option<&Rc<PropertyDescriptor>> {
        self.property_index.get(name).map(|&i| &self.all_properties[i])
    }

    /// All properties including inherited ones, superclass first
    pub fn all_properties(&self) -> &[Rc<PropertyDescriptor>] {
        &self.all_properties
    }

    pub fn method(&self, name: &str) -> Option<&Rc<MethodDescriptor>> {
        self.all_methods.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&Rc<EventDescriptor>> {
        self.all_events.get(name)
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.dispatch.get(name)
    }

    /// True if this class is `class_name` or derives from / implements it.
    pub fn is_a(&self, class_name: &str) -> bool {
        self.class_name == class_name
            || self.superclass.as_ref().map_or(false, |s| s.is_a(class_name))
            || self.interfaces.iter().any(|i| i.is_a(class_name))
    }

    /// Instances of collection classes carry their own container.
    pub fn collection_kind(&self) -> ContainerKind {
        if self.is_a(LIST_COLLECTION_CLASS) {
            ContainerKind::WrappedList
        } else if self.is_a(MAP_COLLECTION_CLASS) {
            ContainerKind::WrappedMap
        } else {
            ContainerKind::None
        }
    }
}

pub(crate) fn upper_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
