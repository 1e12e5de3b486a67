mod class_descriptor;
mod class_registry;
mod codec;
mod collections;
mod command_queue;
mod events;
mod object_store;
mod pending;
mod proxy_object;
mod sequencer;
mod session;
mod value;

pub use class_descriptor::{
    ClassDefinition, ClassDescriptor, ClassRef, ContainerKind, EventDefinition, EventDescriptor, Member,
    MethodDefinition, MethodDescriptor, PropertyDefinition, PropertyDescriptor, SyncMode, LIST_COLLECTION_CLASS,
    MAP_COLLECTION_CLASS,
};
pub use class_registry::ClassRegistry;
pub use codec::{decode_scalar, encode_date, encode_decimal, format_date, parse_date};
#[cfg(test)]
pub(crate) use codec::value_order;
pub use collections::{ListChange, MapChange, MapChangeKind, MapEntryChange, ProxyList, ProxyMap};
pub use command_queue::{CommandQueue, DirtyCollection, DirtyDelta};
pub use events::{
    EventListeners, ListenerId, ProxyEvent, SessionEvent, SessionEventKind, SessionListeners, Watchers,
};
pub use object_store::ObjectStore;
pub use pending::{CallResult, Callback, Notify, PendingCall, PendingCalls, Promise};
pub use proxy_object::{ProxyObject, CHANGE_SERVER_ID_EVENT};
pub use sequencer::{InFlightRequest, Placement, Sequencer};
pub use session::{PreRequestHook, Session, SessionStats};
pub use value::{ArcString, Decimal, Value};

pub type Timestamp = time::OffsetDateTime;

pub fn now() -> Timestamp {
    time::OffsetDateTime::now_utc()
}
