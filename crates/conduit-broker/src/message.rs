//! Pooled message carrier.
//!
//! A [`Message`] travels from a producing endpoint to a consuming one.  It
//! carries:
//!
//! - an `id`, unique among live messages and assigned on [`Message::acquire`],
//! - `from` / `to` endpoint addresses (where `to` may be the drop sentinel),
//! - string-keyed [`Properties`] used for route matching,
//! - an identity-keyed side storage for interceptors (see [`StorageKey`]),
//! - an optional attachment payload.
//!
//! Messages are recycled through a bounded lock-free free list.  Recycling
//! is an allocation optimization only: a message that is simply dropped is
//! still cleaned up correctly.
//!
//! # Identity-keyed storage
//!
//! **Storage lookups compare keys by identity, not by value.**  Two
//! interceptors that each create `StorageKey::new("state")` get distinct keys
//! and never see each other's entries.  Keep the key in the interceptor and
//! reuse that same instance (or a clone of it) for `deposit`, `lookup` and
//! `withdraw`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use crossbeam::queue::ArrayQueue;
use serde_json::Value;

/// String-keyed message properties.
pub type Properties = HashMap<String, Value>;

/// Value stored in the side storage.  Values are shared, so duplicating a
/// message copies the handles, not the payloads.
pub type StoredValue = Arc<dyn Any + Send + Sync>;

/// Number of recycled messages kept in the free list.
const POOL_CAPACITY: usize = 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static POOL: LazyLock<ArrayQueue<Message>> = LazyLock::new(|| ArrayQueue::new(POOL_CAPACITY));

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Where a message is headed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A concrete endpoint id.
    Endpoint(String),
    /// Discard the message without delivery.
    Drop,
}

// ---------------------------------------------------------------------------
// Storage keys
// ---------------------------------------------------------------------------

/// Identity token for the message side storage.
///
/// Equality and hashing use the address of the shared allocation, so only
/// clones of one `StorageKey` compare equal.  The label is for diagnostics.
#[derive(Clone)]
pub struct StorageKey(Arc<KeyLabel>);

struct KeyLabel(&'static str);

impl StorageKey {
    /// Create a fresh key, distinct from every other key ever created.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self(Arc::new(KeyLabel(label)))
    }

    /// Diagnostic label given at construction.
    pub fn label(&self) -> &'static str {
        self.0.0
    }
}

impl PartialEq for StorageKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for StorageKey {}

impl Hash for StorageKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({}@{:p})", self.0.0, Arc::as_ptr(&self.0))
    }
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// An attachment that owns a resource which must be released when the
/// message is disposed of.
pub trait Closeable: Any + Send + Sync {
    /// Release the underlying resource.  Called at most once.
    fn close(&mut self);
}

trait CloseableObject: Send + Sync {
    fn close(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Closeable> CloseableObject for T {
    fn close(&mut self) {
        Closeable::close(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

enum Attachment {
    Plain(Box<dyn Any + Send + Sync>),
    Closeable(Box<dyn CloseableObject>),
}

impl Attachment {
    fn as_any(&self) -> &dyn Any {
        match self {
            Self::Plain(value) => value.as_ref(),
            Self::Closeable(resource) => resource.as_any(),
        }
    }

    fn into_any(self) -> Box<dyn Any + Send + Sync> {
        match self {
            Self::Plain(value) => value,
            Self::Closeable(resource) => resource.into_any(),
        }
    }

    fn close(self) {
        if let Self::Closeable(mut resource) = self {
            resource.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The data carrier exchanged between endpoints.
///
/// A message has exactly one owner at a time; handing it to
/// [`Producer::send`](crate::Producer::send) transfers ownership to the
/// broker.
pub struct Message {
    id: u64,
    from: Option<String>,
    to: Option<Destination>,
    properties: Properties,
    storage: HashMap<StorageKey, StoredValue>,
    attachment: Option<Attachment>,
}

impl Message {
    /// Take a message from the pool (or allocate one) and give it a fresh id.
    #[must_use]
    pub fn acquire() -> Self {
        let mut message = POOL.pop().unwrap_or_else(Self::blank);
        message.id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(message_id = message.id, "message acquired");
        message
    }

    /// Create a new message with a fresh id carrying copies of this
    /// message's properties and storage.
    ///
    /// Storage values are shared handles; the payloads themselves are not
    /// deep-copied.  Addresses and the attachment are not carried over.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        let mut copy = Self::acquire();
        copy.properties.clone_from(&self.properties);
        copy.storage.clone_from(&self.storage);
        copy
    }

    /// Clear every field, close a closeable attachment and return the
    /// message to the pool.
    pub fn close(mut self) {
        tracing::trace!(message_id = self.id, "message closed");
        self.reset();
        // A full pool simply lets the message drop.
        let _ = POOL.push(self);
    }

    fn blank() -> Self {
        Self {
            id: 0,
            from: None,
            to: None,
            properties: HashMap::new(),
            storage: HashMap::new(),
            attachment: None,
        }
    }

    fn reset(&mut self) {
        self.id = 0;
        self.from = None;
        self.to = None;
        self.properties.clear();
        self.storage.clear();
        if let Some(attachment) = self.attachment.take() {
            attachment.close();
        }
    }

    // -- Identity and addressing --------------------------------------------

    /// Process-wide id of this message.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the endpoint that sent the message, if it has been sent.
    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn set_from(&mut self, endpoint_id: impl Into<String>) {
        self.from = Some(endpoint_id.into());
    }

    /// Concrete destination endpoint id.  `None` when unset or when the
    /// message is addressed to the drop sentinel.
    pub fn to(&self) -> Option<&str> {
        match &self.to {
            Some(Destination::Endpoint(id)) => Some(id),
            _ => None,
        }
    }

    /// Address the message to a concrete endpoint.
    pub fn set_to(&mut self, endpoint_id: impl Into<String>) {
        self.to = Some(Destination::Endpoint(endpoint_id.into()));
    }

    /// Address the message to the drop sentinel.
    pub fn set_drop(&mut self) {
        self.to = Some(Destination::Drop);
    }

    /// Whether the message is addressed to the drop sentinel.
    pub fn is_drop(&self) -> bool {
        matches!(self.to, Some(Destination::Drop))
    }

    /// Forget the destination.
    pub fn clear_to(&mut self) {
        self.to = None;
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.to.as_ref()
    }

    // -- Properties ---------------------------------------------------------

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// String property, or `None` if absent or not a string.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    // -- Identity-keyed storage ---------------------------------------------

    /// Store `value` under `key`, returning the previous value for that key.
    pub fn deposit<T: Any + Send + Sync>(&mut self, key: &StorageKey, value: T) -> Option<StoredValue> {
        self.storage.insert(key.clone(), Arc::new(value))
    }

    /// Borrow the value stored under `key`, if present and of type `T`.
    pub fn lookup<T: Any + Send + Sync>(&self, key: &StorageKey) -> Option<&T> {
        self.storage.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    /// Remove the value stored under `key`.
    ///
    /// A value of a different type is left in place and `None` is returned.
    pub fn withdraw<T: Any + Send + Sync>(&mut self, key: &StorageKey) -> Option<Arc<T>> {
        if !self.storage.get(key)?.is::<T>() {
            return None;
        }
        self.storage.remove(key)?.downcast::<T>().ok()
    }

    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    // -- Attachment ---------------------------------------------------------

    /// Attach an opaque payload, replacing (and closing) any previous one.
    pub fn attach<T: Any + Send + Sync>(&mut self, payload: T) {
        self.replace_attachment(Attachment::Plain(Box::new(payload)));
    }

    /// Attach a resource that is closed together with the message.
    pub fn attach_closeable<C: Closeable>(&mut self, resource: C) {
        self.replace_attachment(Attachment::Closeable(Box::new(resource)));
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }

    /// Borrow the attachment if it is of type `T`.
    pub fn attachment<T: Any>(&self) -> Option<&T> {
        self.attachment.as_ref()?.as_any().downcast_ref::<T>()
    }

    /// Detach the attachment if it is of type `T`.  Ownership moves to the
    /// caller, so a detached closeable resource is no longer closed by the
    /// message.
    pub fn take_attachment<T: Any>(&mut self) -> Option<T> {
        if !self.attachment.as_ref()?.as_any().is::<T>() {
            return None;
        }
        let payload = self.attachment.take()?.into_any();
        payload.downcast::<T>().ok().map(|boxed| *boxed)
    }

    fn replace_attachment(&mut self, attachment: Attachment) {
        if let Some(previous) = self.attachment.replace(attachment) {
            previous.close();
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.close();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("properties", &self.properties)
            .field("storage", &self.storage.len())
            .field("attachment", &self.attachment.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
