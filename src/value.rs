use crate::NodeIndex;
use enum_as_inner::EnumAsInner;
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// A dynamically typed, cheaply clonable settled value.
///
/// Both resolution values and rejection reasons are payloads. The engine
/// moves payloads between nodes without ever inspecting them; callers
/// recover the concrete type at the edges with [`Payload::downcast_ref`].
///
/// Cloning a payload clones an `Rc`, so a single value fanned out to many
/// dependants is shared, not duplicated.
#[derive(Clone)]
pub struct Payload(Rc<dyn Any>);

impl Payload {
    pub fn new<T: 'static>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// Borrow the contained value if it is a `T`.
    #[inline]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

/// The value slot of a node, tagged with how it was produced.
///
/// `Curried` holds the arena index of a nested promise; the owning link to
/// that node is the prerequisite edge in the graph, not this value. An
/// `Empty` slot is only legal on nodes that have not executed yet and on
/// finally nodes after they ran.
#[derive(Debug, Clone, EnumAsInner)]
pub enum TaggedValue {
    Empty,
    Resolved(Payload),
    Rejected(Payload),
    Curried(NodeIndex),
}

impl TaggedValue {
    /// The payload of a settled value, resolved or rejected alike.
    #[inline]
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            TaggedValue::Resolved(p) | TaggedValue::Rejected(p) => Some(p),
            _ => None,
        }
    }
}
