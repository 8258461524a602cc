//! Objects, hidden-class shapes and the object heap.
//!
//! A shape is the ordered set of property names and their storage offsets;
//! objects with equal shapes share a property layout. Shapes form an
//! append-only transition tree in the registry, so adding the same
//! properties in the same order always reaches the same shape - the
//! property the inline caches rely on.

use core_types::{ErrorKind, JsError, StringId, Value};
use std::collections::HashMap;

/// Hidden-class identifier.
pub type ShapeId = usize;

/// Environment handle (closure scope chain node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub u32);

/// One hidden class.
#[derive(Debug, Clone)]
pub struct Shape {
    /// This shape's id
    pub id: ShapeId,
    /// The shape this one was derived from
    pub parent: Option<ShapeId>,
    /// Property names in storage order
    pub properties: Vec<StringId>,
    offsets: HashMap<StringId, u32>,
    transitions: HashMap<StringId, ShapeId>,
}

impl Shape {
    /// Storage offset of `name` on this shape.
    pub fn offset_of(&self, name: StringId) -> Option<u32> {
        self.offsets.get(&name).copied()
    }

    /// Number of stored properties.
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

/// Registry of all shapes in a realm. Shape 0 is the empty root shape.
#[derive(Debug)]
pub struct ShapeRegistry {
    shapes: Vec<Shape>,
}

impl ShapeRegistry {
    /// Create a registry holding only the root shape.
    pub fn new() -> Self {
        Self {
            shapes: vec![Shape {
                id: 0,
                parent: None,
                properties: Vec::new(),
                offsets: HashMap::new(),
                transitions: HashMap::new(),
            }],
        }
    }

    /// The empty root shape.
    pub fn root(&self) -> ShapeId {
        0
    }

    /// The shape with the given id.
    pub fn get(&self, id: ShapeId) -> &Shape {
        &self.shapes[id]
    }

    /// The shape reached by adding `name` to `from`, creating it on first
    /// use. Identical insertion orders share shapes.
    pub fn transition(&mut self, from: ShapeId, name: StringId) -> ShapeId {
        if let Some(&next) = self.shapes[from].transitions.get(&name) {
            return next;
        }
        let id = self.shapes.len();
        let parent = &self.shapes[from];
        let mut properties = parent.properties.clone();
        let mut offsets = parent.offsets.clone();
        offsets.insert(name, properties.len() as u32);
        properties.push(name);
        self.shapes.push(Shape {
            id,
            parent: Some(from),
            properties,
            offsets,
            transitions: HashMap::new(),
        });
        self.shapes[from].transitions.insert(name, id);
        id
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// What an object is, beyond its named properties.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    /// Ordinary object
    Plain,
    /// Array with dense element storage
    Array {
        /// The elements; `length` is their count
        elements: Vec<Value>,
    },
    /// Closure over a compiled function
    Function {
        /// Index into the program's function table
        function_index: u32,
        /// Captured defining environment
        environment: EnvId,
    },
    /// Host-provided callable, identified by a registration index
    Native {
        /// Index into the realm's native-function table
        native_index: u32,
    },
}

/// A heap object: hidden class plus dense property slots.
#[derive(Debug, Clone)]
pub struct JsObject {
    /// Current shape
    pub shape: ShapeId,
    /// Property storage, indexed by shape offsets
    pub slots: Vec<Value>,
    /// The object's kind payload
    pub kind: ObjectKind,
}

impl JsObject {
    /// A fresh plain object with the root shape.
    pub fn plain(root: ShapeId) -> Self {
        Self {
            shape: root,
            slots: Vec::new(),
            kind: ObjectKind::Plain,
        }
    }

    /// Whether this object can be called.
    pub fn is_callable(&self) -> bool {
        matches!(self.kind, ObjectKind::Function { .. } | ObjectKind::Native { .. })
    }
}

/// Owns every object in a realm; references are indices.
#[derive(Debug, Default)]
pub struct ObjectHeap {
    objects: Vec<JsObject>,
}

impl ObjectHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Allocate an object.
    pub fn alloc(&mut self, object: JsObject) -> core_types::ObjectId {
        let id = core_types::ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    /// Borrow an object.
    pub fn get(&self, id: core_types::ObjectId) -> &JsObject {
        &self.objects[id.0 as usize]
    }

    /// Mutably borrow an object.
    pub fn get_mut(&mut self, id: core_types::ObjectId) -> &mut JsObject {
        &mut self.objects[id.0 as usize]
    }

    /// Read a named property through the shape.
    pub fn get_property(
        &self,
        shapes: &ShapeRegistry,
        id: core_types::ObjectId,
        name: StringId,
    ) -> Option<Value> {
        let object = self.get(id);
        let offset = shapes.get(object.shape).offset_of(name)?;
        object.slots.get(offset as usize).copied()
    }

    /// Write a named property, transitioning the shape when the property
    /// is new.
    pub fn set_property(
        &mut self,
        shapes: &mut ShapeRegistry,
        id: core_types::ObjectId,
        name: StringId,
        value: Value,
    ) {
        let object = self.get_mut(id);
        if let Some(offset) = shapes.get(object.shape).offset_of(name) {
            object.slots[offset as usize] = value;
            return;
        }
        let next = shapes.transition(object.shape, name);
        object.shape = next;
        object.slots.push(value);
    }

    /// Read an array element. Out-of-range reads produce `undefined`.
    pub fn get_element(&self, id: core_types::ObjectId, index: usize) -> Value {
        match &self.get(id).kind {
            ObjectKind::Array { elements } => {
                elements.get(index).copied().unwrap_or(Value::undefined())
            }
            _ => Value::undefined(),
        }
    }

    /// Write an array element. Stores past the current length are a
    /// `RangeError`; arrays do not grow implicitly.
    pub fn set_element(
        &mut self,
        id: core_types::ObjectId,
        index: usize,
        value: Value,
    ) -> Result<(), JsError> {
        match &mut self.get_mut(id).kind {
            ObjectKind::Array { elements } => {
                if index < elements.len() {
                    elements[index] = value;
                    Ok(())
                } else {
                    Err(JsError::new(
                        ErrorKind::RangeError,
                        format!("Index {} out of bounds for length {}", index, elements.len()),
                    ))
                }
            }
            _ => Ok(()), // element stores on non-arrays are ignored
        }
    }

    /// Array length, if the object is an array.
    pub fn array_length(&self, id: core_types::ObjectId) -> Option<usize> {
        match &self.get(id).kind {
            ObjectKind::Array { elements } => Some(elements.len()),
            _ => None,
        }
    }

    /// Append to an array, returning the new length.
    pub fn array_push(&mut self, id: core_types::ObjectId, value: Value) -> usize {
        match &mut self.get_mut(id).kind {
            ObjectKind::Array { elements } => {
                elements.push(value);
                elements.len()
            }
            _ => 0,
        }
    }

    /// Remove and return the last element; `undefined` when empty.
    pub fn array_pop(&mut self, id: core_types::ObjectId) -> Value {
        match &mut self.get_mut(id).kind {
            ObjectKind::Array { elements } => elements.pop().unwrap_or(Value::undefined()),
            _ => Value::undefined(),
        }
    }

    /// Remove `delete_count` elements starting at `start`, returning the
    /// removed elements. `start` is clamped to the length.
    pub fn array_splice(
        &mut self,
        id: core_types::ObjectId,
        start: usize,
        delete_count: usize,
    ) -> Vec<Value> {
        match &mut self.get_mut(id).kind {
            ObjectKind::Array { elements } => {
                let start = start.min(elements.len());
                let end = (start + delete_count).min(elements.len());
                elements.drain(start..end).collect()
            }
            _ => Vec::new(),
        }
    }
}
