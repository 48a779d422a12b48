use serde::{Deserialize, Serialize};

/// Typed payload value carried by an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

/// Immutable record pushed by producers and consumed once by the pump.
///
/// Sinks only ever see `&Event`; nothing downstream of the queue mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    atom_id: u32,
    uid: u32,
    pid: i32,
    elapsed_ns: i64,
    wall_ns: i64,
    fields: Vec<FieldValue>,
}

impl Event {
    /// Creates an event for `atom_id` stamped at `elapsed_ns`.
    pub fn new(atom_id: u32, elapsed_ns: i64) -> Self {
        Self {
            atom_id,
            uid: 0,
            pid: 0,
            elapsed_ns,
            wall_ns: 0,
            fields: Vec::new(),
        }
    }

    pub fn with_producer(mut self, uid: u32, pid: i32) -> Self {
        self.uid = uid;
        self.pid = pid;
        self
    }

    pub fn with_wall_ns(mut self, wall_ns: i64) -> Self {
        self.wall_ns = wall_ns;
        self
    }

    pub fn with_field(mut self, value: FieldValue) -> Self {
        self.fields.push(value);
        self
    }

    /// Type tag identifying the record schema.
    pub fn atom_id(&self) -> u32 {
        self.atom_id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn elapsed_ns(&self) -> i64 {
        self.elapsed_ns
    }

    pub fn wall_ns(&self) -> i64 {
        self.wall_ns
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }
}
