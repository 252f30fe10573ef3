use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

bitflags::bitflags! {
    /// Origin and access of a displayed value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ObjectValueFlags: u32 {
        const FIELD = 1 << 0;
        const PROPERTY = 1 << 1;
        const VARIABLE = 1 << 2;
        const PARAMETER = 1 << 3;
        const LITERAL = 1 << 4;
        const ARRAY_ELEMENT = 1 << 5;
        const GLOBAL = 1 << 6;
        const READ_ONLY = 1 << 7;
        const PUBLIC = 1 << 8;
        const PRIVATE = 1 << 9;
        const ERROR = 1 << 10;
    }
}

/// Address of a value inside a backtrace, like `FR/0/LV/p/Origin/[1]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPath(Vec<String>);

impl ObjectPath {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Path of a child named `name`.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.iter().join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectValueKind {
    Primitive,
    Object,
    Array,
    /// Expression that could not be resolved.
    Unknown,
    /// Evaluation failed, `value` holds the message.
    Error,
    /// Property that was not evaluated because the options disallow it.
    NotEvaluated,
}

/// Display-ready value node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    pub name: String,
    pub path: ObjectPath,
    pub type_name: String,
    pub value: String,
    pub flags: ObjectValueFlags,
    pub kind: ObjectValueKind,
    pub has_children: bool,
    /// Number of children, known upfront for arrays only.
    pub child_count: Option<usize>,
}

impl ObjectValue {
    pub fn primitive(
        path: ObjectPath,
        name: &str,
        type_name: &str,
        value: String,
        flags: ObjectValueFlags,
    ) -> Self {
        Self {
            name: name.to_string(),
            path,
            type_name: type_name.to_string(),
            value,
            flags,
            kind: ObjectValueKind::Primitive,
            has_children: false,
            child_count: None,
        }
    }

    pub fn object(
        path: ObjectPath,
        name: &str,
        type_name: &str,
        value: String,
        flags: ObjectValueFlags,
        has_children: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            path,
            type_name: type_name.to_string(),
            value,
            flags,
            kind: ObjectValueKind::Object,
            has_children,
            child_count: None,
        }
    }

    pub fn array(
        path: ObjectPath,
        name: &str,
        type_name: &str,
        value: String,
        flags: ObjectValueFlags,
        len: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            path,
            type_name: type_name.to_string(),
            value,
            flags,
            kind: ObjectValueKind::Array,
            has_children: len > 0,
            child_count: Some(len),
        }
    }

    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: ObjectPath::new([name]),
            type_name: String::new(),
            value: String::new(),
            flags: ObjectValueFlags::empty(),
            kind: ObjectValueKind::Unknown,
            has_children: false,
            child_count: None,
        }
    }

    pub fn error(path: ObjectPath, name: &str, message: String, flags: ObjectValueFlags) -> Self {
        Self {
            name: name.to_string(),
            path,
            type_name: String::new(),
            value: message,
            flags: flags | ObjectValueFlags::ERROR,
            kind: ObjectValueKind::Error,
            has_children: false,
            child_count: None,
        }
    }

    pub fn not_evaluated(
        path: ObjectPath,
        name: &str,
        type_name: &str,
        flags: ObjectValueFlags,
    ) -> Self {
        Self {
            name: name.to_string(),
            path,
            type_name: type_name.to_string(),
            value: "(not evaluated)".to_string(),
            flags,
            kind: ObjectValueKind::NotEvaluated,
            has_children: false,
            child_count: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ObjectValueKind::Error
    }
}
