use crate::digest::ContentDigest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type Program = String;
pub type Args = Vec<String>;
pub type Envs = Vec<(String, String)>;
pub type OutputBlob = bytes::Bytes;

/// One unit of work: an opaque, immutable payload such as a tile polygon in WKT.
///
/// Identity is content. Two descriptors with the same canonical form are the same job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDescriptor(Value);

impl JobDescriptor {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self(payload.into())
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    /// Stable text form used for hashing and for the job log header.
    ///
    /// A string payload is its raw text. Anything else is compact JSON, whose object
    /// keys come out sorted.
    pub fn canonical(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn digest(&self) -> ContentDigest {
        ContentDigest::of(self.canonical().as_bytes())
    }

    /// `null` and `""` describe nothing and are rejected at batch start.
    pub fn is_blank(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for JobDescriptor {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for JobDescriptor {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
