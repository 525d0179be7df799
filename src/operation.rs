use std::collections::HashMap;

use crate::AttributeValue;

/// A node of the graph: one operator application
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub name: String,
    pub op_type: String,
    /// Value names consumed, in operator argument order
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: HashMap<String, AttributeValue>,
}

impl OperationInfo {
    pub fn get_attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn get_int_attribute(&self, name: &str) -> Option<i64> {
        self.attributes.get(name).and_then(AttributeValue::as_int)
    }

    pub fn get_float_attribute(&self, name: &str) -> Option<f32> {
        self.attributes.get(name).and_then(AttributeValue::as_float)
    }

    pub fn get_ints_attribute(&self, name: &str) -> Option<&[i64]> {
        self.attributes.get(name).and_then(AttributeValue::as_ints)
    }

    /// Attribute names in lexical order
    pub fn attribute_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.attributes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
