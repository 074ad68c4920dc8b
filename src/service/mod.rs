//! In-process registry for the metric points one channel publishes.
//!
//! The actual bus export happens outside this crate; publish() and
//! unpublish() are the seam. Everything else (typed values, unit text
//! formatting, writeable flags) lives here so the channels can be tested
//! without a bus connection.

use log::{debug, info};
use std::collections::HashMap;

pub type TextFormat = fn(f64) -> String;

#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    Text(Option<String>),
    TextArray(Vec<String>),
    Integer(Option<i64>),
    Double(Option<f64>),
}

pub struct MetricItem {
    value: ItemValue,
    writeable: bool,
    format: Option<TextFormat>,
}

impl MetricItem {
    pub fn text(value: Option<String>) -> Self {
        MetricItem { value: ItemValue::Text(value), writeable: false, format: None }
    }

    pub fn text_array(values: Vec<String>) -> Self {
        MetricItem { value: ItemValue::TextArray(values), writeable: false, format: None }
    }

    pub fn integer(value: Option<i64>) -> Self {
        MetricItem { value: ItemValue::Integer(value), writeable: false, format: None }
    }

    pub fn double(value: Option<f64>) -> Self {
        MetricItem { value: ItemValue::Double(value), writeable: false, format: None }
    }

    pub fn writeable(mut self) -> Self {
        self.writeable = true;
        self
    }

    pub fn format(mut self, format: TextFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// One bus service and its set of points.
pub struct MetricService {
    name: String,
    items: HashMap<String, MetricItem>,
    published: bool,
}

impl MetricService {
    pub fn new(name: &str) -> Self {
        MetricService {
            name: name.to_string(),
            items: HashMap::new(),
            published: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_item(&mut self, path: &str, item: MetricItem) {
        self.items.insert(path.to_string(), item);
    }

    pub fn remove_item(&mut self, path: &str) {
        self.items.remove(path);
    }

    pub fn has_item(&self, path: &str) -> bool {
        self.items.contains_key(path)
    }

    pub fn is_writeable(&self, path: &str) -> bool {
        self.items.get(path).map(|i| i.writeable).unwrap_or(false)
    }

    /// Store a numeric reading. Unknown paths are ignored so that a frame
    /// carrying more fields than we publish does not cause trouble.
    pub fn set_double(&mut self, path: &str, value: Option<f64>) {
        match self.items.get_mut(path) {
            Some(item) => item.value = ItemValue::Double(value),
            None => debug!("[{}] ignoring value for unknown path {}", self.name, path),
        }
    }

    pub fn set_integer(&mut self, path: &str, value: Option<i64>) {
        match self.items.get_mut(path) {
            Some(item) => item.value = ItemValue::Integer(value),
            None => debug!("[{}] ignoring value for unknown path {}", self.name, path),
        }
    }

    pub fn set_text(&mut self, path: &str, value: Option<String>) {
        match self.items.get_mut(path) {
            Some(item) => item.value = ItemValue::Text(value),
            None => debug!("[{}] ignoring value for unknown path {}", self.name, path),
        }
    }

    pub fn get_double(&self, path: &str) -> Option<f64> {
        match self.items.get(path)?.value {
            ItemValue::Double(v) => v,
            _ => None,
        }
    }

    pub fn get_integer(&self, path: &str) -> Option<i64> {
        match self.items.get(path)?.value {
            ItemValue::Integer(v) => v,
            _ => None,
        }
    }

    pub fn get_text(&self, path: &str) -> Option<String> {
        match &self.items.get(path)?.value {
            ItemValue::Text(v) => v.clone(),
            _ => None,
        }
    }

    /// Display text for a point, running the unit formatter if one is set.
    pub fn text_of(&self, path: &str) -> Option<String> {
        let item = self.items.get(path)?;
        match &item.value {
            ItemValue::Text(v) => v.clone(),
            ItemValue::TextArray(v) => Some(v.join(",")),
            ItemValue::Integer(v) => v.map(|v| match item.format {
                Some(f) => f(v as f64),
                None => v.to_string(),
            }),
            ItemValue::Double(v) => v.map(|v| match item.format {
                Some(f) => f(v),
                None => v.to_string(),
            }),
        }
    }

    pub fn publish(&mut self) {
        info!("Registering service {} with {} points", self.name, self.items.len());
        self.published = true;
    }

    pub fn unpublish(&mut self) {
        if self.published {
            info!("Unregistering service {}", self.name);
            self.published = false;
        }
    }

    pub fn is_published(&self) -> bool {
        self.published
    }
}

impl Drop for MetricService {
    fn drop(&mut self) {
        self.unpublish();
    }
}
