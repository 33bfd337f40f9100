#![cfg(test)]

//! Capture layer for asserting on span fields in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{Subscriber, span};
use tracing_core::field::{Field, Visit};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

#[derive(Default, Debug)]
pub struct CapturedSpan {
    pub name: String,
    pub fields: HashMap<String, String>,
}

/// Every span seen by the layer, in creation order.
#[derive(Default, Debug)]
pub struct SpanStore {
    spans: Mutex<Vec<(span::Id, CapturedSpan)>>,
}

impl SpanStore {
    /// Fields of the first span named `name`.
    pub fn fields_of(&self, name: &str) -> Option<HashMap<String, String>> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(_, s)| s.fields.clone())
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    store: Arc<SpanStore>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let mut captured = CapturedSpan {
            name: attrs.metadata().name().to_string(),
            ..Default::default()
        };
        attrs.record(&mut FieldVisitor(&mut captured.fields));
        self.store.spans.lock().unwrap().push((id.clone(), captured));
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        let mut spans = self.store.spans.lock().unwrap();
        if let Some((_, captured)) = spans.iter_mut().find(|(sid, _)| sid == id) {
            values.record(&mut FieldVisitor(&mut captured.fields));
        }
    }
}

/// Install the capture layer as the default subscriber for the current
/// thread until the returned guard drops.
pub fn install_capture() -> (Arc<SpanStore>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(SpanStore::default());
    let layer = CaptureLayer { store: store.clone() };
    let subscriber = tracing_subscriber::registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
