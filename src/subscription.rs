use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::protocol::FieldValue;

pub type ItemUpdateHandler = Box<dyn Fn(&ItemUpdate<'_>) + Send + Sync>;
pub type SubscribedHandler = Box<dyn Fn(i32, i32) + Send + Sync>;
pub type SubscriptionErrorHandler = Box<dyn Fn(i32, &str) + Send + Sync>;

/// Ordered list of names with a name to position lookup built once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameDesc {
    names: Vec<String>,
    joined: String,
    positions: HashMap<String, usize>,
}

impl NameDesc {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let joined = names.join(" ");
        let positions = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Self {
            names,
            joined,
            positions,
        }
    }

    /// Parses a space separated group or schema name.
    pub fn parse(spec: &str) -> Self {
        Self::new(spec.split_whitespace())
    }

    /// Space separated form sent as `LS_group` / `LS_schema`.
    pub fn names(&self) -> &str {
        &self.joined
    }

    /// Zero-based position of `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The request shape of a subscription plus the handlers that receive its events.
///
/// Built with the `with_*` / `on_*` methods, then handed to a session. Totals are
/// filled in once the server acknowledges it.
#[derive(Default)]
pub struct Subscription {
    mode: String,
    items: NameDesc,
    fields: NameDesc,
    snapshot: Option<bool>,
    data_adapter: Option<String>,
    requested_max_frequency: Option<String>,
    requested_buffer_size: Option<u32>,
    totals: Mutex<Option<(i32, i32)>>,
    on_item_update: Option<ItemUpdateHandler>,
    on_subscription: Option<SubscribedHandler>,
    on_subscription_error: Option<SubscriptionErrorHandler>,
}

impl Subscription {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            ..Default::default()
        }
    }

    pub fn with_items<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items = NameDesc::new(items);
        self
    }

    pub fn with_item_group(mut self, group: &str) -> Self {
        self.items = NameDesc::parse(group);
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = NameDesc::new(fields);
        self
    }

    pub fn with_field_schema(mut self, schema: &str) -> Self {
        self.fields = NameDesc::parse(schema);
        self
    }

    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_data_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.data_adapter = Some(adapter.into());
        self
    }

    /// `"unfiltered"` or a number of updates per second.
    pub fn with_requested_max_frequency(mut self, frequency: impl Into<String>) -> Self {
        self.requested_max_frequency = Some(frequency.into());
        self
    }

    pub fn with_requested_buffer_size(mut self, size: u32) -> Self {
        self.requested_buffer_size = Some(size);
        self
    }

    pub fn on_item_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ItemUpdate<'_>) + Send + Sync + 'static,
    {
        self.on_item_update = Some(Box::new(handler));
        self
    }

    /// Called with the total items and fields once the subscription is active.
    pub fn on_subscription<F>(mut self, handler: F) -> Self
    where
        F: Fn(i32, i32) + Send + Sync + 'static,
    {
        self.on_subscription = Some(Box::new(handler));
        self
    }

    pub fn on_subscription_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.on_subscription_error = Some(Box::new(handler));
        self
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn items(&self) -> &NameDesc {
        &self.items
    }

    pub fn fields(&self) -> &NameDesc {
        &self.fields
    }

    pub fn snapshot(&self) -> Option<bool> {
        self.snapshot
    }

    pub fn data_adapter(&self) -> Option<&str> {
        self.data_adapter.as_deref()
    }

    pub fn requested_max_frequency(&self) -> Option<&str> {
        self.requested_max_frequency.as_deref()
    }

    pub fn requested_buffer_size(&self) -> Option<u32> {
        self.requested_buffer_size
    }

    pub fn total_items(&self) -> Option<i32> {
        self.totals.lock().map(|(items, _)| items)
    }

    pub fn total_fields(&self) -> Option<i32> {
        self.totals.lock().map(|(_, fields)| fields)
    }

    pub(crate) fn fire_subscription(&self, total_items: i32, total_fields: i32) {
        *self.totals.lock() = Some((total_items, total_fields));

        if let Some(handler) = &self.on_subscription {
            handler(total_items, total_fields);
        }
    }

    pub(crate) fn fire_item_update(&self, item: u32, values: &[FieldValue]) {
        if let Some(handler) = &self.on_item_update {
            handler(&ItemUpdate {
                item,
                values,
                subscription: self,
            });
        }
    }

    pub(crate) fn fire_subscription_error(&self, code: i32, message: &str) {
        if let Some(handler) = &self.on_subscription_error {
            handler(code, message);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("mode", &self.mode)
            .field("items", &self.items.names())
            .field("fields", &self.fields.names())
            .field("snapshot", &self.snapshot)
            .field("data_adapter", &self.data_adapter)
            .finish_non_exhaustive()
    }
}

/// One update for one item, valid only for the duration of the handler call.
#[derive(Debug)]
pub struct ItemUpdate<'a> {
    item: u32,
    values: &'a [FieldValue],
    subscription: &'a Subscription,
}

impl<'a> ItemUpdate<'a> {
    /// 1-based item position within the subscribed group.
    pub fn item_pos(&self) -> u32 {
        self.item
    }

    pub fn item_name(&self) -> Option<&'a str> {
        let index = (self.item as usize).checked_sub(1)?;
        self.subscription.items.get(index)
    }

    /// Value at 1-based field position.
    pub fn value(&self, pos: usize) -> Option<&'a FieldValue> {
        self.values.get(pos.checked_sub(1)?)
    }

    pub fn value_by_name(&self, field: &str) -> Option<&'a FieldValue> {
        self.values.get(self.subscription.fields.position(field)?)
    }

    /// All values paired with their 1-based position.
    pub fn fields_by_position(&self) -> impl Iterator<Item = (usize, &'a FieldValue)> + 'a {
        self.values.iter().enumerate().map(|(i, v)| (i + 1, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the update carries exactly one value per schema field.
    pub fn matches_schema(&self) -> bool {
        self.values.len() == self.subscription.fields.len()
    }
}
