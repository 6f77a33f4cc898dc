use std::collections::BTreeMap;
use std::fmt;

use bon::Builder;

/// A sender or recipient address with an optional display name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub display_name: Option<String>,
}

impl Mailbox {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// One outbound message as held by the queue.
///
/// The queue owns it until the dispatch loop has attempted delivery and
/// notified observers; after that it is dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: Mailbox,
    pub to: Vec<String>,
    pub subject: String,
    pub body_html: String,
    /// Caller metadata attached at enqueue time (tags, correlation ids, ...).
    pub metadata: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(
        from: Mailbox,
        to: impl Into<String>,
        subject: impl Into<String>,
        body_html: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to: vec![to.into()],
            subject: subject.into(),
            body_html: body_html.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_recipient(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    /// The address the message was enqueued for.
    pub fn primary_recipient(&self) -> &str {
        self.to.first().map(String::as_str).unwrap_or_default()
    }
}

/// Caller input to [`super::Dispatcher::enqueue`].
///
/// `from` and `from_name` fall back to the dispatcher's default sender.
#[derive(Clone, Debug, Builder)]
pub struct MessageRequest {
    #[builder(into)]
    pub(crate) to: String,
    #[builder(into)]
    pub(crate) subject: String,
    #[builder(into)]
    pub(crate) body_html: String,
    #[builder(into)]
    pub(crate) from: Option<String>,
    #[builder(into)]
    pub(crate) from_name: Option<String>,
}
