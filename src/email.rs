//! `EmailMessage`: the internal representation of a send request, carrying
//! one or more recipient personalizations rather than a single
//! to/cc/bcc set, since each recipient may need distinct substitutions
//! and a distinct subject line (see SPEC_FULL.md §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::address::{Address, ToAddress};
use crate::attachment::Attachment;

/// One recipient plus their per-recipient overrides.
///
/// `substitutions` feeds the two-pass placeholder expansion in
/// `crate::substitution`: handlebar (`{{name}}`) and hyphen (`-name-`)
/// tokens in the message content are replaced with these values before
/// the ESP adapter sends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Personalization {
    pub to: Address,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: Option<String>,
    pub substitutions: HashMap<String, String>,
}

impl Personalization {
    pub fn new(to: impl ToAddress) -> Self {
        Self {
            to: to.to_address(),
            ..Default::default()
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn substitute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.substitutions.insert(name.into(), value.into());
        self
    }
}

/// Batch hints carried on a send request. A non-zero `batch_size` routes the
/// message into the Batched Send Scheduler (§4.D) instead of a direct send.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CustomArgs {
    pub batch_size: u32,
    pub batch_interval_seconds: u32,
}

impl CustomArgs {
    pub fn is_batch(&self) -> bool {
        self.batch_size > 0
    }
}

/// A message ready for routing: a sender, a list of recipient
/// personalizations, shared content, and shared metadata.
///
/// The builder pattern mirrors the teacher crate's `Email`, generalized so
/// that `to`/`cc`/`bcc` are per-personalization rather than flat lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: Option<Address>,
    pub reply_to: Vec<Address>,
    pub personalizations: Vec<Personalization>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: HashMap<String, String>,
    pub categories: Vec<String>,
    /// Named content fragments that may themselves contain placeholders;
    /// expanded in the second substitution pass (§4.C).
    pub sections: HashMap<String, String>,
    pub custom_args: CustomArgs,
}

impl EmailMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, addr: impl ToAddress) -> Self {
        self.from = Some(addr.to_address());
        self
    }

    pub fn personalize(mut self, personalization: Personalization) -> Self {
        self.personalizations.push(personalization);
        self
    }

    pub fn to(mut self, addr: impl ToAddress) -> Self {
        self.personalizations.push(Personalization::new(addr));
        self
    }

    pub fn reply_to(mut self, addr: impl ToAddress) -> Self {
        self.reply_to.push(addr.to_address());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    pub fn html_body(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn section(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.sections.insert(name.into(), content.into());
        self
    }

    pub fn batch(mut self, size: u32, interval_seconds: u32) -> Self {
        self.custom_args = CustomArgs {
            batch_size: size,
            batch_interval_seconds: interval_seconds,
        };
        self
    }

    /// Required fields present: a sender and at least one recipient.
    pub fn is_valid(&self) -> bool {
        self.from.is_some() && !self.personalizations.is_empty()
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn inline_attachments(&self) -> Vec<&Attachment> {
        self.attachments.iter().filter(|a| a.is_inline()).collect()
    }

    pub fn regular_attachments(&self) -> Vec<&Attachment> {
        self.attachments.iter().filter(|a| !a.is_inline()).collect()
    }
}
