//! Command context and envelope types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Cross-cutting metadata passed alongside a command or event.
///
/// Carries audit trail, correlation, and idempotency information without
/// polluting the entity's event types. Every field ends up in the headers
/// of the [`Commit`](crate::Commit) produced by a save.
///
/// # Examples
///
/// ```
/// use eventfold_domain::CommandContext;
/// use uuid::Uuid;
///
/// let command_id = Uuid::new_v4();
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_command_id(command_id)
///     .with_header("source", "api");
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert_eq!(ctx.command_id, Some(command_id));
/// assert_eq!(ctx.headers.get("source").map(String::as_str), Some("api"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across entities.
    pub correlation_id: Option<String>,
    /// Identifier of the message being processed. When set it becomes the
    /// commit id, so redelivering the same message is detected as a
    /// duplicate commit instead of being applied twice.
    pub command_id: Option<Uuid>,
    /// Arbitrary headers copied onto the commit.
    pub headers: BTreeMap<String, String>,
}

impl CommandContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the command ID used as the idempotency key of the commit.
    pub fn with_command_id(mut self, id: Uuid) -> Self {
        self.command_id = Some(id);
        self
    }

    /// Add a single header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Build the commit headers for an entity of `kind`.
    ///
    /// Custom headers are written first so the reserved `kind`, `actor`
    /// and `correlation_id` keys always reflect the context fields.
    pub(crate) fn commit_headers(&self, kind: &str) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        headers.insert("kind".to_owned(), kind.to_owned());
        if let Some(ref actor) = self.actor {
            headers.insert("actor".to_owned(), actor.clone());
        }
        if let Some(ref cid) = self.correlation_id {
            headers.insert("correlation_id".to_owned(), cid.clone());
        }
        headers
    }
}

/// A type-erased command produced by a saga for some other entity.
///
/// The saga runtime does not know the concrete command type of the target,
/// so the payload travels as JSON and the dispatch layer deserializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Target entity kind.
    pub kind: String,
    /// Target entity identifier.
    pub id: Uuid,
    /// JSON-serialized command payload.
    pub command: Value,
    /// Metadata forwarded to the command handler.
    pub context: CommandContext,
}

impl CommandEnvelope {
    /// Serialize `command` into an envelope addressed to `kind`/`id`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized.
    pub fn new<C: Serialize>(
        kind: impl Into<String>,
        id: Uuid,
        command: &C,
        context: CommandContext,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.into(),
            id,
            command: serde_json::to_value(command)?,
            context,
        })
    }
}
