//! Authentication collaborator: who is signed in, their bearer token, and a
//! signal that fires whenever that changes. Token storage itself lives elsewhere.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Authenticated user id used to scope channel addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for SubjectId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

pub trait SessionSource: Send + Sync {
    fn current_subject(&self) -> Option<SubjectId>;

    fn bearer_token(&self) -> Option<String>;

    /// Receiver that observes every sign-in / sign-out. The value is the subject
    /// after the change.
    fn session_changes(&self) -> watch::Receiver<Option<SubjectId>>;
}

/// In-process session holder; the app shell updates it on login and logout.
#[derive(Debug)]
pub struct AuthSession {
    subject: watch::Sender<Option<SubjectId>>,
    token: RwLock<Option<String>>,
}

impl Default for AuthSession {
    fn default() -> Self {
        let (subject, _) = watch::channel(None);
        Self {
            subject,
            token: RwLock::new(None),
        }
    }
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(subject: impl Into<SubjectId>, token: Option<String>) -> Self {
        let session = Self::default();
        session.sign_in(subject, token);
        session
    }

    pub fn sign_in(&self, subject: impl Into<SubjectId>, token: Option<String>) {
        *self.token.write() = token;
        let subject = Some(subject.into());
        self.subject.send_if_modified(|current| {
            if *current == subject {
                false
            } else {
                *current = subject;
                true
            }
        });
    }

    pub fn sign_out(&self) {
        *self.token.write() = None;
        self.subject.send_if_modified(|current| current.take().is_some());
    }
}

impl SessionSource for AuthSession {
    fn current_subject(&self) -> Option<SubjectId> {
        self.subject.borrow().clone()
    }

    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn session_changes(&self) -> watch::Receiver<Option<SubjectId>> {
        self.subject.subscribe()
    }
}
