//! Callback-style update API.
//!
//! Kept for callers written against the older update interface. It adds no
//! behaviour of its own: every call goes through
//! [`UpdateSource::update`](super::update_source::UpdateSource::update)'s
//! path, including the Active-state gate.

use bytes::Bytes;

use super::update_source::{UpdateKind, UpdateSource, UpdateStatus};
use crate::conversation::DiscardReason;
use crate::error::{Result, ServiceError, SessionError};

type Callback<T> = Box<dyn FnOnce(T) + Send>;

/// Parameters of one legacy update. Exactly one callback runs.
pub struct UpdateValueParams {
    pub topic_path: String,
    pub value: Bytes,
    /// The server applied the update.
    pub on_success: Callback<()>,
    /// The update completed with a status other than `Ok`.
    pub on_failure: Callback<UpdateStatus>,
    /// The server rejected the request.
    pub on_error: Callback<ServiceError>,
    /// No outcome is known.
    pub on_discard: Callback<DiscardReason>,
}

impl UpdateValueParams {
    /// Parameters whose callbacks all do nothing.
    pub fn new(topic_path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic_path: topic_path.into(),
            value: value.into(),
            on_success: Box::new(|_| {}),
            on_failure: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
            on_discard: Box::new(|_| {}),
        }
    }

    pub fn on_success(mut self, f: impl FnOnce(()) + Send + 'static) -> Self {
        self.on_success = Box::new(f);
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(UpdateStatus) + Send + 'static) -> Self {
        self.on_failure = Box::new(f);
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(ServiceError) + Send + 'static) -> Self {
        self.on_error = Box::new(f);
        self
    }

    pub fn on_discard(mut self, f: impl FnOnce(DiscardReason) + Send + 'static) -> Self {
        self.on_discard = Box::new(f);
        self
    }
}

/// Update a topic through `source`, reporting through callbacks.
///
/// # Errors
///
/// Argument and closed-session failures are returned at once and no
/// callback runs.
pub fn update_value(source: &UpdateSource, params: UpdateValueParams) -> Result<()> {
    let UpdateValueParams {
        topic_path,
        value,
        on_success,
        on_failure,
        on_error,
        on_discard,
    } = params;

    source.submit(UpdateKind::Set, &topic_path, value, move |result| match result {
        Ok(UpdateStatus::Ok) => on_success(()),
        Ok(status) => on_failure(status),
        Err(SessionError::Service(error)) => on_error(error),
        Err(SessionError::Discarded(reason)) => on_discard(reason),
        Err(other) => {
            tracing::warn!(error = %other, "Update response not understood");
            on_failure(UpdateStatus::UpdateFailed)
        }
    })
}
