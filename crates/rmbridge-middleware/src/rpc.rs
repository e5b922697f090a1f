//! Request/response operations on keys.
//!
//! Every operation comes in three flavours built on the same primitive
//! (send a key request, complete it when the reply with the same tag
//! arrives):
//!
//! | Flavour | Example | Waits with |
//! |---|---|---|
//! | callback | [`Bridge::get_key_value`] | nothing; the callback runs on the delivery thread |
//! | blocking | [`Bridge::get_key_value_sync`] | `Condvar::wait_timeout_while` |
//! | `async` | [`Bridge::get_key_value_async`] | `tokio::sync::oneshot` + `tokio::time::timeout` |
//!
//! Blocking and `async` variants drop their request bookkeeping when they
//! give up, so a timed-out call leaves nothing behind. Failures raised on
//! this side (timeout, bridge stopped) reach them as the matching
//! [`BridgeError`]; callbacks get them folded into a [`KeyResult`] whose
//! tag is `0`.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use rmbridge_types::{BridgeError, EventType, Key, KeyResult, Value};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bridge::{Bridge, Completion, check_access};

type Reply = Result<KeyResult, BridgeError>;

#[derive(Default)]
struct ReplySlot {
    reply: Mutex<Option<Reply>>,
    ready: Condvar,
}

impl ReplySlot {
    fn fill(&self, reply: Reply) {
        *self.reply.lock().unwrap_or_else(PoisonError::into_inner) = Some(reply);
        self.ready.notify_all();
    }
}

fn callback_completion<F>(key: Key, callback: F) -> Completion
where
    F: FnOnce(KeyResult) + Send + 'static,
{
    Box::new(move |reply: Reply| {
        callback(reply.unwrap_or_else(|e| KeyResult::from_error(Some(key), 0, &e)));
    })
}

/// `{"value": …}`, the shape the device expects for written values.
fn wrap(value: &Value) -> String {
    json!({ "value": value.to_json() }).to_string()
}

fn acknowledged(result: KeyResult) -> Result<(), BridgeError> {
    result.into_value().map(|_| ())
}

impl Bridge {
    // ─── Get ───────────────────────────────────────────────────────────────

    /// Request the current value of `key`; `callback` receives the result.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] or [`BridgeError::AccessDenied`]; the
    /// callback is not called in either case.
    pub fn get_key_value<F>(&self, key: Key, callback: F) -> Result<(), BridgeError>
    where
        F: FnOnce(KeyResult) + Send + 'static,
    {
        check_access(key, key.is_readable(), "get")?;
        self.inner
            .send_key_request(EventType::GetValue, key, None, callback_completion(key, callback))?;
        Ok(())
    }

    /// Fetch the current result for `key`, blocking until the reply arrives.
    ///
    /// With `use_cache`, a result already cached from a subscription is
    /// returned without a round trip. A reply with a non-zero error code is
    /// returned as-is; use [`Bridge::get_key_value_sync`] to have it turned
    /// into an error.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Timeout`] when no reply arrives within the configured
    /// request timeout, [`BridgeError::NotConnected`] before start.
    pub fn get_key_result_sync(&self, key: Key, use_cache: bool) -> Result<KeyResult, BridgeError> {
        check_access(key, key.is_readable(), "get")?;
        if use_cache {
            if let Some(cached) = self.cached(key) {
                debug!(%key, "answered from cache");
                return Ok(cached);
            }
        }
        self.request_sync(EventType::GetValue, key, None)
    }

    /// Blocking get that returns the decoded value.
    ///
    /// # Errors
    ///
    /// As [`Bridge::get_key_result_sync`], plus [`BridgeError::RemoteError`]
    /// when the device reports a failure.
    pub fn get_key_value_sync(&self, key: Key, use_cache: bool) -> Result<Value, BridgeError> {
        self.get_key_result_sync(key, use_cache)?.into_value()
    }

    pub async fn get_key_value_async(&self, key: Key) -> Result<Value, BridgeError> {
        check_access(key, key.is_readable(), "get")?;
        self.request_async(EventType::GetValue, key, None).await?.into_value()
    }

    // ─── Set ───────────────────────────────────────────────────────────────

    pub fn set_key_value<F>(&self, key: Key, value: impl Into<Value>, callback: F) -> Result<(), BridgeError>
    where
        F: FnOnce(KeyResult) + Send + 'static,
    {
        check_access(key, key.is_writable(), "set")?;
        let payload = wrap(&value.into());
        self.inner
            .send_key_request(EventType::SetValue, key, Some(payload), callback_completion(key, callback))?;
        Ok(())
    }

    /// Write `value` to `key` and wait for the device to acknowledge it.
    ///
    /// # Errors
    ///
    /// [`BridgeError::RemoteError`] if the write is rejected,
    /// [`BridgeError::Timeout`] if it is never acknowledged.
    pub fn set_key_value_sync(&self, key: Key, value: impl Into<Value>) -> Result<(), BridgeError> {
        check_access(key, key.is_writable(), "set")?;
        let payload = wrap(&value.into());
        acknowledged(self.request_sync(EventType::SetValue, key, Some(payload))?)
    }

    pub async fn set_key_value_async(&self, key: Key, value: impl Into<Value>) -> Result<(), BridgeError> {
        check_access(key, key.is_writable(), "set")?;
        let payload = wrap(&value.into());
        acknowledged(self.request_async(EventType::SetValue, key, Some(payload)).await?)
    }

    // ─── Perform action ────────────────────────────────────────────────────

    pub fn perform_action<F>(&self, key: Key, payload: Option<Value>, callback: F) -> Result<(), BridgeError>
    where
        F: FnOnce(KeyResult) + Send + 'static,
    {
        check_access(key, key.is_actionable(), "perform action")?;
        let payload = payload.as_ref().map(wrap);
        self.inner
            .send_key_request(EventType::PerformAction, key, payload, callback_completion(key, callback))?;
        Ok(())
    }

    /// Trigger the action behind `key` and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// As [`Bridge::set_key_value_sync`].
    pub fn perform_action_sync(&self, key: Key, payload: Option<Value>) -> Result<(), BridgeError> {
        check_access(key, key.is_actionable(), "perform action")?;
        let payload = payload.as_ref().map(wrap);
        acknowledged(self.request_sync(EventType::PerformAction, key, payload)?)
    }

    pub async fn perform_action_async(&self, key: Key, payload: Option<Value>) -> Result<(), BridgeError> {
        check_access(key, key.is_actionable(), "perform action")?;
        let payload = payload.as_ref().map(wrap);
        acknowledged(self.request_async(EventType::PerformAction, key, payload).await?)
    }

    // ─── Waiting ───────────────────────────────────────────────────────────

    fn request_sync(&self, event_type: EventType, key: Key, payload: Option<String>) -> Result<KeyResult, BridgeError> {
        let slot = Arc::new(ReplySlot::default());
        let filler = Arc::clone(&slot);
        let sequence = self
            .inner
            .send_key_request(event_type, key, payload, Box::new(move |r| filler.fill(r)))?;

        let timeout = self.inner.config.request_timeout;
        let guard = slot.reply.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = slot
            .ready
            .wait_timeout_while(guard, timeout, |r| r.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        match guard.take() {
            Some(reply) => reply,
            None => {
                self.inner.cancel(sequence);
                warn!(%event_type, %key, ?timeout, "blocking request timed out");
                Err(BridgeError::timeout(format!("{event_type} reply for {key}"), timeout))
            }
        }
    }

    async fn request_async(&self, event_type: EventType, key: Key, payload: Option<String>) -> Result<KeyResult, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let sequence = self.inner.send_key_request(
            event_type,
            key,
            payload,
            Box::new(move |reply: Reply| {
                let _ = tx.send(reply);
            }),
        )?;

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BridgeError::NotConnected),
            Err(_) => {
                self.inner.cancel(sequence);
                warn!(%event_type, %key, ?timeout, "async request timed out");
                Err(BridgeError::timeout(format!("{event_type} reply for {key}"), timeout))
            }
        }
    }
}
