//! Interfaces to the remote write and read APIs.
//!
//! The core never looks inside payloads or values; it only hands them to
//! these collaborators.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// A write handed to the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
  /// Idempotency key. Retries of the same action reuse it.
  pub id: String,
  pub kind: String,
  pub payload: Value,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("send failed: {0}")]
pub struct SendError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fetch failed: {0}")]
pub struct FetchError(pub String);

/// Remote write API. Must tolerate a retried request with the same id.
#[async_trait]
pub trait WriteApi: Send + Sync {
  async fn send(&self, request: &WriteRequest) -> Result<(), SendError>;
}

/// Remote read API.
#[async_trait]
pub trait ReadApi: Send + Sync {
  async fn fetch(&self, key: &str) -> Result<Value, FetchError>;
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), SendError>> + Send + Sync>;

/// Write API that dispatches on `kind` to registered handlers.
///
/// A kind with no handler fails delivery, so it is retried and eventually
/// dead-lettered like any other failure.
#[derive(Default)]
pub struct HandlerRegistry {
  handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register (or replace) the handler for an action kind.
  pub fn register<F, Fut>(&self, kind: &str, handler: F)
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SendError>> + Send + 'static,
  {
    let handler: Handler = Arc::new(
      move |payload: Value| -> BoxFuture<'static, Result<(), SendError>> {
        Box::pin(handler(payload))
      },
    );
    if let Ok(mut handlers) = self.handlers.write() {
      handlers.insert(kind.to_string(), handler);
    }
  }

  pub fn kinds(&self) -> Vec<String> {
    let mut kinds: Vec<String> = self
      .handlers
      .read()
      .map(|h| h.keys().cloned().collect())
      .unwrap_or_default();
    kinds.sort();
    kinds
  }
}

#[async_trait]
impl WriteApi for HandlerRegistry {
  async fn send(&self, request: &WriteRequest) -> Result<(), SendError> {
    let handler = self
      .handlers
      .read()
      .ok()
      .and_then(|h| h.get(&request.kind).cloned());

    match handler {
      Some(handler) => handler(request.payload.clone()).await,
      None => Err(SendError(format!(
        "no handler for action kind '{}'",
        request.kind
      ))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn request(kind: &str) -> WriteRequest {
    WriteRequest {
      id: "1".into(),
      kind: kind.into(),
      payload: json!({ "eventId": 7 }),
    }
  }

  #[tokio::test]
  async fn test_registry_dispatches_by_kind() {
    let registry = HandlerRegistry::new();
    registry.register("participate", |payload| async move {
      if payload["eventId"] == 7 {
        Ok(())
      } else {
        Err(SendError("wrong event".into()))
      }
    });
    registry.register("cancel_participation", |_| async {
      Err(SendError("closed".into()))
    });

    assert_eq!(registry.kinds(), vec!["cancel_participation", "participate"]);
    assert!(registry.send(&request("participate")).await.is_ok());
    assert_eq!(
      registry.send(&request("cancel_participation")).await,
      Err(SendError("closed".into()))
    );
  }

  #[tokio::test]
  async fn test_unknown_kind_fails() {
    let registry = HandlerRegistry::new();
    let err = registry.send(&request("update_profile")).await.unwrap_err();
    assert!(err.0.contains("update_profile"));
  }
}
